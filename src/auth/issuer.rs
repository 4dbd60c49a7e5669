use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use super::identity::{Audience, Claims};
use crate::clock::Clock;
use crate::error::{AppError, AppResult};

/// Signs HS256 bearer credentials accepted by [`CredentialVerifier`].
///
/// Used for local development (`gatehouse issue-token`), tests and fuzzing.
/// Production deployments normally receive tokens from an external issuer
/// sharing the same secret.
///
/// [`CredentialVerifier`]: super::CredentialVerifier
#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
    ttl: Duration,
    issuer: Option<String>,
    audience: Option<String>,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            ttl,
            issuer: None,
            audience: None,
            clock,
        }
    }

    pub fn with_issuer(mut self, issuer: Option<String>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    /// Sign a credential for `subject` with the given roles.
    pub fn issue(&self, subject: &str, roles: &[&str]) -> AppResult<String> {
        let iat = self.clock.now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);

        let claims = Claims {
            sub: subject.to_string(),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            iat,
            exp: iat.saturating_add(ttl),
            jti: Some(Uuid::new_v4().to_string()),
            iss: self.issuer.clone(),
            aud: self.audience.clone().map(Audience::One),
        };

        encode(&Header::default(), &claims, &self.key).map_err(|e| AppError::Signing(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_issued_token_has_three_segments() {
        let issuer = TokenIssuer::new(
            "test-secret-key-at-least-32-characters-long",
            Duration::from_secs(60),
            Arc::new(ManualClock::from_millis(0)),
        );
        let token = issuer.issue("svc-reporting", &["analyst"]).unwrap();
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn test_tokens_are_unique_per_issue() {
        let issuer = TokenIssuer::new(
            "test-secret-key-at-least-32-characters-long",
            Duration::from_secs(60),
            Arc::new(ManualClock::from_millis(0)),
        );
        let a = issuer.issue("alice", &[]).unwrap();
        let b = issuer.issue("alice", &[]).unwrap();
        assert_ne!(a, b);
    }
}
