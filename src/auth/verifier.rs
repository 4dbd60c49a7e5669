//! Bearer credential verification.
//!
//! # Accepted Credentials
//!
//! HS256-signed JWTs carrying `sub`, `roles`, `iat` and `exp` claims. Optional
//! `iss` / `aud` checks are enabled when configured.
//!
//! # Time Checks
//!
//! Expiry is evaluated against the injected [`Clock`] rather than inside the
//! JWT library, so tests can move time and deployments can share one notion
//! of "now" with the rate limiter. A configurable leeway absorbs small clock
//! skew between the issuer and this process.
//!
//! Verification is a pure function of the credential, the key and the clock:
//! repeated failures with the same token always produce the same
//! `Unauthenticated` failure and never lock anyone out.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use tracing::{debug, warn};

use super::directory::UserDirectory;
use super::identity::{Claims, Identity};
use crate::clock::Clock;
use crate::failure::Failure;
use crate::metrics;

/// Authorization scheme accepted in the `Authorization` header.
pub const BEARER_SCHEME: &str = "Bearer";

/// Verification key material and claim expectations.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Shared HMAC secret
    pub secret: String,
    /// Required `iss` claim, if any
    pub issuer: Option<String>,
    /// Required `aud` claim, if any
    pub audience: Option<String>,
    /// Allowed clock skew for `exp` and `iat`
    pub leeway: Duration,
}

/// Why a credential was rejected. Used for logs and metrics only; clients
/// receive the generic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Missing,
    Malformed,
    BadSignature,
    Expired,
    NotYetValid,
    ClaimMismatch,
    UnknownSubject,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::Missing => "missing",
            Rejection::Malformed => "malformed",
            Rejection::BadSignature => "bad_signature",
            Rejection::Expired => "expired",
            Rejection::NotYetValid => "not_yet_valid",
            Rejection::ClaimMismatch => "claim_mismatch",
            Rejection::UnknownSubject => "unknown_subject",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Rejection::Missing => "Bearer credential required",
            Rejection::Expired => "Credential has expired",
            Rejection::UnknownSubject => "Credential subject no longer exists",
            _ => "Invalid credential",
        }
    }
}

impl From<Rejection> for Failure {
    fn from(rejection: Rejection) -> Self {
        metrics::record_auth_failure(rejection.as_str());
        Failure::unauthenticated(rejection.message())
    }
}

/// Validates bearer credentials and produces [`Identity`] values.
#[derive(Clone)]
pub struct CredentialVerifier {
    key: DecodingKey,
    validation: Validation,
    leeway: Duration,
    clock: Arc<dyn Clock>,
    directory: Option<Arc<dyn UserDirectory>>,
}

impl CredentialVerifier {
    pub fn new(config: &VerifierConfig, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Time claims are checked against our own clock in `check_times`.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        // jsonwebtoken only checks `iss` and `aud` when the token carries
        // them, so configured claims must also be required.
        let mut required = vec!["exp", "sub"];

        match &config.issuer {
            Some(issuer) => {
                validation.set_issuer(&[issuer.as_str()]);
                required.push("iss");
            }
            None => validation.iss = None,
        }
        match &config.audience {
            Some(audience) => {
                validation.set_audience(&[audience.as_str()]);
                required.push("aud");
            }
            None => validation.validate_aud = false,
        }
        validation.set_required_spec_claims(&required);

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            leeway: config.leeway,
            clock,
            directory: None,
        }
    }

    /// Re-resolve roles through an authoritative directory after verification.
    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Verify a credential and, when a directory is configured, replace its
    /// roles with the directory's current view of the subject.
    ///
    /// # Errors
    ///
    /// Everything [`verify`](Self::verify) rejects, plus `Unauthenticated`
    /// when the directory no longer knows the subject. A directory that
    /// cannot be reached yields `DependencyUnavailable`.
    pub async fn authenticate(&self, raw: &str) -> Result<Identity, Failure> {
        let identity = self.verify(raw)?;
        let Some(directory) = &self.directory else {
            return Ok(identity);
        };

        match directory.roles_for(identity.subject()).await {
            Ok(Some(roles)) => Ok(identity.with_roles(roles)),
            Ok(None) => {
                debug!(subject = %identity.subject(), "Subject not found in directory");
                Err(Failure::from(Rejection::UnknownSubject))
            }
            Err(e) => {
                warn!(error = %e, "User directory lookup failed");
                Err(Failure::dependency_unavailable("User directory").with_cause(e))
            }
        }
    }

    /// Verify a raw bearer credential.
    ///
    /// # Errors
    ///
    /// Returns an `Unauthenticated` failure when the credential is empty,
    /// malformed, carries an invalid signature, fails issuer/audience checks,
    /// is expired, or claims to be issued in the future.
    pub fn verify(&self, raw: &str) -> Result<Identity, Failure> {
        self.check(raw).map_err(|rejection| {
            debug!(reason = rejection.as_str(), "Credential rejected");
            Failure::from(rejection)
        })
    }

    fn check(&self, raw: &str) -> Result<Identity, Rejection> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Rejection::Missing);
        }
        if !is_well_formed(raw) {
            return Err(Rejection::Malformed);
        }

        let claims = decode::<Claims>(raw, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => Rejection::BadSignature,
                ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience
                | ErrorKind::InvalidSubject
                | ErrorKind::MissingRequiredClaim(_) => Rejection::ClaimMismatch,
                _ => Rejection::Malformed,
            })?;

        let (issued_at, expires_at) = self.check_times(&claims)?;
        if claims.sub.is_empty() {
            return Err(Rejection::ClaimMismatch);
        }

        let roles: BTreeSet<String> = claims.roles.into_iter().collect();
        Ok(Identity::new(claims.sub, roles, issued_at, expires_at))
    }

    fn check_times(&self, claims: &Claims) -> Result<(DateTime<Utc>, DateTime<Utc>), Rejection> {
        let issued_at = DateTime::from_timestamp(claims.iat, 0).ok_or(Rejection::Malformed)?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(Rejection::Malformed)?;
        let leeway = chrono::Duration::from_std(self.leeway).unwrap_or_default();
        let now = self.clock.now();

        if now > expires_at + leeway {
            return Err(Rejection::Expired);
        }
        if issued_at > now + leeway {
            return Err(Rejection::NotYetValid);
        }
        Ok((issued_at, expires_at))
    }
}

/// Three non-empty, dot-separated segments.
fn is_well_formed(raw: &str) -> bool {
    let mut segments = 0;
    for segment in raw.split('.') {
        if segment.is_empty() {
            return false;
        }
        segments += 1;
    }
    segments == 3
}

/// Extract the token from an `Authorization` header value.
///
/// The scheme comparison is case-insensitive (`bearer`, `Bearer`, `BEARER`).
/// Returns `None` for other schemes or an empty token.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::directory::StaticUserDirectory;
    use crate::auth::issuer::TokenIssuer;
    use crate::clock::ManualClock;
    use crate::failure::FailureKind;

    const SECRET: &str = "test-secret-key-at-least-32-characters-long";
    const NOW: i64 = 1_705_315_800;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::from_millis(NOW * 1_000))
    }

    fn config() -> VerifierConfig {
        VerifierConfig {
            secret: SECRET.to_string(),
            issuer: None,
            audience: None,
            leeway: Duration::from_secs(5),
        }
    }

    fn issuer(clock: Arc<ManualClock>) -> TokenIssuer {
        TokenIssuer::new(SECRET, Duration::from_secs(3600), clock)
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let clock = clock();
        let verifier = CredentialVerifier::new(&config(), clock.clone());
        let token = issuer(clock).issue("alice", &["analyst", "admin"]).unwrap();

        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.subject(), "alice");
        assert!(identity.has_role("analyst"));
        assert!(identity.has_role("admin"));
        assert_eq!(identity.issued_at().timestamp(), NOW);
        assert_eq!(identity.expires_at().timestamp(), NOW + 3600);
    }

    #[test]
    fn test_empty_credential_rejected() {
        let verifier = CredentialVerifier::new(&config(), clock());
        let failure = verifier.verify("   ").unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Unauthenticated);
    }

    #[test]
    fn test_malformed_credential_rejected() {
        let verifier = CredentialVerifier::new(&config(), clock());
        for raw in ["abc", "a.b", "a..c", "a.b.c.d", ".b.c", "a.b."] {
            let failure = verifier.verify(raw).unwrap_err();
            assert_eq!(failure.kind(), FailureKind::Unauthenticated, "{raw}");
        }
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let clock = clock();
        let verifier = CredentialVerifier::new(&config(), clock.clone());
        let forged = TokenIssuer::new(
            "another-secret-key-that-is-also-32-chars",
            Duration::from_secs(3600),
            clock,
        )
        .issue("mallory", &["admin"])
        .unwrap();

        assert_eq!(
            verifier.check(&forged).unwrap_err(),
            Rejection::BadSignature
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let clock = clock();
        let verifier = CredentialVerifier::new(&config(), clock.clone());
        let token = issuer(clock.clone()).issue("alice", &[]).unwrap();

        clock.advance(Duration::from_secs(3600 + 6));
        assert_eq!(verifier.check(&token).unwrap_err(), Rejection::Expired);
    }

    #[test]
    fn test_expiry_within_leeway_accepted() {
        let clock = clock();
        let verifier = CredentialVerifier::new(&config(), clock.clone());
        let token = issuer(clock.clone()).issue("alice", &[]).unwrap();

        clock.advance(Duration::from_secs(3600 + 3));
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn test_future_issued_token_rejected() {
        let clock = clock();
        let verifier = CredentialVerifier::new(&config(), clock.clone());
        let future = Arc::new(ManualClock::from_millis((NOW + 600) * 1_000));
        let token = issuer(future).issue("alice", &[]).unwrap();

        assert_eq!(verifier.check(&token).unwrap_err(), Rejection::NotYetValid);
    }

    #[test]
    fn test_issuer_mismatch_rejected() {
        let clock = clock();
        let verifier = CredentialVerifier::new(
            &VerifierConfig {
                issuer: Some("https://auth.example.com".to_string()),
                ..config()
            },
            clock.clone(),
        );
        let token = issuer(clock.clone()).issue("alice", &[]).unwrap();
        assert_eq!(verifier.check(&token).unwrap_err(), Rejection::ClaimMismatch);

        let wrong = issuer(clock.clone())
            .with_issuer(Some("https://other.example.com".to_string()))
            .issue("alice", &[])
            .unwrap();
        assert_eq!(verifier.check(&wrong).unwrap_err(), Rejection::ClaimMismatch);

        let right = issuer(clock)
            .with_issuer(Some("https://auth.example.com".to_string()))
            .issue("alice", &[])
            .unwrap();
        assert!(verifier.check(&right).is_ok());
    }

    fn audience_verifier(clock: Arc<ManualClock>) -> CredentialVerifier {
        CredentialVerifier::new(
            &VerifierConfig {
                audience: Some("reports-api".to_string()),
                ..config()
            },
            clock,
        )
    }

    /// Sign arbitrary claims with the test secret.
    fn sign(claims: &serde_json::Value) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            claims,
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_audience_missing_or_mismatched_rejected() {
        let clock = clock();
        let verifier = audience_verifier(clock.clone());

        let missing = issuer(clock.clone()).issue("alice", &[]).unwrap();
        assert_eq!(verifier.check(&missing).unwrap_err(), Rejection::ClaimMismatch);

        let wrong = issuer(clock.clone())
            .with_audience(Some("billing-api".to_string()))
            .issue("alice", &[])
            .unwrap();
        assert_eq!(verifier.check(&wrong).unwrap_err(), Rejection::ClaimMismatch);

        let right = issuer(clock)
            .with_audience(Some("reports-api".to_string()))
            .issue("alice", &[])
            .unwrap();
        assert!(verifier.check(&right).is_ok());
    }

    #[test]
    fn test_audience_list_claim() {
        let verifier = audience_verifier(clock());

        let listed = sign(&serde_json::json!({
            "sub": "alice",
            "iat": NOW,
            "exp": NOW + 600,
            "aud": ["billing-api", "reports-api"],
        }));
        assert!(verifier.check(&listed).is_ok());

        let unlisted = sign(&serde_json::json!({
            "sub": "alice",
            "iat": NOW,
            "exp": NOW + 600,
            "aud": ["billing-api"],
        }));
        assert_eq!(verifier.check(&unlisted).unwrap_err(), Rejection::ClaimMismatch);
    }

    #[test]
    fn test_repeated_failures_are_idempotent() {
        let verifier = CredentialVerifier::new(&config(), clock());
        let first = verifier.verify("not.a.token").unwrap_err();
        for _ in 0..20 {
            assert_eq!(verifier.verify("not.a.token").unwrap_err(), first);
        }
    }

    #[tokio::test]
    async fn test_directory_roles_replace_token_roles() {
        let clock = clock();
        let directory = Arc::new(StaticUserDirectory::new());
        directory.upsert("alice", &["viewer"]).await;
        let verifier =
            CredentialVerifier::new(&config(), clock.clone()).with_directory(directory);
        let token = issuer(clock).issue("alice", &["admin"]).unwrap();

        let identity = verifier.authenticate(&token).await.unwrap();
        assert!(identity.has_role("viewer"));
        assert!(!identity.has_role("admin"));
    }

    #[tokio::test]
    async fn test_directory_unknown_subject_is_unauthenticated() {
        let clock = clock();
        let verifier = CredentialVerifier::new(&config(), clock.clone())
            .with_directory(Arc::new(StaticUserDirectory::new()));
        let token = issuer(clock).issue("deleted-user", &["admin"]).unwrap();

        let failure = verifier.authenticate(&token).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Unauthenticated);
    }

    struct UnreachableDirectory;

    #[async_trait::async_trait]
    impl UserDirectory for UnreachableDirectory {
        async fn roles_for(&self, _subject: &str) -> anyhow::Result<Option<BTreeSet<String>>> {
            anyhow::bail!("directory connection refused")
        }
    }

    #[tokio::test]
    async fn test_directory_outage_is_dependency_unavailable() {
        let clock = clock();
        let verifier = CredentialVerifier::new(&config(), clock.clone())
            .with_directory(Arc::new(UnreachableDirectory));
        let token = issuer(clock).issue("alice", &["admin"]).unwrap();

        let failure = verifier.authenticate(&token).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::DependencyUnavailable);
        assert!(!failure.message().contains("refused"));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("bearer   abc.def.ghi "), Some("abc.def.ghi"));
        assert_eq!(bearer_token("BEARER x"), Some("x"));
        assert_eq!(bearer_token("Basic dXNlcjpwYXNz"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Bearer"), None);
    }
}
