//! The request-level failure contract shared by every pipeline stage.
//!
//! Each stage resolves its own problems into one [`Failure`] with a kind from a
//! closed set. The kind alone decides the HTTP status, so callers see a stable
//! status code per failure class regardless of which stage produced it.
//!
//! # Response Body
//!
//! ```json
//! { "message": "Too many requests", "errors": ["..."] }
//! ```
//!
//! The optional `cause` is logged server-side and never serialized.

use std::fmt;
use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Closed set of failure kinds a request can terminate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing, malformed, expired or unverifiable credential.
    Unauthenticated,
    /// Authenticated caller lacks every role the route accepts.
    Forbidden,
    /// Caller exceeded the route's request budget for the current window.
    RateLimited,
    /// Dependency is known to be down (open breaker) or a required store is unreachable.
    DependencyUnavailable,
    /// Dependency did not answer within the call timeout.
    DependencyTimeout,
    /// Dependency answered with an error.
    DependencyError,
    /// Request input was rejected before reaching the dependency.
    ValidationFailed,
    /// Requested resource does not exist.
    NotFound,
    /// Anything unclassified.
    Internal,
}

impl FailureKind {
    /// HTTP status code for this kind.
    pub fn status(self) -> StatusCode {
        match self {
            FailureKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            FailureKind::Forbidden => StatusCode::FORBIDDEN,
            FailureKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            FailureKind::DependencyUnavailable | FailureKind::DependencyTimeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FailureKind::DependencyError => StatusCode::BAD_GATEWAY,
            FailureKind::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            FailureKind::NotFound => StatusCode::NOT_FOUND,
            FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Unauthenticated => "unauthenticated",
            FailureKind::Forbidden => "forbidden",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::DependencyUnavailable => "dependency_unavailable",
            FailureKind::DependencyTimeout => "dependency_timeout",
            FailureKind::DependencyError => "dependency_error",
            FailureKind::ValidationFailed => "validation_failed",
            FailureKind::NotFound => "not_found",
            FailureKind::Internal => "internal",
        }
    }

    /// Whether this kind describes a downstream dependency problem.
    pub fn is_dependency(self) -> bool {
        matches!(
            self,
            FailureKind::DependencyUnavailable
                | FailureKind::DependencyTimeout
                | FailureKind::DependencyError
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: FailureKind,
    message: String,
    retry_after: Option<Duration>,
    errors: Vec<String>,
    cause: Option<String>,
}

impl Failure {
    /// Create a failure with a client-facing message.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            errors: Vec::new(),
            cause: None,
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Forbidden, message)
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::new(
            FailureKind::RateLimited,
            "Rate limit exceeded. Please retry later.",
        )
        .with_retry_after(retry_after)
    }

    pub fn dependency_unavailable(dependency: &str) -> Self {
        Self::new(
            FailureKind::DependencyUnavailable,
            format!("{dependency} is temporarily unavailable. Please try again later."),
        )
    }

    pub fn dependency_timeout(dependency: &str) -> Self {
        Self::new(
            FailureKind::DependencyTimeout,
            format!("{dependency} did not respond in time. Please try again."),
        )
    }

    pub fn dependency_error(dependency: &str, cause: impl fmt::Display) -> Self {
        Self::new(
            FailureKind::DependencyError,
            format!("{dependency} returned an error."),
        )
        .with_cause(cause)
    }

    pub fn validation(errors: Vec<String>) -> Self {
        let mut failure = Self::new(FailureKind::ValidationFailed, "Request validation failed");
        failure.errors = errors;
        failure
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn internal(cause: impl fmt::Display) -> Self {
        Self::new(
            FailureKind::Internal,
            "An internal error occurred. Please contact support if the issue persists.",
        )
        .with_cause(cause)
    }

    /// Attach a retry hint, surfaced as the `Retry-After` header.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach an internal cause. Logged, never returned to the client.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// `Retry-After` value in whole seconds, rounded up and never below 1.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

/// Round a duration up to whole seconds, with a floor of one second.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Error response body.
#[derive(Serialize)]
struct FailureBody<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "no_errors")]
    errors: &'a [String],
}

fn no_errors(errors: &&[String]) -> bool {
    errors.is_empty()
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(kind = %self.kind, cause = ?self.cause, "Request failed");
        } else {
            tracing::debug!(kind = %self.kind, "Request rejected");
        }

        let body = FailureBody {
            message: &self.message,
            errors: &self.errors,
        };
        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.retry_after_secs()
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        if self.kind == FailureKind::Unauthenticated {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }

        response
    }
}

/// Terminal result of running a request through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(Failure),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The failure, if the request failed.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
        }
    }
}

impl<T> From<Result<T, Failure>> for Outcome<T> {
    fn from(result: Result<T, Failure>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(failure) => Outcome::Failure(failure),
        }
    }
}

impl<T: Serialize> IntoResponse for Outcome<T> {
    fn into_response(self) -> Response {
        match self {
            Outcome::Success(value) => (StatusCode::OK, Json(value)).into_response(),
            Outcome::Failure(failure) => failure.into_response(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(FailureKind::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(FailureKind::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(FailureKind::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            FailureKind::DependencyUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            FailureKind::DependencyTimeout.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(FailureKind::DependencyError.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            FailureKind::Internal.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let failure = Failure::rate_limited(Duration::from_millis(1_500));
        assert_eq!(failure.retry_after_secs(), Some(2));

        let failure = Failure::rate_limited(Duration::from_millis(10));
        assert_eq!(failure.retry_after_secs(), Some(1));

        let failure = Failure::rate_limited(Duration::from_secs(60));
        assert_eq!(failure.retry_after_secs(), Some(60));
    }

    #[test]
    fn test_rate_limited_response_has_retry_after_header() {
        let response = Failure::rate_limited(Duration::from_secs(42)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_unauthenticated_response_has_challenge() {
        let response = Failure::unauthenticated("missing credential").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[test]
    fn test_body_never_contains_cause() {
        let failure = Failure::dependency_error("sms-gateway", "connection refused at 10.0.0.7");
        let body = FailureBody {
            message: failure.message(),
            errors: failure.errors(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("10.0.0.7"));
        assert!(!json.contains("errors"));
    }

    #[test]
    fn test_validation_body_lists_errors() {
        let failure = Failure::validation(vec!["message must not be empty".to_string()]);
        let body = FailureBody {
            message: failure.message(),
            errors: failure.errors(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"errors\":[\"message must not be empty\"]"));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Outcome<u32> = Ok(7).into();
        assert!(ok.is_success());

        let err: Outcome<u32> = Err(Failure::forbidden("nope")).into();
        assert_eq!(err.failure().unwrap().kind(), FailureKind::Forbidden);
    }
}
