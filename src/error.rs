use thiserror::Error;

/// Startup and configuration errors.
///
/// Request-time problems never use this type; they are expressed as
/// [`Failure`](crate::failure::Failure) values so that every request ends in
/// exactly one classified outcome.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to connect to shared store: {0}")]
    StoreConnection(String),

    #[error("Failed to sign credential: {0}")]
    Signing(String),

    #[error("Invalid route policy: {0}")]
    Policy(#[from] crate::pipeline::PolicyError),

    #[error("Metrics initialization failed: {0}")]
    Metrics(String),
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
