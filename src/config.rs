//! Application configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables (or a `.env` file)
//! with development defaults. The only required variable is `JWT_SECRET`.
//!
//! # Shared Store
//!
//! - `REDIS_URL`: when set, rate-limit counters and cached responses live in
//!   Redis and are shared across instances. When absent, in-process stores
//!   are used and limits apply per instance.
//!
//! # Resilience Tuning
//!
//! - `RATE_LIMIT_FAILURE_POLICY`: `open` (default), `closed` or `local`
//! - `BREAKER_FAILURE_RATE`: percentage of failed calls that opens a breaker (default: 50)
//! - `BREAKER_RESET_TIMEOUT_SECS`: time open before a trial (default: 30)

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::VerifierConfig;
use crate::error::{AppError, AppResult};
use crate::resilience::{CircuitBreakerConfig, RateLimitPolicy, StoreFailurePolicy};

/// Minimum HMAC secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

/// Application configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Credential Verification
    // =========================================================================
    /// HMAC secret for HS256 tokens (required, at least 32 bytes)
    pub jwt_secret: String,

    /// Required `iss` claim (optional)
    pub jwt_issuer: Option<String>,

    /// Required `aud` claim (optional)
    pub jwt_audience: Option<String>,

    /// Clock skew tolerated on `exp` and `iat` (default: 30s)
    pub jwt_leeway: Duration,

    // =========================================================================
    // Shared Store
    // =========================================================================
    /// Redis connection URL; `None` selects in-memory stores
    pub redis_url: Option<String>,

    /// Upper bound on any single store operation (default: 250ms)
    pub store_timeout: Duration,

    /// How often expired in-memory entries are swept (default: 60s)
    pub store_sweep_interval: Duration,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// Requests admitted per window per client (default: 100)
    pub rate_limit_requests: u32,

    /// Fixed window length (default: 60s)
    pub rate_limit_window: Duration,

    /// What to do when the counter store fails (default: open)
    pub rate_limit_failure_policy: StoreFailurePolicy,

    // =========================================================================
    // Circuit Breaker
    // =========================================================================
    /// Failure percentage (1-100) that opens a breaker (default: 50)
    pub breaker_failure_rate: f64,

    /// Outcomes required before the rate is evaluated (default: 10)
    pub breaker_min_samples: u32,

    /// Rolling window of most recent outcomes (default: 20)
    pub breaker_window_size: u32,

    /// Time open before a half-open trial (default: 30s)
    pub breaker_reset_timeout: Duration,

    /// Timeout applied to guarded dependency calls (default: 2s)
    pub dependency_timeout: Duration,

    // =========================================================================
    // Cache
    // =========================================================================
    /// Lifetime of cached responses (default: 30s)
    pub cache_ttl: Duration,

    /// Collapse concurrent misses for one key into a single fetch (default: true)
    pub cache_single_flight: bool,

    // =========================================================================
    // Dependencies and Security
    // =========================================================================
    /// Webhook endpoint for notifications; `None` logs them instead
    pub notifier_url: Option<String>,

    /// Comma-separated list of allowed CORS origins ("*" allows all)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges. Proxy headers are only believed when the
    /// TCP peer falls in one of these. Empty trusts every source.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability
    // =========================================================================
    /// Log level filter when `RUST_LOG` is unset (default: "info")
    pub log_level: String,

    /// Log output format (default: text)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("jwt_secret", &"<redacted>")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("rate_limit_requests", &self.rate_limit_requests)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("rate_limit_failure_policy", &self.rate_limit_failure_policy)
            .field("breaker_failure_rate", &self.breaker_failure_rate)
            .field("cache_ttl", &self.cache_ttl)
            .field("metrics_port", &self.metrics_port)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `JWT_SECRET` is missing or any value
    /// is malformed or inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,

            // Credentials
            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| AppError::ConfigError("JWT_SECRET is required".to_string()))?,
            jwt_issuer: Self::optional_env("JWT_ISSUER"),
            jwt_audience: Self::optional_env("JWT_AUDIENCE"),
            jwt_leeway: Duration::from_secs(Self::parse_env("JWT_LEEWAY_SECS", 30)?),

            // Store
            redis_url: Self::optional_env("REDIS_URL"),
            store_timeout: Duration::from_millis(Self::parse_env("STORE_TIMEOUT_MS", 250)?),
            store_sweep_interval: Duration::from_secs(Self::parse_env(
                "STORE_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Rate limiting
            rate_limit_requests: Self::parse_env(
                "RATE_LIMIT_REQUESTS",
                defaults.rate_limit_requests,
            )?,
            rate_limit_window: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_WINDOW_SECS",
                60,
            )?),
            rate_limit_failure_policy: Self::parse_env(
                "RATE_LIMIT_FAILURE_POLICY",
                defaults.rate_limit_failure_policy,
            )?,

            // Circuit breaker
            breaker_failure_rate: Self::parse_env(
                "BREAKER_FAILURE_RATE",
                defaults.breaker_failure_rate,
            )?,
            breaker_min_samples: Self::parse_env(
                "BREAKER_MIN_SAMPLES",
                defaults.breaker_min_samples,
            )?,
            breaker_window_size: Self::parse_env(
                "BREAKER_WINDOW_SIZE",
                defaults.breaker_window_size,
            )?,
            breaker_reset_timeout: Duration::from_secs(Self::parse_env(
                "BREAKER_RESET_TIMEOUT_SECS",
                30,
            )?),
            dependency_timeout: Duration::from_millis(Self::parse_env(
                "DEPENDENCY_TIMEOUT_MS",
                2000,
            )?),

            // Cache
            cache_ttl: Duration::from_secs(Self::parse_env("CACHE_TTL_SECS", 30)?),
            cache_single_flight: Self::parse_env("CACHE_SINGLE_FLIGHT", true)?,

            // Dependencies and security
            notifier_url: Self::optional_env("NOTIFIER_URL"),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Text)?,
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(AppError::ConfigError(format!(
                "JWT_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        if self.rate_limit_requests == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_REQUESTS must be greater than 0".to_string(),
            ));
        }

        let non_zero = [
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window),
            ("STORE_TIMEOUT_MS", self.store_timeout),
            ("STORE_SWEEP_INTERVAL_SECS", self.store_sweep_interval),
            ("BREAKER_RESET_TIMEOUT_SECS", self.breaker_reset_timeout),
            ("DEPENDENCY_TIMEOUT_MS", self.dependency_timeout),
            ("CACHE_TTL_SECS", self.cache_ttl),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| value.is_zero()) {
            return Err(AppError::ConfigError(format!(
                "{name} must be greater than 0"
            )));
        }

        if !(self.breaker_failure_rate > 0.0 && self.breaker_failure_rate <= 100.0) {
            return Err(AppError::ConfigError(format!(
                "BREAKER_FAILURE_RATE ({}) must be within (0, 100]",
                self.breaker_failure_rate
            )));
        }

        if self.breaker_min_samples == 0 {
            return Err(AppError::ConfigError(
                "BREAKER_MIN_SAMPLES must be greater than 0".to_string(),
            ));
        }

        if self.breaker_window_size < self.breaker_min_samples {
            return Err(AppError::ConfigError(format!(
                "BREAKER_WINDOW_SIZE ({}) must be >= BREAKER_MIN_SAMPLES ({})",
                self.breaker_window_size, self.breaker_min_samples
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            secret: self.jwt_secret.clone(),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
            leeway: self.jwt_leeway,
        }
    }

    /// Breaker settings applied to every dependency without an override.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: self.breaker_failure_rate / 100.0,
            minimum_samples: self.breaker_min_samples,
            window_size: self.breaker_window_size,
            reset_timeout: self.breaker_reset_timeout,
        }
    }

    /// Default per-client budget for routes that don't override it.
    pub fn rate_limit(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.rate_limit_requests, self.rate_limit_window)
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn optional_env(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Parse a comma-separated list, dropping blank entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            jwt_secret: "gatehouse-development-secret-not-for-production".to_string(),
            jwt_issuer: None,
            jwt_audience: None,
            jwt_leeway: Duration::from_secs(30),
            redis_url: None,
            store_timeout: Duration::from_millis(250),
            store_sweep_interval: Duration::from_secs(60),
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_failure_policy: StoreFailurePolicy::FailOpen,
            breaker_failure_rate: 50.0,
            breaker_min_samples: 10,
            breaker_window_size: 20,
            breaker_reset_timeout: Duration::from_secs(30),
            dependency_timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(30),
            cache_single_flight: true,
            notifier_url: None,
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.redis_url.is_none());
        assert_eq!(config.rate_limit_failure_policy, StoreFailurePolicy::FailOpen);
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "192.168.1.1".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "192.168.1.1:8080");
    }

    #[test]
    fn test_short_secret_rejected() {
        let config = Config {
            jwt_secret: "too-short".to_string(),
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = Config {
            cache_ttl: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("CACHE_TTL_SECS"));

        let config = Config {
            store_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("STORE_TIMEOUT_MS"));
    }

    #[test]
    fn test_breaker_rate_bounds() {
        for rate in [0.0, -5.0, 100.5, f64::NAN] {
            let config = Config {
                breaker_failure_rate: rate,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "rate {rate} should be rejected");
        }

        let config = Config {
            breaker_failure_rate: 100.0,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_smaller_than_min_samples_rejected() {
        let config = Config {
            breaker_min_samples: 10,
            breaker_window_size: 5,
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("BREAKER_WINDOW_SIZE"));
    }

    #[test]
    fn test_breaker_config_converts_percentage() {
        let config = Config {
            breaker_failure_rate: 25.0,
            ..Config::default()
        };
        let breaker = config.breaker_config();
        assert!((breaker.failure_rate_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(breaker.minimum_samples, 10);
    }

    #[test]
    fn test_metrics_addr() {
        assert!(Config::default().metrics_addr().is_some());

        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", Config::default());
        assert!(!rendered.contains("gatehouse-development-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
