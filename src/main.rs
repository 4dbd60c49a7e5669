use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatehouse::auth::TokenIssuer;
use gatehouse::clock::SystemClock;
use gatehouse::config::LogFormat;
use gatehouse::{AppState, Config, build_router, metrics, utils};

/// Gatehouse - authentication, rate limiting and circuit breaking in front of an API
#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the HTTP server (default)
    Serve,

    /// Print a signed bearer credential for local testing
    IssueToken {
        /// Subject (`sub` claim)
        subject: String,

        /// Roles granted to the subject
        roles: Vec<String>,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env before reading LOG_FORMAT; Config::from_env reads it again.
    let _ = dotenvy::dotenv();
    init_tracing();

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run().await,
        Command::IssueToken {
            subject,
            roles,
            ttl,
        } => issue_token(&subject, &roles, Duration::from_secs(ttl)),
    };

    match result {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Initialize logging from `RUST_LOG` and `LOG_FORMAT`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or_default();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Run the server, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    info!("Starting gatehouse v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        store = if config.redis_url.is_some() { "redis" } else { "memory" },
        log_format = %config.log_format,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    let state = AppState::from_config(config.clone()).await.map_err(|e| {
        error!("Failed to initialize application state: {e}");
        match e {
            gatehouse::AppError::StoreConnection(_) => exitcode::UNAVAILABLE,
            _ => exitcode::CONFIG,
        }
    })?;
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health                 - Health check");
    info!("  GET  /ready                  - Readiness check");
    info!("  GET  /me                     - Verified identity (any role)");
    info!("  GET  /reports/{{id}}           - Cached report (analyst, admin)");
    info!("  POST /notifications          - Send via notifier (operator, admin)");
    info!("  GET  /stats                  - Breakers and counters (admin)");
    info!("  POST /breakers/{{name}}/close  - Force-close a breaker (admin)");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Print a signed credential for local testing.
fn issue_token(subject: &str, roles: &[String], ttl: Duration) -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;

    let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
    let token = TokenIssuer::new(&config.jwt_secret, ttl, Arc::new(SystemClock))
        .with_issuer(config.jwt_issuer.clone())
        .with_audience(config.jwt_audience.clone())
        .issue(subject, &roles)
        .map_err(|e| {
            error!("{e}");
            exitcode::SOFTWARE
        })?;

    println!("{token}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["gatehouse"]).unwrap();
        assert_eq!(cli.command, None);

        let cli = Cli::try_parse_from(["gatehouse", "serve"]).unwrap();
        assert_eq!(cli.command, Some(Command::Serve));
    }

    #[test]
    fn test_issue_token_arguments() {
        let cli = Cli::try_parse_from([
            "gatehouse",
            "issue-token",
            "alice",
            "analyst",
            "admin",
            "--ttl",
            "600",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Some(Command::IssueToken {
                subject: "alice".to_string(),
                roles: vec!["analyst".to_string(), "admin".to_string()],
                ttl: 600,
            })
        );

        let cli = Cli::try_parse_from(["gatehouse", "issue-token", "svc"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::IssueToken { ref roles, ttl: 3600, .. }) if roles.is_empty()
        ));
    }

    #[test]
    fn test_issue_token_requires_subject() {
        assert!(Cli::try_parse_from(["gatehouse", "issue-token"]).is_err());
        assert!(Cli::try_parse_from(["gatehouse", "issue-token", "a", "--ttl", "soon"]).is_err());
    }
}
