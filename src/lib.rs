//! # Gatehouse
//!
//! A per-route resilience and access-control pipeline for Axum services:
//!
//! - **Authentication**: HS256 bearer credentials with leeway and optional
//!   user-directory role lookup
//! - **Authorization**: any-of role gates per route
//! - **Rate limiting**: fixed-window counters shared through Redis, with a
//!   configurable policy when the store fails
//! - **Circuit breaking**: per-dependency breakers with a rolling failure rate
//!   and a single half-open trial
//! - **Cache-aside reads**: TTL-bounded response caching with single-flight
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Layers (Request ID → Trace → CORS)                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (RequestContext extractor)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline: Authorize → RateLimit → CircuitBreaker → Cache   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Stores (Redis / in-memory)     Dependencies (reports, notifier)
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use gatehouse::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::from_config(config.clone()).await?;
//!     let app = build_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod failure;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod resilience;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use failure::{Failure, FailureKind, Outcome};
pub use pipeline::{Pipeline, RequestContext, RoutePolicy, Stage};
pub use routes::build_router;
pub use state::AppState;
