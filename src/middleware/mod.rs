//! HTTP edge: turning an axum request into a pipeline [`RequestContext`].
//!
//! ```text
//! Request → TraceLayer → SetRequestId → Handler(RequestContext) → PropagateRequestId → Response
//!                                              │
//!                                 ConnectInfo + trusted proxies → client IP
//! ```
//!
//! Client IPs come from proxy headers only when the TCP peer is a trusted
//! proxy. See [`ip`] for the trust model.
//!
//! [`RequestContext`]: crate::pipeline::RequestContext

pub mod context;
pub mod ip;

pub use context::REQUEST_ID_HEADER;
pub use ip::{CidrRange, TrustedProxies, UNKNOWN_IP, resolve_client_ip};
