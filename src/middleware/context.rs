use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use super::ip::{TrustedProxies, resolve_client_ip};
use crate::pipeline::RequestContext;

/// Header set by the request-id layer.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Builds a [`RequestContext`] from the incoming request.
///
/// Never rejects: a missing credential is the pipeline's decision, not the
/// extractor's.
impl<S> FromRequestParts<S> for RequestContext
where
    Arc<TrustedProxies>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let trusted = Arc::<TrustedProxies>::from_ref(state);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let header = |name| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Ok(RequestContext {
            client_ip: resolve_client_ip(&parts.headers, peer, &trusted).into_owned(),
            authorization: header(AUTHORIZATION.as_str()),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            request_id: header(REQUEST_ID_HEADER),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[derive(Clone)]
    struct TestState {
        trusted: Arc<TrustedProxies>,
    }

    impl FromRef<TestState> for Arc<TrustedProxies> {
        fn from_ref(state: &TestState) -> Self {
            state.trusted.clone()
        }
    }

    #[tokio::test]
    async fn test_context_captures_request_facts() {
        let request = Request::builder()
            .uri("/reports/7?b=2&a=1")
            .header("authorization", "Bearer abc.def.ghi")
            .header("x-request-id", "req-123")
            .header("x-forwarded-for", "203.0.113.5")
            .body(())
            .unwrap();
        let (mut parts, ()) = request.into_parts();
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 4000))));

        let state = TestState {
            trusted: Arc::new(TrustedProxies::new(&["10.0.0.0/8".to_string()])),
        };
        let context = RequestContext::from_request_parts(&mut parts, &state)
            .await
            .unwrap();

        assert_eq!(context.client_ip, "203.0.113.5");
        assert_eq!(context.authorization.as_deref(), Some("Bearer abc.def.ghi"));
        assert_eq!(context.path, "/reports/7");
        assert_eq!(context.query.as_deref(), Some("b=2&a=1"));
        assert_eq!(context.request_id.as_deref(), Some("req-123"));
    }
}
