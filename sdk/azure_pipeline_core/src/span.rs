//! Distributed-tracing spans around each request.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::field::Empty;
use tracing::Instrument;

use crate::context::Context;
use crate::error::PipelineResult;
use crate::logging::{redacted_url, DEFAULT_ALLOWED_QUERY_PARAMS};
use crate::pipeline::{Policy, PolicyFactory};
use crate::request::Request;
use crate::request_id::CLIENT_REQUEST_ID;
use crate::response::Response;

/// Header carrying the service-assigned request ID.
pub const SERVICE_REQUEST_ID: &str = "x-ms-request-id";

/// Opens an `http.request` span for the rest of the pipeline and records
/// the outcome on it.
#[derive(Debug)]
pub struct TracingPolicy {
    next: Arc<dyn Policy>,
}

impl TracingPolicy {
    pub fn new(next: Arc<dyn Policy>) -> Self {
        Self { next }
    }

    pub fn factory() -> Arc<dyn PolicyFactory> {
        Arc::new(|next: Arc<dyn Policy>| -> Arc<dyn Policy> { Arc::new(TracingPolicy::new(next)) })
    }
}

#[async_trait]
impl Policy for TracingPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        let span = tracing::info_span!(
            "http.request",
            http.method = %request.method(),
            http.url = %redacted_url(request.url(), DEFAULT_ALLOWED_QUERY_PARAMS),
            request_id = Empty,
            http.status_code = Empty,
            service_request_id = Empty,
        );
        if let Some(id) = request.header(CLIENT_REQUEST_ID) {
            span.record("request_id", id);
        }

        let result = self.next.send(ctx, request).instrument(span.clone()).await;

        match &result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                if let Some(id) = response.header_str(SERVICE_REQUEST_ID) {
                    span.record("service_request_id", id);
                }
            }
            Err(err) => {
                span.in_scope(|| tracing::warn!(error = %err, "operation failed"));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::pipeline::Pipeline;
    use crate::request_id::RequestIdPolicy;
    use crate::test_support::MockTransport;
    use reqwest::Method;
    use tracing_test::traced_test;
    use url::Url;

    #[tokio::test]
    #[traced_test]
    async fn failure_recorded_inside_request_span() {
        let transport = Arc::new(MockTransport::new(|_req, _n| {
            Err(Error::new(ErrorKind::Http {
                status: 502,
                message: "bad gateway".into(),
            }))
        }));
        let pipeline = Pipeline::new(
            transport,
            vec![RequestIdPolicy::factory(), TracingPolicy::factory()],
        );
        let mut request = Request::new(
            Method::DELETE,
            Url::parse("https://management.azure.com/x?api-version=1&token=abc").unwrap(),
        );

        let err = pipeline.send(&Context::new(), &mut request).await.unwrap_err();

        assert!(matches!(err.kind(), ErrorKind::Http { status: 502, .. }));
        assert!(logs_contain("http.request"));
        assert!(logs_contain("operation failed"));
        assert!(logs_contain("http.method=DELETE"));
        assert!(logs_contain("request_id="));
        assert!(!logs_contain("token=abc"));
    }

    #[tokio::test]
    async fn success_passes_response_through() {
        let transport = Arc::new(MockTransport::with_statuses(vec![204]));
        let pipeline = Pipeline::new(transport.clone(), vec![TracingPolicy::factory()]);
        let mut request = Request::new(Method::GET, Url::parse("https://example.com/").unwrap());

        let response = pipeline.send(&Context::new(), &mut request).await.unwrap();

        assert_eq!(response.status().as_u16(), 204);
        assert_eq!(transport.request_count(), 1);
    }
}
