//! Unique client request IDs.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

use crate::context::Context;
use crate::error::PipelineResult;
use crate::pipeline::{Policy, PolicyFactory};
use crate::request::Request;
use crate::response::Response;

/// Header carrying the client-generated request ID.
pub const CLIENT_REQUEST_ID: HeaderName = HeaderName::from_static("x-ms-client-request-id");

/// Sets `x-ms-client-request-id` to a fresh UUID unless the caller already set one.
///
/// Placed before the retry policy, so every try of one call shares an ID.
#[derive(Debug)]
pub struct RequestIdPolicy {
    next: Arc<dyn Policy>,
}

impl RequestIdPolicy {
    pub fn new(next: Arc<dyn Policy>) -> Self {
        Self { next }
    }

    pub fn factory() -> Arc<dyn PolicyFactory> {
        Arc::new(|next: Arc<dyn Policy>| -> Arc<dyn Policy> { Arc::new(RequestIdPolicy::new(next)) })
    }
}

#[async_trait]
impl Policy for RequestIdPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        if !request.headers().contains_key(&CLIENT_REQUEST_ID) {
            let id = uuid::Uuid::new_v4().to_string();
            // A hyphenated UUID is always a valid header value.
            if let Ok(value) = HeaderValue::from_str(&id) {
                request.headers_mut().insert(CLIENT_REQUEST_ID, value);
            }
        }
        self.next.send(ctx, request).await
    }
}
