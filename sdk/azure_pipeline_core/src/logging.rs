//! Request and response logging with header and query redaction.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use url::Url;

use crate::context::Context;
use crate::error::PipelineResult;
use crate::pipeline::{Policy, PolicyFactory};
use crate::request::Request;
use crate::response::Response;

const REDACTED: &str = "REDACTED";

/// Headers whose values are logged verbatim by default.
pub const DEFAULT_ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "cache-control",
    "connection",
    "content-length",
    "content-type",
    "date",
    "etag",
    "expires",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-unmodified-since",
    "last-modified",
    "location",
    "pragma",
    "request-id",
    "retry-after",
    "retry-after-ms",
    "server",
    "traceparent",
    "transfer-encoding",
    "user-agent",
    "www-authenticate",
    "x-ms-client-request-id",
    "x-ms-request-id",
    "x-ms-retry-after-ms",
    "x-ms-return-client-request-id",
];

/// Query parameters whose values are logged verbatim by default.
pub const DEFAULT_ALLOWED_QUERY_PARAMS: &[&str] = &["api-version"];

/// Configuration for [`LoggingPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    /// Header names (case-insensitive) logged with their values. `Authorization` is never logged.
    pub allowed_headers: Vec<String>,
    /// Query parameter names logged with their values.
    pub allowed_query_params: Vec<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            allowed_headers: DEFAULT_ALLOWED_HEADERS.iter().map(|h| h.to_string()).collect(),
            allowed_query_params: DEFAULT_ALLOWED_QUERY_PARAMS
                .iter()
                .map(|q| q.to_string())
                .collect(),
        }
    }
}

impl LoggingOptions {
    fn header_allowed(&self, name: &str) -> bool {
        name != AUTHORIZATION.as_str()
            && self
                .allowed_headers
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(name))
    }

    /// Render headers as `name: value` lines, redacting values not on the allow list.
    pub fn format_headers(&self, headers: &HeaderMap) -> String {
        let mut out = String::new();
        for (name, value) in headers {
            let value = if self.header_allowed(name.as_str()) {
                value.to_str().unwrap_or(REDACTED)
            } else {
                REDACTED
            };
            let _ = write!(out, "\n  {}: {}", name.as_str(), value);
        }
        out
    }
}

/// A copy of `url` with values of query parameters not in `allowed` replaced.
pub fn redacted_url<S: AsRef<str>>(url: &Url, allowed: &[S]) -> String {
    if url.query().is_none() {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| {
            let keep = allowed
                .iter()
                .any(|a| a.as_ref().eq_ignore_ascii_case(&name));
            let value = if keep { value.into_owned() } else { REDACTED.to_string() };
            (name.into_owned(), value)
        })
        .collect();
    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// Logs every try's request line and the response status with timing.
///
/// Requests and responses go out at `debug`, failures at `warn`.
#[derive(Debug)]
pub struct LoggingPolicy {
    options: LoggingOptions,
    next: Arc<dyn Policy>,
}

impl LoggingPolicy {
    pub fn new(options: LoggingOptions, next: Arc<dyn Policy>) -> Self {
        Self { options, next }
    }

    pub fn factory(options: LoggingOptions) -> Arc<dyn PolicyFactory> {
        Arc::new(move |next: Arc<dyn Policy>| -> Arc<dyn Policy> {
            Arc::new(LoggingPolicy::new(options.clone(), next))
        })
    }
}

#[async_trait]
impl Policy for LoggingPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        let url = redacted_url(request.url(), &self.options.allowed_query_params);
        tracing::debug!(
            method = %request.method(),
            url = %url,
            headers = %self.options.format_headers(request.headers()),
            "request"
        );

        let start = Instant::now();
        let result = self.next.send(ctx, request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => tracing::debug!(
                status = response.status().as_u16(),
                elapsed_ms,
                url = %url,
                headers = %self.options.format_headers(response.headers()),
                "response"
            ),
            Err(err) => tracing::warn!(
                error = %err,
                elapsed_ms,
                url = %url,
                "request failed"
            ),
        }
        result
    }
}
