//! Exponential-backoff retries for transient failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{Error, PipelineResult};
use crate::pipeline::{Policy, PolicyFactory};
use crate::request::Request;
use crate::response::Response;

/// Default number of retries after the first try.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default time allowed for a single try (1 minute).
pub const DEFAULT_TRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default base delay between tries (4 seconds).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(4);

/// Default upper bound for any single delay (120 seconds).
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// HTTP status codes retried by default:
/// - 408 Request Timeout
/// - 500 Internal Server Error
/// - 502 Bad Gateway
/// - 503 Service Unavailable
/// - 504 Gateway Timeout
pub const STATUS_CODES_FOR_RETRY: &[u16] = &[408, 500, 502, 503, 504];

/// Determines if an HTTP status code is in the default retry set.
#[inline]
pub fn is_retriable_status(status: u16) -> bool {
    STATUS_CODES_FOR_RETRY.contains(&status)
}

/// Configuration for automatic retry behavior on transient errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Maximum number of retry attempts (not counting the initial request).
    pub max_retries: u32,
    /// Time allowed for any single try.
    pub try_timeout: Duration,
    /// Base delay; the delay before retry `n` is `(2^n - 1) * retry_delay`, jittered.
    pub retry_delay: Duration,
    /// Upper bound applied to every computed delay after jitter.
    pub max_retry_delay: Duration,
    /// Response status codes that trigger a retry.
    pub status_codes: Vec<u16>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            try_timeout: DEFAULT_TRY_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            status_codes: STATUS_CODES_FOR_RETRY.to_vec(),
        }
    }
}

impl RetryOptions {
    /// Set the retry count. Values below zero mean a single try.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = u32::try_from(max_retries).unwrap_or(0);
        self
    }

    #[must_use]
    pub fn with_try_timeout(mut self, try_timeout: Duration) -> Self {
        self.try_timeout = try_timeout;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn with_max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }

    #[must_use]
    pub fn with_status_codes(mut self, status_codes: impl Into<Vec<u16>>) -> Self {
        self.status_codes = status_codes.into();
        self
    }

    /// Backoff before retry number `attempt` (1-based), with jitter in `[0.8, 1.3)`.
    pub fn calc_delay(&self, attempt: u32) -> Duration {
        let jitter = 0.8 + fastrand::f64() / 2.0;
        self.delay_with_jitter(attempt, jitter)
    }

    /// Backoff for `attempt` scaled by an explicit jitter factor, capped at `max_retry_delay`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = 2_u32
            .checked_pow(attempt)
            .and_then(|pow| self.retry_delay.checked_mul(pow - 1));
        let Some(base) = base else {
            return self.max_retry_delay;
        };
        Duration::try_from_secs_f64(base.as_secs_f64() * jitter)
            .map_or(self.max_retry_delay, |delay| delay.min(self.max_retry_delay))
    }

    fn should_retry(&self, response: &Response) -> bool {
        self.status_codes.contains(&response.status().as_u16())
    }
}

/// Retries the rest of the pipeline on retriable statuses and errors.
///
/// Every try rewinds the request body and runs under a child context bounded
/// by [`RetryOptions::try_timeout`]. Options set on the [`Context`] with
/// [`Context::with_retry_options`] replace the policy's own for that call.
#[derive(Debug)]
pub struct RetryPolicy {
    options: RetryOptions,
    next: Arc<dyn Policy>,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions, next: Arc<dyn Policy>) -> Self {
        Self { options, next }
    }

    pub fn factory(options: RetryOptions) -> Arc<dyn PolicyFactory> {
        Arc::new(move |next: Arc<dyn Policy>| -> Arc<dyn Policy> {
            Arc::new(RetryPolicy::new(options.clone(), next))
        })
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        let options = ctx.retry_options().unwrap_or(&self.options);
        let mut attempt: u32 = 1;

        loop {
            // Also on the first try: the caller may hand over a stream that is not at offset 0.
            request.rewind_body().await?;
            tracing::debug!(
                attempt,
                method = %request.method(),
                url = %request.url(),
                "sending try"
            );

            let try_ctx = ctx.with_timeout(options.try_timeout);
            let result = self.next.send(&try_ctx, request).await;

            match &result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !options.should_retry(response) {
                        return result;
                    }
                    tracing::debug!(attempt, status, "retriable status");
                }
                Err(err) => tracing::debug!(attempt, error = %err, "try failed"),
            }

            if let Some(ctx_err) = ctx.err() {
                let err = Error::from(ctx_err);
                return Err(match result {
                    Ok(response) => err.with_response(response),
                    Err(_) => err,
                });
            }

            if let Err(err) = &result {
                if !err.is_retriable() {
                    return result;
                }
            }

            if attempt > options.max_retries {
                tracing::debug!(attempt, "retries exhausted");
                return result;
            }

            let delay = match result {
                Ok(mut response) => {
                    let hint = response.retry_after().filter(|d| !d.is_zero());
                    response.drain().await;
                    hint.unwrap_or_else(|| options.calc_delay(attempt))
                }
                Err(_) => options.calc_delay(attempt),
            };
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");

            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::Pipeline;
    use crate::test_support::MockTransport;
    use crate::transport::Transport;
    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::{Method, StatusCode};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    fn request() -> Request {
        Request::new(
            Method::PUT,
            Url::parse("https://management.azure.com/subscriptions/sub/resourceGroups/rg").unwrap(),
        )
    }

    fn pipeline(transport: Arc<dyn Transport>, options: RetryOptions) -> Pipeline {
        Pipeline::new(transport, vec![RetryPolicy::factory(options)])
    }

    fn fast() -> RetryOptions {
        RetryOptions::default()
            .with_retry_delay(Duration::from_millis(100))
            .with_max_retry_delay(Duration::from_secs(1))
    }

    #[test]
    fn identifies_retriable_http_errors() {
        assert!(is_retriable_status(408));
        assert!(is_retriable_status(500));
        assert!(is_retriable_status(502));
        assert!(is_retriable_status(503));
        assert!(is_retriable_status(504));

        assert!(!is_retriable_status(400));
        assert!(!is_retriable_status(401));
        assert!(!is_retriable_status(404));
        assert!(!is_retriable_status(409));
        assert!(!is_retriable_status(200));
    }

    #[test]
    fn default_retry_options() {
        let options = RetryOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.try_timeout, Duration::from_secs(60));
        assert_eq!(options.retry_delay, Duration::from_secs(4));
        assert_eq!(options.max_retry_delay, Duration::from_secs(120));
        assert_eq!(options.status_codes, vec![408, 500, 502, 503, 504]);
    }

    #[test]
    fn negative_max_retries_means_single_try() {
        assert_eq!(RetryOptions::default().with_max_retries(-5).max_retries, 0);
        assert_eq!(RetryOptions::default().with_max_retries(7).max_retries, 7);
    }

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let options = RetryOptions::default();
        assert_eq!(options.delay_with_jitter(1, 1.0), Duration::from_secs(4));
        assert_eq!(options.delay_with_jitter(2, 1.0), Duration::from_secs(12));
        assert_eq!(options.delay_with_jitter(3, 1.0), Duration::from_secs(28));
        assert_eq!(options.delay_with_jitter(1, 0.8), Duration::from_millis(3200));

        for attempt in 1..=3 {
            let base = options.delay_with_jitter(attempt, 1.0).as_secs_f64();
            for _ in 0..200 {
                let delay = options.calc_delay(attempt).as_secs_f64();
                assert!(delay >= base * 0.8 - 1e-9, "delay {delay} below lower bound");
                assert!(delay < base * 1.3 + 1e-9, "delay {delay} above upper bound");
            }
        }
    }

    #[test]
    fn delay_capped_after_jitter() {
        let options = RetryOptions::default();
        assert_eq!(options.delay_with_jitter(6, 1.29), Duration::from_secs(120));
        assert_eq!(options.delay_with_jitter(40, 1.0), Duration::from_secs(120));
        for _ in 0..100 {
            assert!(options.calc_delay(10) <= options.max_retry_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_bounded_by_max_retries() {
        let transport = Arc::new(MockTransport::with_statuses(vec![503]));
        let pipeline = pipeline(transport.clone(), fast());

        let response = pipeline.send(&Context::new(), &mut request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_one_try() {
        let transport = Arc::new(MockTransport::with_statuses(vec![500]));
        let pipeline = pipeline(transport.clone(), fast().with_max_retries(0));

        let response = pipeline.send(&Context::new(), &mut request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let transport = Arc::new(MockTransport::with_statuses(vec![503, 500, 200]));
        let pipeline = pipeline(transport.clone(), fast());

        let response = pipeline.send(&Context::new(), &mut request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_status_returned_immediately() {
        let transport = Arc::new(MockTransport::with_statuses(vec![404, 200]));
        let pipeline = pipeline(transport.clone(), fast());

        let response = pipeline.send(&Context::new(), &mut request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_error_short_circuits() {
        let transport = Arc::new(MockTransport::new(|_req, _n| {
            Err(Error::new(ErrorKind::Authentication("invalid client secret".into())))
        }));
        let pipeline = pipeline(transport.clone(), fast());

        let err = pipeline.send(&Context::new(), &mut request()).await.unwrap_err();

        assert!(matches!(err.kind(), ErrorKind::Authentication(_)));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retriable_errors_are_retried() {
        let transport = Arc::new(MockTransport::new(|_req, n| {
            if n < 2 {
                Err(Error::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )))
            } else {
                Ok(Response::new(StatusCode::OK, HeaderMap::new(), "done"))
            }
        }));
        let pipeline = pipeline(transport.clone(), fast());

        let response = pipeline.send(&Context::new(), &mut request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let transport = Arc::new(MockTransport::with_statuses(vec![503]));
        let options = RetryOptions::default().with_retry_delay(Duration::from_secs(10));
        let pipeline = pipeline(transport.clone(), options);

        let ctx = Context::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = pipeline.send(&ctx, &mut request()).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(transport.request_count(), 1);
        assert!(start.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_parent_does_not_retry_retriable_status() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let transport = Arc::new(MockTransport::new(move |_req, _n| {
            cancel.cancel();
            Ok(Response::new(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), "busy"))
        }));
        let pipeline = pipeline(transport.clone(), fast());

        let err = pipeline
            .send(&Context::with_cancellation(token), &mut request())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn body_rewound_before_every_try() {
        let transport = Arc::new(MockTransport::with_statuses(vec![503, 503, 200]));
        let pipeline = pipeline(transport.clone(), fast());

        let mut cursor = Cursor::new(b"{\"location\":\"westus\"}".to_vec());
        cursor.set_position(5);
        let mut request = request();
        request.set_seekable_body(cursor);

        pipeline.send(&Context::new(), &mut request).await.unwrap();

        let bodies: Vec<_> = transport.requests().into_iter().map(|r| r.body).collect();
        assert_eq!(bodies.len(), 3);
        for body in bodies {
            assert_eq!(body.as_ref(), b"{\"location\":\"westus\"}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn server_retry_after_is_honored() {
        let transport = Arc::new(MockTransport::new(|_req, n| {
            let mut headers = HeaderMap::new();
            if n == 0 {
                headers.insert("retry-after-ms", HeaderValue::from_static("5000"));
                return Ok(Response::new(StatusCode::SERVICE_UNAVAILABLE, headers, ""));
            }
            Ok(Response::new(StatusCode::OK, headers, ""))
        }));
        let pipeline = pipeline(transport.clone(), fast());

        let start = Instant::now();
        let response = pipeline.send(&Context::new(), &mut request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_options_override_policy_defaults() {
        let transport = Arc::new(MockTransport::with_statuses(vec![503]));
        let pipeline = pipeline(transport.clone(), fast());
        let ctx = Context::new().with_retry_options(fast().with_max_retries(1));

        pipeline.send(&ctx, &mut request()).await.unwrap();

        assert_eq!(transport.request_count(), 2);
    }

    #[derive(Debug, Default)]
    struct SlowFirstTry {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for SlowFirstTry {
        async fn send(&self, _request: &mut Request) -> PipelineResult<Response> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(Response::new(StatusCode::OK, HeaderMap::new(), ""))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn try_timeout_is_retriable() {
        let transport = Arc::new(SlowFirstTry::default());
        let pipeline = pipeline(
            transport.clone(),
            fast().with_try_timeout(Duration::from_secs(1)),
        );

        let response = pipeline.send(&Context::new(), &mut request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_deadline_ends_retries() {
        let transport = Arc::new(SlowFirstTry::default());
        let pipeline = pipeline(transport.clone(), fast());
        let ctx = Context::new().with_timeout(Duration::from_secs(2));

        let err = pipeline.send(&ctx, &mut request()).await.unwrap_err();

        assert!(err.is_deadline_exceeded());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
