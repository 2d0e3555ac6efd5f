//! HTTP responses returned by the pipeline.

use std::fmt;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::{AsHeaderName, HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::{truncate_message, Error, ErrorKind, PipelineResult};
use crate::request::RequestInfo;

/// Millisecond retry hint sent by some Azure services.
pub const RETRY_AFTER_MS: &str = "retry-after-ms";

/// Vendor-prefixed millisecond retry hint.
pub const X_MS_RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";

type ByteStream = Pin<Box<dyn Stream<Item = PipelineResult<Bytes>> + Send>>;

enum Body {
    Buffered(Bytes),
    // Mutex only to make the response `Sync`; access goes through `get_mut`.
    Streaming(Mutex<ByteStream>),
}

/// An HTTP response together with the request it answers.
///
/// The body starts out streamed from the connection. Reading it with
/// [`bytes`](Self::bytes), [`json`](Self::json) or [`text`](Self::text)
/// buffers it, after which it can be read again.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    request: Option<RequestInfo>,
}

impl Response {
    /// Build a response with an in-memory body.
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: Body::Buffered(body.into()),
            request: None,
        }
    }

    /// Build a response whose body is read lazily from `stream`.
    pub fn from_stream<S>(status: StatusCode, headers: HeaderMap, stream: S) -> Self
    where
        S: Stream<Item = PipelineResult<Bytes>> + Send + 'static,
    {
        Self {
            status,
            headers,
            body: Body::Streaming(Mutex::new(Box::pin(stream))),
            request: None,
        }
    }

    pub(crate) fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from));
        Self::from_stream(status, headers, stream)
    }

    /// Record which request produced this response.
    #[must_use]
    pub fn with_request(mut self, request: RequestInfo) -> Self {
        self.request = Some(request);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Method and URL of the originating request, when known.
    pub fn request(&self) -> Option<&RequestInfo> {
        self.request.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string, if present and valid UTF-8.
    pub fn header_str(&self, name: impl AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Buffer the whole body and return it. Later calls return the same bytes.
    pub async fn bytes(&mut self) -> PipelineResult<Bytes> {
        let buffered = match &mut self.body {
            Body::Buffered(bytes) => return Ok(bytes.clone()),
            Body::Streaming(stream) => {
                let stream = stream.get_mut().unwrap_or_else(PoisonError::into_inner);
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                buf.freeze()
            }
        };
        self.body = Body::Buffered(buffered.clone());
        Ok(buffered)
    }

    pub async fn into_bytes(mut self) -> PipelineResult<Bytes> {
        self.bytes().await
    }

    /// Deserialize the body as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> PipelineResult<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read the body as text, replacing invalid UTF-8.
    pub async fn text(&mut self) -> PipelineResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read and discard the rest of the body so the connection can be reused.
    pub async fn drain(&mut self) {
        if let Body::Streaming(stream) = &mut self.body {
            let stream = stream.get_mut().unwrap_or_else(PoisonError::into_inner);
            while let Some(chunk) = stream.next().await {
                if chunk.is_err() {
                    break;
                }
            }
        }
        self.body = Body::Buffered(Bytes::new());
    }

    /// The delay the service asked for before the next try, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers, SystemTime::now())
    }

    /// Turn an unsuccessful response into an [`Error`] with the response attached.
    ///
    /// A JSON body of the form `{"error": {"code": ..., "message": ...}}`
    /// becomes [`ErrorKind::Api`]; anything else becomes [`ErrorKind::Http`].
    pub async fn into_error(mut self) -> Error {
        let status = self.status.as_u16();
        let body = match self.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };

        let kind = match service_error(&body) {
            Some((code, message)) => ErrorKind::Api {
                status,
                code,
                message: truncate_message(message.as_deref().unwrap_or(&body)),
            },
            None if body.trim().is_empty() => ErrorKind::Http {
                status,
                message: self
                    .status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
            },
            None => ErrorKind::Http {
                status,
                message: truncate_message(&body),
            },
        };

        Error::new(kind).with_response(self)
    }
}

fn service_error(body: &str) -> Option<(String, Option<String>)> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    let error = value.get("error")?;
    let code = error
        .get("code")
        .and_then(|c| c.as_str())
        .unwrap_or("unknown")
        .to_string();
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    Some((code, message))
}

/// Read the server's retry hint from `retry-after-ms`, `x-ms-retry-after-ms`
/// or `Retry-After` (delta-seconds or HTTP-date), in that order.
pub fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    for name in [RETRY_AFTER_MS, X_MS_RETRY_AFTER_MS] {
        let millis = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(millis) = millis {
            return Some(Duration::from_millis(millis));
        }
    }

    let raw_value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            Body::Buffered(bytes) => format!("{} bytes", bytes.len()),
            Body::Streaming(_) => "<stream>".to_string(),
        };
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("request", &self.request)
            .field("body", &body)
            .finish_non_exhaustive()
    }
}
