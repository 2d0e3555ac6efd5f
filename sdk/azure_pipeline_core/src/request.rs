//! Outgoing HTTP requests and rewindable request bodies.

use std::fmt;
use std::io::SeekFrom;

use bytes::Bytes;
use reqwest::header::{AsHeaderName, HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use url::Url;

use crate::error::{Error, ErrorKind, PipelineResult};

/// An async byte source that can be rewound to its start.
///
/// Implemented for every `AsyncRead + AsyncSeek` type, such as
/// `std::io::Cursor<Vec<u8>>` or `tokio::fs::File`.
pub trait SeekableStream: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

impl<T> SeekableStream for T where T: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

/// A request payload that every try can transmit identically.
///
/// The body is owned by its [`Request`]. Policies and transports only borrow
/// it, so the underlying stream is released exactly once, when the request is
/// dropped after the final try.
pub enum RequestBody {
    Bytes(Bytes),
    Seekable(Box<dyn SeekableStream>),
}

impl RequestBody {
    /// Seek back to offset 0. A no-op for in-memory bodies.
    pub async fn rewind(&mut self) -> std::io::Result<()> {
        match self {
            Self::Bytes(_) => Ok(()),
            Self::Seekable(stream) => stream.seek(SeekFrom::Start(0)).await.map(|_| ()),
        }
    }

    /// Read the payload from the current position to the end.
    pub async fn read_to_bytes(&mut self) -> std::io::Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Seekable(stream) => {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "RequestBody::Bytes({} bytes)", bytes.len()),
            Self::Seekable(_) => write!(f, "RequestBody::Seekable"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// Method and URL of a request, kept on responses for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: Method,
    pub url: Url,
}

/// An HTTP request travelling through the pipeline.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set a header, replacing any existing value.
    pub fn insert_header(&mut self, name: HeaderName, value: &str) -> PipelineResult<()> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::new(ErrorKind::InvalidHeader(format!("{name}: {e}"))))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut RequestBody> {
        self.body.as_mut()
    }

    pub fn set_body(&mut self, body: impl Into<RequestBody>) {
        self.body = Some(body.into());
    }

    /// Use a seekable stream as the body.
    pub fn set_seekable_body(&mut self, stream: impl SeekableStream + 'static) {
        self.body = Some(RequestBody::Seekable(Box::new(stream)));
    }

    /// Serialize `value` as the JSON body and set `Content-Type`.
    pub fn set_json<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> PipelineResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(RequestBody::Bytes(Bytes::from(bytes)));
        Ok(())
    }

    /// Seek the body back to its start so the next try sends the full payload.
    pub async fn rewind_body(&mut self) -> PipelineResult<()> {
        if let Some(body) = &mut self.body {
            body.rewind().await?;
        }
        Ok(())
    }

    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}
