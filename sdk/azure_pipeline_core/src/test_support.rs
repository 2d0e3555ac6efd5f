//! Test helpers shared by this crate's tests and sibling crates.
//!
//! Enabled for unit tests and by the `test-support` feature.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use url::Url;
use wiremock::MockServer;

use crate::client::Client;
use crate::credential::StaticTokenCredential;
use crate::error::PipelineResult;
use crate::request::Request;
use crate::response::Response;
use crate::retry::RetryOptions;
use crate::transport::Transport;

/// A request as seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

type Responder = dyn Fn(&RecordedRequest, usize) -> PipelineResult<Response> + Send + Sync;

/// An in-process [`Transport`] that records every request and answers
/// from a closure given the request and its zero-based index.
pub struct MockTransport {
    responder: Box<Responder>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RecordedRequest, usize) -> PipelineResult<Response> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer with each status in turn, repeating the last one.
    pub fn with_statuses(statuses: Vec<u16>) -> Self {
        Self::new(move |_request, index| {
            let code = statuses
                .get(index)
                .or_else(|| statuses.last())
                .copied()
                .unwrap_or(200);
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
            Ok(Response::new(status, HeaderMap::new(), Bytes::new()))
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &mut Request) -> PipelineResult<Response> {
        let body = match request.body_mut() {
            Some(body) => body.read_to_bytes().await?,
            None => Bytes::new(),
        };
        let recorded = RecordedRequest {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
        };
        let index = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(recorded.clone());
            requests.len() - 1
        };
        (self.responder)(&recorded, index)
    }
}

/// Retry options with millisecond delays so tests finish quickly.
pub fn fast_retry_options() -> RetryOptions {
    RetryOptions {
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        ..RetryOptions::default()
    }
}

/// A [`Client`] pointed at `server`, authenticated with a static test token.
pub fn setup_mock_client(server: &MockServer) -> Client {
    Client::builder()
        .endpoint(server.uri())
        .credential(Arc::new(StaticTokenCredential::new("test-token")))
        .scopes(["https://management.azure.com/.default"])
        .retry_options(fast_retry_options())
        .build()
        .expect("mock client should build")
}
