#![doc = include_str!("../README.md")]

pub mod auth;
pub mod client;
pub mod context;
pub mod credential;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod request;
pub mod request_id;
pub mod response;
pub mod retry;
pub mod span;
pub mod telemetry;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use client::Client;
pub use context::Context;
pub use error::{ContextError, Error, ErrorKind, PipelineResult};
pub use pipeline::{Pipeline, Policy, PolicyFactory};
pub use request::Request;
pub use response::Response;

// Re-exported so dependents share one HTTP vocabulary.
pub use reqwest::{header, Method, StatusCode};
pub use url::Url;
