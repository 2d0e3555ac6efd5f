//! The policy chain every request travels through.
//!
//! A [`Pipeline`] is an ordered chain of [`Policy`] objects that ends at a
//! [`Transport`]. Each policy holds the next one and decides whether, when
//! and how often to call it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use azure_pipeline_core::pipeline::{Pipeline, PolicyFactory};
//! use azure_pipeline_core::request_id::RequestIdPolicy;
//! use azure_pipeline_core::retry::{RetryOptions, RetryPolicy};
//! use azure_pipeline_core::transport::DefaultTransport;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(DefaultTransport::new()?);
//! let factories: Vec<Arc<dyn PolicyFactory>> = vec![
//!     RequestIdPolicy::factory(),
//!     RetryPolicy::factory(RetryOptions::default()),
//! ];
//! let pipeline = Pipeline::new(transport, factories);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::PipelineResult;
use crate::request::Request;
use crate::response::Response;
use crate::transport::{Transport, TransportPolicy};

/// One link in the pipeline.
///
/// A policy may change the request, call the next policy zero or more times,
/// and inspect or replace the response. Returning an error short-circuits the
/// policies after it.
#[async_trait]
pub trait Policy: Send + Sync + fmt::Debug {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response>;
}

/// Creates a policy wrapped around the next policy in the chain.
///
/// Any `Fn(Arc<dyn Policy>) -> Arc<dyn Policy>` closure is a factory.
pub trait PolicyFactory: Send + Sync {
    fn create(&self, next: Arc<dyn Policy>) -> Arc<dyn Policy>;
}

impl<F> PolicyFactory for F
where
    F: Fn(Arc<dyn Policy>) -> Arc<dyn Policy> + Send + Sync,
{
    fn create(&self, next: Arc<dyn Policy>) -> Arc<dyn Policy> {
        self(next)
    }
}

/// An immutable, cheaply cloneable chain of policies.
#[derive(Clone, Debug)]
pub struct Pipeline {
    head: Arc<dyn Policy>,
}

impl Pipeline {
    /// Build the chain once. `factories` are listed outermost first; the
    /// transport sits after the last one.
    pub fn new(transport: Arc<dyn Transport>, factories: Vec<Arc<dyn PolicyFactory>>) -> Self {
        let mut next: Arc<dyn Policy> = Arc::new(TransportPolicy::new(transport));
        for factory in factories.iter().rev() {
            next = factory.create(next);
        }
        Self { head: next }
    }

    /// Send `request` through every policy and the transport.
    pub async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        self.head.send(ctx, request).await
    }
}
