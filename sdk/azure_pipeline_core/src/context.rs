//! Per-call cancellation, deadlines and option overrides.
//!
//! Every pipeline operation takes a [`Context`]. Cancelling its token or
//! reaching its deadline unblocks any policy that is waiting on the network,
//! sleeping between retries, or polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ContextError, PipelineResult};
use crate::retry::RetryOptions;

/// Cancellation, deadline and per-call overrides for a single operation.
///
/// Cloning a context shares its cancellation token. Child contexts created
/// with [`with_timeout`](Self::with_timeout) can only shorten the deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    retry_options: Option<RetryOptions>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context governed by an existing cancellation token.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            ..Self::default()
        }
    }

    /// Derive a child context that expires after `timeout`, or at the parent's deadline if sooner.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a child context that expires at `deadline`, or at the parent's deadline if sooner.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = self.deadline.map_or(deadline, |parent| parent.min(deadline));
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Override the retry policy's options for calls made with this context.
    #[must_use]
    pub fn with_retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = Some(options);
        self
    }

    pub fn retry_options(&self) -> Option<&RetryOptions> {
        self.retry_options.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancel this context and every context sharing its token.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Why this context is finished, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancellation.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => ContextError::Cancelled,
            () = deadline => ContextError::DeadlineExceeded,
        }
    }

    /// Sleep for `duration`, returning early if the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drive `future` to completion unless the context finishes first.
    pub async fn run<T, F>(&self, future: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err.into());
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err.into()),
            result = future => result,
        }
    }
}
