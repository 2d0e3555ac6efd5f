//! Automatic resource provider registration.
//!
//! Resource Manager rejects requests for a provider the subscription is not
//! registered with using `409 Conflict` and the error code
//! `MissingSubscriptionRegistration`. [`RegistrationPolicy`] catches that
//! response, registers the provider, waits for the registration to finish
//! and replays the original request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azure_pipeline_core::auth::{AuthenticationOptions, BearerTokenPolicy, TokenCredential};
use azure_pipeline_core::logging::{LoggingOptions, LoggingPolicy};
use azure_pipeline_core::request_id::RequestIdPolicy;
use azure_pipeline_core::retry::{RetryOptions, RetryPolicy};
use azure_pipeline_core::transport::Transport;
use azure_pipeline_core::{
    Context, ContextError, Error, Pipeline, PipelineResult, Policy, PolicyFactory, Request,
    Response, StatusCode,
};
use serde::Deserialize;

use crate::providers::ProvidersClient;

/// Default number of registrations attempted per call.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default pause between registration state checks.
pub const DEFAULT_POLLING_DELAY: Duration = Duration::from_secs(15);

/// Default time to wait for a registration to complete.
pub const DEFAULT_POLLING_DURATION: Duration = Duration::from_secs(5 * 60);

/// Error code marking a request for an unregistered provider.
pub const MISSING_SUBSCRIPTION_REGISTRATION: &str = "MissingSubscriptionRegistration";

/// Configuration for [`RegistrationPolicy`].
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// Registrations attempted before giving up. `0` disables the policy.
    pub attempts: u32,
    /// Pause between registration state checks.
    pub polling_delay: Duration,
    /// How long to wait for one registration to reach `Registered`.
    pub polling_duration: Duration,
    /// Retry behaviour of the provider operations.
    pub retry: RetryOptions,
    /// Logging of the provider operations.
    pub logging: LoggingOptions,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            polling_delay: DEFAULT_POLLING_DELAY,
            polling_duration: DEFAULT_POLLING_DURATION,
            retry: RetryOptions::default(),
            logging: LoggingOptions::default(),
        }
    }
}

impl RegistrationOptions {
    /// Options that never register anything.
    pub fn disabled() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_polling_delay(mut self, delay: Duration) -> Self {
        self.polling_delay = delay;
        self
    }

    #[must_use]
    pub fn with_polling_duration(mut self, duration: Duration) -> Self {
        self.polling_duration = duration;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }
}

/// Failures of automatic provider registration.
///
/// Surfaced as [`ErrorKind::Policy`](azure_pipeline_core::ErrorKind::Policy)
/// with the `409` response that triggered registration attached. Use
/// [`Error::downcast_ref`] to inspect it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistrationError {
    /// The request path names no subscription.
    #[error("failed to obtain subscription ID from {path}")]
    SubscriptionNotFound { path: String },

    /// The conflict response names no provider namespace.
    #[error("failed to obtain resource provider namespace from the error details")]
    ProviderNotFound,

    /// The register call itself failed.
    #[error("failed to register resource provider {namespace}")]
    Register {
        namespace: String,
        #[source]
        source: Error,
    },

    /// The provider did not reach `Registered` before the polling deadline,
    /// or the call was cancelled while waiting.
    #[error("waiting for resource provider {namespace} to register: {source}")]
    Polling {
        namespace: String,
        #[source]
        source: ContextError,
    },

    /// The service kept answering `MissingSubscriptionRegistration` after every registration.
    #[error("exceeded attempts to register {namespace}")]
    AttemptsExceeded { namespace: String },
}

// Minimal shape of the conflict body, enough to detect the registration case.
#[derive(Debug, Deserialize)]
struct RequestError {
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    details: Vec<ServiceErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorDetail {
    #[serde(default)]
    target: String,
}

/// The registration error carried by a `409` body, if that is what it is.
fn missing_registration(body: &[u8]) -> Option<ServiceError> {
    let parsed: RequestError = serde_json::from_slice(body).ok()?;
    parsed
        .error
        .filter(|e| e.code.eq_ignore_ascii_case(MISSING_SUBSCRIPTION_REGISTRATION))
}

/// The segment after `subscriptions` in a request path.
pub fn subscription_id(path: &str) -> Option<&str> {
    let mut parts = path.split('/');
    while let Some(part) = parts.next() {
        if part.eq_ignore_ascii_case("subscriptions") {
            return parts.next().filter(|id| !id.is_empty());
        }
    }
    None
}

fn provider_namespace(error: &ServiceError) -> Option<&str> {
    error
        .details
        .first()
        .map(|detail| detail.target.as_str())
        .filter(|target| !target.is_empty())
}

/// Registers missing resource providers and replays the request.
///
/// Provider operations run on a dedicated pipeline (request ID, retry,
/// bearer token, logging) sharing the caller's transport.
pub struct RegistrationPolicy {
    pipeline: Pipeline,
    options: RegistrationOptions,
    next: Arc<dyn Policy>,
}

impl RegistrationPolicy {
    pub fn new(pipeline: Pipeline, options: RegistrationOptions, next: Arc<dyn Policy>) -> Self {
        Self {
            pipeline,
            options,
            next,
        }
    }

    /// Build the provider pipeline once and hand it to every policy instance.
    pub fn factory<I, S>(
        credential: Arc<dyn TokenCredential>,
        transport: Arc<dyn Transport>,
        scopes: I,
        options: RegistrationOptions,
    ) -> Arc<dyn PolicyFactory>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pipeline = Pipeline::new(
            transport,
            vec![
                RequestIdPolicy::factory(),
                RetryPolicy::factory(options.retry.clone()),
                BearerTokenPolicy::factory(credential, AuthenticationOptions::new(scopes)),
                LoggingPolicy::factory(options.logging.clone()),
            ],
        );
        Arc::new(move |next: Arc<dyn Policy>| -> Arc<dyn Policy> {
            Arc::new(RegistrationPolicy::new(
                pipeline.clone(),
                options.clone(),
                next,
            ))
        })
    }

    /// Poll the provider until it reports `Registered`.
    ///
    /// Failed polls are not fatal; only the polling deadline or cancellation ends the wait.
    async fn wait_for_registration(
        &self,
        ctx: &Context,
        providers: &ProvidersClient,
        subscription_id: &str,
        namespace: &str,
    ) -> Result<(), ContextError> {
        let poll_ctx = ctx.with_timeout(self.options.polling_duration);
        loop {
            match providers.get(&poll_ctx, subscription_id, namespace).await {
                Ok(provider) if provider.is_registered() => return Ok(()),
                Ok(provider) => {
                    tracing::trace!(state = ?provider.registration_state, "provider still registering");
                }
                Err(err) => {
                    if let Some(ctx_err) = poll_ctx.err() {
                        return Err(ctx_err);
                    }
                    tracing::debug!(error = %err, "polling provider failed");
                }
            }
            poll_ctx.sleep(self.options.polling_delay).await?;
        }
    }
}

#[async_trait]
impl Policy for RegistrationPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        if self.options.attempts == 0 {
            return self.next.send(ctx, request).await;
        }

        let mut response = self.next.send(ctx, request).await?;
        let mut attempt = 0;
        loop {
            if response.status() != StatusCode::CONFLICT {
                return Ok(response);
            }
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => return Err(err.with_response(response)),
            };
            let Some(service_error) = missing_registration(&body) else {
                return Ok(response);
            };

            let path = request.url().path().to_string();
            let Some(subscription_id) = subscription_id(&path) else {
                return Err(Error::policy(RegistrationError::SubscriptionNotFound { path })
                    .with_response(response));
            };
            let Some(namespace) = provider_namespace(&service_error).map(str::to_string) else {
                return Err(Error::policy(RegistrationError::ProviderNotFound).with_response(response));
            };

            if attempt == self.options.attempts {
                tracing::warn!(namespace = %namespace, attempt, "giving up on provider registration");
                return Err(Error::policy(RegistrationError::AttemptsExceeded { namespace })
                    .with_response(response));
            }
            attempt += 1;

            tracing::info!(
                subscription_id,
                namespace = %namespace,
                attempt,
                "registering resource provider"
            );
            let providers = ProvidersClient::new(self.pipeline.clone(), request.url().clone());
            if let Err(source) = providers.register(ctx, subscription_id, &namespace).await {
                return Err(
                    Error::policy(RegistrationError::Register { namespace, source })
                        .with_response(response),
                );
            }
            if let Err(source) = self
                .wait_for_registration(ctx, &providers, subscription_id, &namespace)
                .await
            {
                return Err(
                    Error::policy(RegistrationError::Polling { namespace, source })
                        .with_response(response),
                );
            }
            tracing::info!(namespace = %namespace, "resource provider registered, replaying request");

            request.rewind_body().await?;
            response = self.next.send(ctx, request).await?;
        }
    }
}

impl std::fmt::Debug for RegistrationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationPolicy")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
