//! A service client bundling an endpoint with a configured pipeline.
//!
//! [`Client`] is the entry point service crates build on. The builder
//! assembles the standard policy chain:
//!
//! telemetry → request ID → per-call policies → retry → bearer token →
//! per-retry policies → tracing → logging → transport
//!
//! # Examples
//!
//! ## Client secret from the environment
//! ```rust,no_run
//! use azure_pipeline_core::client::Client;
//! use azure_pipeline_core::context::Context;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Credential picked up from AZURE_TENANT_ID / AZURE_CLIENT_ID / AZURE_CLIENT_SECRET.
//! let client = Client::builder()
//!     .endpoint("https://management.azure.com")
//!     .api_version("2021-04-01")
//!     .build()?;
//!
//! let mut response = client.get(&Context::new(), "/subscriptions").await?;
//! let body: serde_json::Value = response.json().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using a fixed token
//! ```rust,no_run
//! use std::sync::Arc;
//! use azure_pipeline_core::client::Client;
//! use azure_pipeline_core::credential::StaticTokenCredential;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder()
//!     .endpoint("https://management.azure.com")
//!     .credential(Arc::new(StaticTokenCredential::new("eyJ0eXAi...")))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use url::Url;

use crate::auth::{AuthenticationOptions, BearerTokenPolicy, TokenCredential};
use crate::context::Context;
use crate::credential;
use crate::error::{Error, ErrorKind, PipelineResult};
use crate::logging::{LoggingOptions, LoggingPolicy};
use crate::pipeline::{Pipeline, PolicyFactory};
use crate::request::Request;
use crate::request_id::RequestIdPolicy;
use crate::response::Response;
use crate::retry::{RetryOptions, RetryPolicy};
use crate::span::TracingPolicy;
use crate::telemetry::{TelemetryOptions, TelemetryPolicy};
use crate::transport::{DefaultTransport, Transport, TransportOptions};

/// Environment variable consulted when no endpoint is given to the builder.
pub const ENDPOINT_ENV_VAR: &str = "AZURE_ENDPOINT";

/// An endpoint plus the pipeline used to call it.
///
/// The client is cheaply cloneable and can be shared across threads.
#[derive(Debug, Clone)]
pub struct Client {
    pipeline: Pipeline,
    endpoint: Url,
    api_version: Option<String>,
}

/// Builder for constructing a [`Client`].
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Default)]
pub struct ClientBuilder {
    endpoint: Option<String>,
    credential: Option<Arc<dyn TokenCredential>>,
    anonymous: bool,
    scopes: Option<Vec<String>>,
    refresh_margin: Option<Duration>,
    api_version: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    http_client: Option<reqwest::Client>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    retry_options: Option<RetryOptions>,
    telemetry: TelemetryOptions,
    logging: LoggingOptions,
    module: Option<(String, String)>,
    per_call_policies: Vec<Arc<dyn PolicyFactory>>,
    per_retry_policies: Vec<Arc<dyn PolicyFactory>>,
}

impl Client {
    /// Create a new builder for configuring a `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Get the base endpoint URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The `api-version` query parameter added to every URL built by [`url`](Self::url).
    pub fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Build a full URL for an API path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be joined to the endpoint URL.
    pub fn url(&self, path: &str) -> PipelineResult<Url> {
        let mut url = self.endpoint.join(path).map_err(|e| {
            Error::new(ErrorKind::InvalidEndpoint(format!(
                "failed to construct URL for {path}: {e}"
            )))
        })?;
        if let Some(version) = &self.api_version {
            let present = url.query_pairs().any(|(name, _)| name == "api-version");
            if !present {
                url.query_pairs_mut().append_pair("api-version", version);
            }
        }
        Ok(url)
    }

    /// Send a request through the pipeline and return the raw response, whatever its status.
    pub async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        self.pipeline.send(ctx, request).await
    }

    /// Send a GET request.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails, the request fails after all
    /// retries, or the service answers with a non-2xx status.
    #[tracing::instrument(name = "azure::client::get", skip(self, ctx))]
    pub async fn get(&self, ctx: &Context, path: &str) -> PipelineResult<Response> {
        let mut request = Request::new(Method::GET, self.url(path)?);
        Self::check_response(self.send(ctx, &mut request).await?).await
    }

    /// Send a POST request with a JSON body.
    #[tracing::instrument(name = "azure::client::post", skip(self, ctx, body))]
    pub async fn post<T: serde::Serialize + ?Sized>(
        &self,
        ctx: &Context,
        path: &str,
        body: &T,
    ) -> PipelineResult<Response> {
        let mut request = Request::new(Method::POST, self.url(path)?);
        request.set_json(body)?;
        Self::check_response(self.send(ctx, &mut request).await?).await
    }

    /// Send a PUT request with a JSON body.
    #[tracing::instrument(name = "azure::client::put", skip(self, ctx, body))]
    pub async fn put<T: serde::Serialize + ?Sized>(
        &self,
        ctx: &Context,
        path: &str,
        body: &T,
    ) -> PipelineResult<Response> {
        let mut request = Request::new(Method::PUT, self.url(path)?);
        request.set_json(body)?;
        Self::check_response(self.send(ctx, &mut request).await?).await
    }

    /// Send a DELETE request.
    #[tracing::instrument(name = "azure::client::delete", skip(self, ctx))]
    pub async fn delete(&self, ctx: &Context, path: &str) -> PipelineResult<Response> {
        let mut request = Request::new(Method::DELETE, self.url(path)?);
        Self::check_response(self.send(ctx, &mut request).await?).await
    }

    /// Check the response status and return an error if not successful.
    async fn check_response(response: Response) -> PipelineResult<Response> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(response.into_error().await)
        }
    }
}

impl ClientBuilder {
    /// Set the service endpoint URL.
    ///
    /// If not set, the builder will check the `AZURE_ENDPOINT` environment variable.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the credential used by the bearer token policy.
    ///
    /// If not set, the builder looks for a credential in the environment
    /// (see [`credential::from_environment`]) and sends unauthenticated
    /// requests if none is found.
    pub fn credential(mut self, credential: Arc<dyn TokenCredential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Never authenticate, even if the environment holds credentials.
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// Set the token scopes. Defaults to `<endpoint origin>/.default`.
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    /// Refresh cached tokens this long before they expire. Defaults to 2 minutes.
    pub fn token_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = Some(margin);
        self
    }

    /// Add `api-version=<version>` to URLs built by [`Client::url`].
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Use a custom transport, for example a test double.
    ///
    /// **Note:** Takes precedence over [`http_client`](Self::http_client) and
    /// the timeout settings.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set a custom HTTP client.
    ///
    /// **Note:** If you provide a custom HTTP client, the timeout settings
    /// and the HTTP/1.1 and TLS fallbacks of the default transport do not apply.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the read timeout.
    ///
    /// This is the maximum time allowed for receiving a response from the server.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the retry options.
    ///
    /// Defaults to 3 retries with a 4 second base delay.
    pub fn retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = Some(options);
        self
    }

    pub fn telemetry(mut self, options: TelemetryOptions) -> Self {
        self.telemetry = options;
        self
    }

    pub fn logging(mut self, options: LoggingOptions) -> Self {
        self.logging = options;
        self
    }

    /// Name the client module and version reported in the `User-Agent`.
    pub fn module(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.module = Some((name.into(), version.into()));
        self
    }

    /// Add a policy that runs once per call, before the retry policy.
    pub fn per_call_policy(mut self, factory: Arc<dyn PolicyFactory>) -> Self {
        self.per_call_policies.push(factory);
        self
    }

    /// Add a policy that runs on every try, after authentication.
    pub fn per_retry_policy(mut self, factory: Arc<dyn PolicyFactory>) -> Self {
        self.per_retry_policies.push(factory);
        self
    }

    /// Build the `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No endpoint is provided and `AZURE_ENDPOINT` is not set
    /// - The endpoint URL is invalid
    /// - The default transport or an environment credential cannot be created
    pub fn build(self) -> PipelineResult<Client> {
        let endpoint_str = self
            .endpoint
            .or_else(|| std::env::var(ENDPOINT_ENV_VAR).ok())
            .ok_or_else(|| {
                Error::new(ErrorKind::MissingConfig(
                    "endpoint is required. Set it via builder or AZURE_ENDPOINT env var.".into(),
                ))
            })?;

        let endpoint = Url::parse(&endpoint_str).map_err(|e| {
            Error::new(ErrorKind::InvalidEndpoint(format!("{endpoint_str}: {e}")))
        })?;
        if !endpoint.has_host() {
            return Err(Error::new(ErrorKind::InvalidEndpoint(format!(
                "{endpoint_str}: endpoint has no host"
            ))));
        }

        let transport: Arc<dyn Transport> = match (self.transport, self.http_client) {
            (Some(transport), _) => transport,
            (None, Some(client)) => Arc::new(client),
            (None, None) => Arc::new(DefaultTransport::with_options(TransportOptions {
                connect_timeout: self
                    .connect_timeout
                    .unwrap_or(crate::transport::DEFAULT_CONNECT_TIMEOUT),
                read_timeout: self
                    .read_timeout
                    .unwrap_or(crate::transport::DEFAULT_READ_TIMEOUT),
                ..TransportOptions::default()
            })?),
        };

        let credential = match self.credential {
            Some(credential) => Some(credential),
            None if self.anonymous => None,
            None => credential::from_environment(Some(transport.clone()))?,
        };

        let mut factories: Vec<Arc<dyn PolicyFactory>> = Vec::new();
        factories.push(match &self.module {
            Some((name, version)) => TelemetryPolicy::factory_for(name, version, self.telemetry),
            None => TelemetryPolicy::factory(self.telemetry),
        });
        factories.push(RequestIdPolicy::factory());
        factories.extend(self.per_call_policies);
        factories.push(RetryPolicy::factory(self.retry_options.unwrap_or_default()));
        if let Some(credential) = credential {
            let scopes = self
                .scopes
                .unwrap_or_else(|| vec![default_scope(&endpoint)]);
            let mut options = AuthenticationOptions::new(scopes);
            if let Some(margin) = self.refresh_margin {
                options = options.with_refresh_margin(margin);
            }
            factories.push(BearerTokenPolicy::factory(credential, options));
        }
        factories.extend(self.per_retry_policies);
        factories.push(TracingPolicy::factory());
        factories.push(LoggingPolicy::factory(self.logging));

        Ok(Client {
            pipeline: Pipeline::new(transport, factories),
            endpoint,
            api_version: self.api_version,
        })
    }
}

/// The `.default` scope of an endpoint's origin, e.g. `https://management.azure.com/.default`.
pub fn default_scope(endpoint: &Url) -> String {
    format!("{}/.default", endpoint.origin().ascii_serialization())
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential)
            .field("scopes", &self.scopes)
            .field("api_version", &self.api_version)
            .field("retry_options", &self.retry_options)
            .field("per_call_policies", &self.per_call_policies.len())
            .field("per_retry_policies", &self.per_retry_policies.len())
            .finish_non_exhaustive()
    }
}
