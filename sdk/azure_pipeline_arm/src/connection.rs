//! Connections to Azure Resource Manager.
//!
//! A [`Connection`] is a core [`Client`] whose pipeline also registers
//! missing resource providers on demand.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use azure_pipeline_arm::connection::{Connection, AZURE_PUBLIC_CLOUD};
//! use azure_pipeline_core::credential::ClientSecretCredential;
//! use azure_pipeline_core::Context;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credential = ClientSecretCredential::from_env()?;
//! let connection = Connection::builder()
//!     .endpoint(AZURE_PUBLIC_CLOUD)
//!     .credential(Arc::new(credential))
//!     .build()?;
//!
//! let response = connection
//!     .client()
//!     .get(&Context::new(), "/subscriptions?api-version=2020-01-01")
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use azure_pipeline_core::auth::TokenCredential;
use azure_pipeline_core::credential;
use azure_pipeline_core::logging::LoggingOptions;
use azure_pipeline_core::retry::RetryOptions;
use azure_pipeline_core::telemetry::TelemetryOptions;
use azure_pipeline_core::transport::{DefaultTransport, Transport, TransportOptions};
use azure_pipeline_core::{Client, Error, ErrorKind, Pipeline, PipelineResult, PolicyFactory};
use url::Url;

use crate::providers::ProvidersClient;
use crate::registration::{RegistrationOptions, RegistrationPolicy};

/// Resource Manager endpoint of the Azure public cloud.
pub const AZURE_PUBLIC_CLOUD: &str = "https://management.azure.com/";

/// Resource Manager endpoint of Azure China.
pub const AZURE_CHINA: &str = "https://management.chinacloudapi.cn/";

/// Resource Manager endpoint of Azure Government.
pub const AZURE_GOVERNMENT: &str = "https://management.usgovcloudapi.net/";

/// Resource Manager endpoint of Azure Germany.
pub const AZURE_GERMANY: &str = "https://management.microsoftazure.de/";

/// The token scope for a Resource Manager endpoint: the endpoint as given followed by `/.default`.
pub fn default_scope(endpoint: &str) -> String {
    format!("{endpoint}/.default")
}

/// A Resource Manager endpoint plus the pipeline used to call it.
#[derive(Debug, Clone)]
pub struct Connection {
    client: Client,
}

/// Builder for a [`Connection`].
#[derive(Default)]
pub struct ConnectionBuilder {
    endpoint: Option<String>,
    credential: Option<Arc<dyn TokenCredential>>,
    transport: Option<Arc<dyn Transport>>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    retry_options: Option<RetryOptions>,
    registration: Option<RegistrationOptions>,
    telemetry: TelemetryOptions,
    logging: LoggingOptions,
    module: Option<(String, String)>,
    per_call_policies: Vec<Arc<dyn PolicyFactory>>,
    per_retry_policies: Vec<Arc<dyn PolicyFactory>>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// A connection to the public cloud with default options.
    pub fn new(credential: Arc<dyn TokenCredential>) -> PipelineResult<Self> {
        Self::builder().credential(credential).build()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn endpoint(&self) -> &Url {
        self.client.endpoint()
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.client.pipeline()
    }

    /// Provider operations over this connection's pipeline.
    pub fn providers(&self) -> ProvidersClient {
        ProvidersClient::new(self.client.pipeline().clone(), self.client.endpoint().clone())
    }
}

impl ConnectionBuilder {
    /// Set the Resource Manager endpoint. Defaults to [`AZURE_PUBLIC_CLOUD`].
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the credential. If not set, one is read from the environment.
    pub fn credential(mut self, credential: Arc<dyn TokenCredential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Use a custom transport for both the connection and provider registration.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = Some(options);
        self
    }

    /// Configure automatic provider registration. Pass
    /// [`RegistrationOptions::disabled()`] to turn it off.
    pub fn registration(mut self, options: RegistrationOptions) -> Self {
        self.registration = Some(options);
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

    pub fn per_call_policy(mut self, factory: Arc<dyn PolicyFactory>) -> Self {
        self.per_call_policies.push(factory);
        self
    }

    pub fn per_retry_policy(mut self, factory: Arc<dyn PolicyFactory>) -> Self {
        self.per_retry_policies.push(factory);
        self
    }

    /// Build the `Connection`.
    ///
    /// # Errors
    ///
    /// Returns an error if no credential is given and none is configured in
    /// the environment, or if the endpoint or transport cannot be set up.
    pub fn build(self) -> PipelineResult<Connection> {
        let endpoint = self
            .endpoint
            .unwrap_or_else(|| AZURE_PUBLIC_CLOUD.to_string());

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let defaults = TransportOptions::default();
                Arc::new(DefaultTransport::with_options(TransportOptions {
                    connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
                    read_timeout: self.read_timeout.unwrap_or(defaults.read_timeout),
                    ..defaults
                })?)
            }
        };

        let credential = match self.credential {
            Some(credential) => credential,
            None => credential::from_environment(Some(transport.clone()))?.ok_or_else(|| {
                Error::new(ErrorKind::MissingConfig(
                    "credential is required. Set it via builder or AZURE_TENANT_ID, \
                     AZURE_CLIENT_ID and AZURE_CLIENT_SECRET env vars."
                        .into(),
                ))
            })?,
        };

        let scope = default_scope(&endpoint);
        let retry_options = self.retry_options.unwrap_or_default();
        let registration = self.registration.unwrap_or_else(|| RegistrationOptions {
            retry: retry_options.clone(),
            logging: self.logging.clone(),
            ..RegistrationOptions::default()
        });

        let mut builder = Client::builder()
            .endpoint(endpoint)
            .credential(credential.clone())
            .scopes([scope.clone()])
            .transport(transport.clone())
            .retry_options(retry_options)
            .telemetry(self.telemetry)
            .logging(self.logging)
            .per_call_policy(RegistrationPolicy::factory(
                credential,
                transport,
                [scope],
                registration,
            ));
        if let Some((name, version)) = self.module {
            builder = builder.module(name, version);
        }
        for factory in self.per_call_policies {
            builder = builder.per_call_policy(factory);
        }
        for factory in self.per_retry_policies {
            builder = builder.per_retry_policy(factory);
        }

        Ok(Connection {
            client: builder.build()?,
        })
    }
}

impl std::fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential)
            .field("registration", &self.registration)
            .field("retry_options", &self.retry_options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use azure_pipeline_core::credential::StaticTokenCredential;
    use azure_pipeline_core::test_support::{fast_retry_options, MockTransport};
    use azure_pipeline_core::{Context, StatusCode};

    fn credential() -> Arc<dyn TokenCredential> {
        Arc::new(StaticTokenCredential::new("arm-token"))
    }

    #[test]
    fn scope_appends_default_to_endpoint() {
        assert_eq!(
            default_scope(AZURE_PUBLIC_CLOUD),
            "https://management.azure.com//.default"
        );
        assert_eq!(
            default_scope("https://management.chinacloudapi.cn"),
            "https://management.chinacloudapi.cn/.default"
        );
    }

    #[test]
    fn defaults_to_public_cloud() {
        let connection = Connection::new(credential()).unwrap();
        assert_eq!(connection.endpoint().as_str(), AZURE_PUBLIC_CLOUD);
    }

    #[test]
    fn sovereign_cloud_endpoint() {
        let connection = Connection::builder()
            .endpoint(AZURE_GOVERNMENT)
            .credential(credential())
            .build()
            .unwrap();
        assert_eq!(connection.endpoint().host_str(), Some("management.usgovcloudapi.net"));
    }

    #[tokio::test]
    async fn requests_carry_token_and_arm_user_agent() {
        let transport = Arc::new(MockTransport::with_statuses(vec![200]));
        let connection = Connection::builder()
            .credential(credential())
            .transport(transport.clone())
            .retry_options(fast_retry_options())
            .module("armstorage", "0.1.0")
            .build()
            .unwrap();

        let response = connection
            .client()
            .get(&Context::new(), "/subscriptions?api-version=2020-01-01")
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let sent = &transport.requests()[0];
        assert_eq!(sent.header("authorization"), Some("Bearer arm-token"));
        assert!(sent
            .header("user-agent")
            .is_some_and(|ua| ua.starts_with("azsdk-rust-armstorage/0.1.0")));
        assert!(sent.header("x-ms-client-request-id").is_some());
    }

    #[tokio::test]
    async fn providers_share_the_connection_pipeline() {
        let transport = Arc::new(MockTransport::new(|_req, _n| {
            Ok(azure_pipeline_core::Response::new(
                StatusCode::OK,
                azure_pipeline_core::header::HeaderMap::new(),
                r#"{"namespace":"Microsoft.Compute","registrationState":"Registered"}"#,
            ))
        }));
        let connection = Connection::builder()
            .credential(credential())
            .transport(transport.clone())
            .build()
            .unwrap();

        let provider = connection
            .providers()
            .get(&Context::new(), "sub", "Microsoft.Compute")
            .await
            .unwrap();

        assert!(provider.is_registered());
        assert_eq!(
            transport.requests()[0].url.as_str(),
            "https://management.azure.com/subscriptions/sub/providers/Microsoft.Compute?api-version=2019-05-01"
        );
    }
}
