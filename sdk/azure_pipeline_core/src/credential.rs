//! Built-in [`TokenCredential`] implementations.
//!
//! # Examples
//!
//! ## Client secret from the environment
//! ```rust,no_run
//! use azure_pipeline_core::credential::ClientSecretCredential;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Reads AZURE_TENANT_ID, AZURE_CLIENT_ID and AZURE_CLIENT_SECRET.
//! let credential = ClientSecretCredential::from_env()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::auth::{AccessToken, TokenCredential};
use crate::context::Context;
use crate::error::{Error, ErrorKind, PipelineResult};
use crate::logging::{LoggingOptions, LoggingPolicy};
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::request_id::RequestIdPolicy;
use crate::retry::{RetryOptions, RetryPolicy};
use crate::telemetry::{TelemetryOptions, TelemetryPolicy};
use crate::transport::{DefaultTransport, Transport};

/// Authority host of the Azure public cloud.
pub const AZURE_PUBLIC_CLOUD_AUTHORITY: &str = "https://login.microsoftonline.com/";
/// Authority host of Azure China.
pub const AZURE_CHINA_AUTHORITY: &str = "https://login.chinacloudapi.cn/";
/// Authority host of Azure US Government.
pub const AZURE_GOVERNMENT_AUTHORITY: &str = "https://login.microsoftonline.us/";
/// Authority host of Azure Germany.
pub const AZURE_GERMANY_AUTHORITY: &str = "https://login.microsoftonline.de/";

/// Lifetime assumed for a static token without an explicit expiry (1 hour).
pub const DEFAULT_STATIC_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

const TENANT_ID_VALIDATION_ERR: &str = "invalid tenant ID provided; it may only contain \
     alphanumeric characters, '-' and '.'. See https://docs.microsoft.com/partner-center/find-ids-and-domain-names";

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Whether `tenant_id` is safe to place in an authority URL path.
pub fn valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// A fixed token, for example one obtained out of band with `az account get-access-token`.
#[derive(Clone)]
pub struct StaticTokenCredential {
    token: SecretString,
    expires_on: Option<SystemTime>,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_on: None,
        }
    }

    /// Read the token from `AZURE_ACCESS_TOKEN`.
    pub fn from_env() -> PipelineResult<Self> {
        env_var("AZURE_ACCESS_TOKEN").map(Self::new).ok_or_else(|| {
            Error::new(ErrorKind::CredentialUnavailable {
                credential: "StaticTokenCredential".into(),
                message: "AZURE_ACCESS_TOKEN is not set".into(),
            })
        })
    }

    /// Report a known expiry instead of [`DEFAULT_STATIC_TOKEN_LIFETIME`] from each call.
    #[must_use]
    pub fn with_expiry(mut self, expires_on: SystemTime) -> Self {
        self.expires_on = Some(expires_on);
        self
    }
}

impl fmt::Debug for StaticTokenCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticTokenCredential(****)")
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _ctx: &Context, _scopes: &[String]) -> PipelineResult<AccessToken> {
        let expires_on = self
            .expires_on
            .unwrap_or_else(|| SystemTime::now() + DEFAULT_STATIC_TOKEN_LIFETIME);
        Ok(AccessToken {
            token: self.token.clone(),
            expires_on,
        })
    }
}

/// Options for [`ClientSecretCredential`].
#[derive(Debug, Clone, Default)]
pub struct ClientSecretCredentialOptions {
    /// Authority host. Falls back to `AZURE_AUTHORITY_HOST`, then the public cloud.
    pub authority_host: Option<String>,
    /// Transport for token requests. Defaults to a new [`DefaultTransport`].
    pub transport: Option<Arc<dyn Transport>>,
    pub retry: RetryOptions,
    pub telemetry: TelemetryOptions,
    pub logging: LoggingOptions,
}

/// Authenticates a service principal with the OAuth2 client-credentials grant.
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: SecretString,
    token_url: Url,
    pipeline: Pipeline,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

// Some endpoints send `expires_in` as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> PipelineResult<u64> {
        match self {
            Self::Seconds(secs) => Ok(*secs),
            Self::Text(text) => text.trim().parse().map_err(|_| {
                Error::non_retriable(ErrorKind::Authentication(format!(
                    "token response has invalid expires_in: {text}"
                )))
            }),
        }
    }
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        options: Option<ClientSecretCredentialOptions>,
    ) -> PipelineResult<Self> {
        let tenant_id = tenant_id.into();
        if !valid_tenant_id(&tenant_id) {
            return Err(Error::new(ErrorKind::CredentialUnavailable {
                credential: "ClientSecretCredential".into(),
                message: TENANT_ID_VALIDATION_ERR.into(),
            }));
        }

        let options = options.unwrap_or_default();
        let authority = authority_host(options.authority_host.as_deref())?;
        let token_url = authority.join(&format!("{tenant_id}/oauth2/v2.0/token"))?;

        let transport = match options.transport {
            Some(transport) => transport,
            None => Arc::new(DefaultTransport::new()?),
        };
        let pipeline = Pipeline::new(
            transport,
            vec![
                TelemetryPolicy::factory(options.telemetry),
                RequestIdPolicy::factory(),
                RetryPolicy::factory(options.retry),
                LoggingPolicy::factory(options.logging),
            ],
        );

        Ok(Self {
            tenant_id,
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            token_url,
            pipeline,
        })
    }

    /// Build from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`.
    pub fn from_env() -> PipelineResult<Self> {
        Self::from_env_with_options(None)
    }

    pub fn from_env_with_options(
        options: Option<ClientSecretCredentialOptions>,
    ) -> PipelineResult<Self> {
        let var = |name: &str| {
            env_var(name).ok_or_else(|| {
                Error::new(ErrorKind::CredentialUnavailable {
                    credential: "EnvironmentCredential".into(),
                    message: format!("missing environment variable {name}"),
                })
            })
        };
        Self::new(
            var("AZURE_TENANT_ID")?,
            var("AZURE_CLIENT_ID")?,
            var("AZURE_CLIENT_SECRET")?,
            options,
        )
    }

    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

fn authority_host(configured: Option<&str>) -> PipelineResult<Url> {
    let host = match configured {
        Some(host) => host.to_string(),
        None => env_var("AZURE_AUTHORITY_HOST")
            .unwrap_or_else(|| AZURE_PUBLIC_CLOUD_AUTHORITY.to_string()),
    };
    let mut url = Url::parse(&host)?;
    if url.scheme() != "https" {
        return Err(Error::new(ErrorKind::InvalidEndpoint(format!(
            "authority host must use https: {host}"
        ))));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("token_url", &self.token_url.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    #[tracing::instrument(
        name = "azure::identity::client_secret::get_token",
        skip(self, ctx),
        fields(tenant_id = %self.tenant_id, client_id = %self.client_id)
    )]
    async fn get_token(&self, ctx: &Context, scopes: &[String]) -> PipelineResult<AccessToken> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.client_id)
            .append_pair("scope", &scopes.join(" "))
            .append_pair("client_secret", self.client_secret.expose_secret())
            .append_pair("grant_type", "client_credentials")
            .finish();

        let mut request = Request::new(Method::POST, self.token_url.clone());
        request.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        request.set_body(form);

        let mut response = self.pipeline.send(ctx, &mut request).await?;
        if !response.is_success() {
            let mut cause = response.into_error().await;
            tracing::warn!(error = %cause, "client secret authentication failed");
            let mut err = Error::new(ErrorKind::Authentication(format!(
                "ClientSecretCredential: {cause}"
            )));
            if let Some(response) = cause.take_response() {
                err = err.with_response(response);
            }
            return Err(err);
        }

        let body: TokenResponse = response.json().await?;
        let expires_on = SystemTime::now() + Duration::from_secs(body.expires_in.seconds()?);
        tracing::debug!("acquired access token");
        Ok(AccessToken::new(body.access_token, expires_on))
    }
}

/// Pick a credential from the environment.
///
/// `AZURE_TENANT_ID` + `AZURE_CLIENT_ID` + `AZURE_CLIENT_SECRET` select a
/// [`ClientSecretCredential`] sending through `transport`; otherwise
/// `AZURE_ACCESS_TOKEN` selects a [`StaticTokenCredential`]. Returns
/// `Ok(None)` when neither is configured.
pub fn from_environment(
    transport: Option<Arc<dyn Transport>>,
) -> PipelineResult<Option<Arc<dyn TokenCredential>>> {
    let has_client_secret = ["AZURE_TENANT_ID", "AZURE_CLIENT_ID", "AZURE_CLIENT_SECRET"]
        .iter()
        .all(|name| env_var(name).is_some());
    if has_client_secret {
        let options = ClientSecretCredentialOptions {
            transport,
            ..ClientSecretCredentialOptions::default()
        };
        let credential = ClientSecretCredential::from_env_with_options(Some(options))?;
        return Ok(Some(Arc::new(credential)));
    }
    if let Some(token) = env_var("AZURE_ACCESS_TOKEN") {
        return Ok(Some(Arc::new(StaticTokenCredential::new(token))));
    }
    Ok(None)
}

#[cfg(feature = "identity")]
pub use identity::AzureIdentityCredential;

#[cfg(feature = "identity")]
mod identity {
    use super::*;

    /// Adapts an `azure_identity` credential to this crate's [`TokenCredential`].
    #[derive(Debug, Clone)]
    pub struct AzureIdentityCredential {
        inner: Arc<dyn azure_core::credentials::TokenCredential>,
    }

    impl AzureIdentityCredential {
        pub fn new(inner: Arc<dyn azure_core::credentials::TokenCredential>) -> Self {
            Self { inner }
        }

        /// Use the signed-in Azure CLI account.
        pub fn azure_cli() -> PipelineResult<Self> {
            let credential = azure_identity::AzureCliCredential::new(None).map_err(|e| {
                Error::new(ErrorKind::CredentialUnavailable {
                    credential: "AzureCliCredential".into(),
                    message: e.to_string(),
                })
            })?;
            Ok(Self::new(credential))
        }
    }

    #[async_trait]
    impl TokenCredential for AzureIdentityCredential {
        async fn get_token(&self, ctx: &Context, scopes: &[String]) -> PipelineResult<AccessToken> {
            let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
            let token = ctx
                .run(async {
                    self.inner
                        .get_token(&scopes, None)
                        .await
                        .map_err(|e| Error::new(ErrorKind::Authentication(e.to_string())))
                })
                .await?;
            let secs = u64::try_from(token.expires_on.unix_timestamp()).unwrap_or(0);
            Ok(AccessToken::new(
                token.token.secret(),
                SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            ))
        }
    }
}
