//! Resource provider operations.
//!
//! Only the two calls the registration policy needs: register a
//! subscription with a provider namespace and read the provider back.

use azure_pipeline_core::{
    Context, Error, ErrorKind, Method, Pipeline, PipelineResult, Request, Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use url::Url;

/// API version of the `Microsoft.Resources` provider operations.
pub const API_VERSION: &str = "2019-05-01";

/// Registration state reported once a provider is usable.
pub const REGISTERED: &str = "Registered";

/// Resource provider information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// The provider ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The namespace of the resource provider, e.g. `Microsoft.Storage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// The registration policy of the resource provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_policy: Option<String>,

    /// The registration state of the resource provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_state: Option<String>,
}

impl Provider {
    /// Whether `registrationState` is `Registered`, compared case-insensitively.
    pub fn is_registered(&self) -> bool {
        self.registration_state
            .as_deref()
            .is_some_and(|state| state.eq_ignore_ascii_case(REGISTERED))
    }
}

/// Calls the provider operations of one Resource Manager endpoint.
#[derive(Debug, Clone)]
pub struct ProvidersClient {
    pipeline: Pipeline,
    endpoint: Url,
}

impl ProvidersClient {
    /// Only the scheme, host and port of `endpoint` are used.
    pub fn new(pipeline: Pipeline, endpoint: Url) -> Self {
        Self { pipeline, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Register the subscription with a resource provider.
    ///
    /// # Tracing
    ///
    /// Emits a span named `azure::providers::register` with fields
    /// `subscription_id` and `namespace`.
    #[tracing::instrument(name = "azure::providers::register", skip(self, ctx))]
    pub async fn register(
        &self,
        ctx: &Context,
        subscription_id: &str,
        namespace: &str,
    ) -> PipelineResult<Provider> {
        tracing::debug!("registering resource provider");

        let url = self.provider_url(subscription_id, namespace, true)?;
        let response = self.send(ctx, Method::POST, url).await?;
        let provider = Self::handle_response(response).await?;

        tracing::debug!(state = ?provider.registration_state, "registration accepted");
        Ok(provider)
    }

    /// Get a resource provider of the subscription.
    ///
    /// # Tracing
    ///
    /// Emits a span named `azure::providers::get` with fields
    /// `subscription_id` and `namespace`.
    #[tracing::instrument(name = "azure::providers::get", skip(self, ctx))]
    pub async fn get(
        &self,
        ctx: &Context,
        subscription_id: &str,
        namespace: &str,
    ) -> PipelineResult<Provider> {
        let url = self.provider_url(subscription_id, namespace, false)?;
        let response = self.send(ctx, Method::GET, url).await?;
        Self::handle_response(response).await
    }

    async fn send(&self, ctx: &Context, method: Method, url: Url) -> PipelineResult<Response> {
        let mut request = Request::new(method, url);
        self.pipeline.send(ctx, &mut request).await
    }

    /// `/subscriptions/{id}/providers/{namespace}[/register]?api-version=...`,
    /// with both path parameters percent-encoded.
    fn provider_url(
        &self,
        subscription_id: &str,
        namespace: &str,
        register: bool,
    ) -> PipelineResult<Url> {
        let mut url = self.endpoint.clone();
        url.set_query(None);
        url.set_fragment(None);
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                Error::new(ErrorKind::InvalidEndpoint(format!(
                    "{} cannot be a base URL",
                    self.endpoint
                )))
            })?;
            segments
                .clear()
                .extend(["subscriptions", subscription_id, "providers", namespace]);
            if register {
                segments.push("register");
            }
        }
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    async fn handle_response(mut response: Response) -> PipelineResult<Provider> {
        if response.status() != StatusCode::OK {
            return Err(response.into_error().await);
        }
        response.json::<Provider>().await
    }
}
