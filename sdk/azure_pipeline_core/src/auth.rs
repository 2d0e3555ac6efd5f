//! Token credentials and the bearer-token authentication policy.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};

use crate::context::Context;
use crate::error::{Error, ErrorKind, PipelineResult};
use crate::pipeline::{Policy, PolicyFactory};
use crate::request::Request;
use crate::response::Response;

/// How long before expiry a cached token is treated as expired (2 minutes).
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// A source of OAuth access tokens.
///
/// Created once per client and shared; implementations must be safe to call
/// from many tasks at once.
#[async_trait]
pub trait TokenCredential: Send + Sync + fmt::Debug {
    /// Request a token valid for `scopes`.
    async fn get_token(&self, ctx: &Context, scopes: &[String]) -> PipelineResult<AccessToken>;
}

/// A bearer token and the moment it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_on: SystemTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_on,
        }
    }

    /// Whether the token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: SystemTime) -> bool {
        expires_within(self.expires_on, margin, now)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"****")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

fn expires_within(expires_on: SystemTime, margin: Duration, now: SystemTime) -> bool {
    match now.checked_add(margin) {
        Some(threshold) => threshold >= expires_on,
        None => true,
    }
}

/// Configuration for [`BearerTokenPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationOptions {
    /// Scopes requested from the credential.
    pub scopes: Vec<String>,
    /// Refresh this long before the token expires. Zero means at expiry.
    pub refresh_margin: Duration,
}

impl AuthenticationOptions {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }
}

struct CachedToken {
    header: Option<SecretString>,
    expires_on: SystemTime,
}

/// Sets `Authorization: Bearer <token>` on every request.
///
/// The header is cached until the token nears expiry. Only one task
/// refreshes at a time; tasks arriving during a refresh wait for it and
/// reuse the new token. No lock guarding the cached token is held while
/// the credential runs or while the request travels downstream.
pub struct BearerTokenPolicy {
    credential: Arc<dyn TokenCredential>,
    options: AuthenticationOptions,
    cache: RwLock<CachedToken>,
    refresh_gate: tokio::sync::Mutex<()>,
    next: Arc<dyn Policy>,
}

impl BearerTokenPolicy {
    pub fn new(
        credential: Arc<dyn TokenCredential>,
        options: AuthenticationOptions,
        next: Arc<dyn Policy>,
    ) -> Self {
        Self {
            credential,
            options,
            // Starts expired so the first request fetches a token.
            cache: RwLock::new(CachedToken {
                header: None,
                expires_on: SystemTime::UNIX_EPOCH,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
            next,
        }
    }

    pub fn factory(
        credential: Arc<dyn TokenCredential>,
        options: AuthenticationOptions,
    ) -> Arc<dyn PolicyFactory> {
        Arc::new(move |next: Arc<dyn Policy>| -> Arc<dyn Policy> {
            Arc::new(BearerTokenPolicy::new(
                credential.clone(),
                options.clone(),
                next,
            ))
        })
    }

    fn cached_header(&self) -> Option<SecretString> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let header = cache.header.as_ref()?;
        if expires_within(cache.expires_on, self.options.refresh_margin, SystemTime::now()) {
            return None;
        }
        Some(header.clone())
    }

    async fn refresh(&self, ctx: &Context) -> PipelineResult<SecretString> {
        let _gate = ctx.run(async { Ok(self.refresh_gate.lock().await) }).await?;

        // Another task may have refreshed while we waited for the gate.
        if let Some(header) = self.cached_header() {
            return Ok(header);
        }

        tracing::debug!(scopes = ?self.options.scopes, "requesting access token");
        let token = self.credential.get_token(ctx, &self.options.scopes).await?;
        let header = SecretString::from(format!("Bearer {}", token.token.expose_secret()));

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.header = Some(header.clone());
        cache.expires_on = token.expires_on;
        Ok(header)
    }
}

impl fmt::Debug for BearerTokenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenPolicy")
            .field("credential", &self.credential)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Policy for BearerTokenPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        let header = match self.cached_header() {
            Some(header) => header,
            None => self.refresh(ctx).await?,
        };

        let mut value = HeaderValue::from_str(header.expose_secret()).map_err(|_| {
            Error::non_retriable(ErrorKind::InvalidHeader(
                "authorization: access token contains invalid characters".into(),
            ))
        })?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);

        self.next.send(ctx, request).await
    }
}
