//! `User-Agent` telemetry.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, USER_AGENT};

use crate::context::Context;
use crate::error::{Error, ErrorKind, PipelineResult};
use crate::pipeline::{Policy, PolicyFactory};
use crate::request::Request;
use crate::response::Response;

/// Longest application ID accepted in the `User-Agent` prefix.
pub const MAX_APPLICATION_ID_LEN: usize = 24;

/// Configuration for [`TelemetryPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Prefixed to the `User-Agent`. Must not contain spaces.
    pub application_id: Option<String>,
    /// Leave the `User-Agent` header untouched.
    pub disabled: bool,
}

/// Sets `User-Agent: [<application_id> ]azsdk-rust-<module>/<version> (<os>; <arch>)`.
///
/// A value already on the request is kept after ours.
#[derive(Debug)]
pub struct TelemetryPolicy {
    user_agent: Option<String>,
    next: Arc<dyn Policy>,
}

impl TelemetryPolicy {
    /// Telemetry for this crate's own module name and version.
    pub fn factory(options: TelemetryOptions) -> Arc<dyn PolicyFactory> {
        Self::factory_for(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), options)
    }

    /// Telemetry naming a specific client module and version.
    pub fn factory_for(
        module: &str,
        version: &str,
        options: TelemetryOptions,
    ) -> Arc<dyn PolicyFactory> {
        let user_agent = (!options.disabled)
            .then(|| user_agent(module, version, options.application_id.as_deref()));
        Arc::new(move |next: Arc<dyn Policy>| -> Arc<dyn Policy> {
            Arc::new(TelemetryPolicy {
                user_agent: user_agent.clone(),
                next,
            })
        })
    }
}

/// Build the SDK `User-Agent` string.
pub fn user_agent(module: &str, version: &str, application_id: Option<&str>) -> String {
    let module = module.strip_prefix("azure_").unwrap_or(module);
    let sdk = format!(
        "azsdk-rust-{module}/{version} ({}; {})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    match application_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            let id: String = id
                .chars()
                .filter(|c| !c.is_whitespace())
                .take(MAX_APPLICATION_ID_LEN)
                .collect();
            format!("{id} {sdk}")
        }
        None => sdk,
    }
}

#[async_trait]
impl Policy for TelemetryPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        if let Some(user_agent) = &self.user_agent {
            let value = match request.header(USER_AGENT) {
                Some(existing) if !existing.is_empty() => format!("{user_agent} {existing}"),
                _ => user_agent.clone(),
            };
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::new(ErrorKind::InvalidHeader(format!("user-agent: {e}"))))?;
            request.headers_mut().insert(USER_AGENT, value);
        }
        self.next.send(ctx, request).await
    }
}
