//! The raw HTTP exchange at the end of every pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use reqwest::header::HeaderMap;
use reqwest::Method;
use url::Url;

use crate::context::Context;
use crate::error::PipelineResult;
use crate::pipeline::Policy;
use crate::request::Request;
use crate::response::Response;

/// Default connection timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read/response timeout (60 seconds).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an idle pooled connection is kept (90 seconds).
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Maximum idle pooled connections per host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Sends a request over the network and returns the raw response.
///
/// Implementations read the request body from its current position; the
/// retry policy rewinds it before every try.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: &mut Request) -> PipelineResult<Response>;
}

/// Terminal policy handing the request to a [`Transport`].
#[derive(Debug)]
pub(crate) struct TransportPolicy {
    transport: Arc<dyn Transport>,
}

impl TransportPolicy {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Policy for TransportPolicy {
    async fn send(&self, ctx: &Context, request: &mut Request) -> PipelineResult<Response> {
        let info = request.info();
        let response = ctx.run(self.transport.send(request)).await?;
        Ok(response.with_request(info))
    }
}

/// Connection settings for [`DefaultTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }
}

/// Protocol adjustments discovered while talking to a peer.
///
/// The default (both `false`) allows HTTP/2 via ALPN and TLS up to 1.3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ClientConfig {
    /// The peer refused HTTP/2 with `HTTP_1_1_REQUIRED`.
    pub http1_only: bool,
    /// The peer requires TLS renegotiation, which only TLS 1.2 and older support.
    pub tls_renegotiation: bool,
}

impl ClientConfig {
    /// Combine two configurations; adjustments are never undone.
    pub fn merge(self, other: Self) -> Self {
        Self {
            http1_only: self.http1_only || other.http1_only,
            tls_renegotiation: self.tls_renegotiation || other.tls_renegotiation,
        }
    }

    /// The adjustment an error calls for, judged from every message in its source chain.
    pub fn fallback_for(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut config = Self::default();
        let mut current = Some(err);
        while let Some(err) = current {
            let message = err.to_string();
            if message.contains("HTTP_1_1_REQUIRED") {
                config.http1_only = true;
            }
            if message.contains("no renegotiation") {
                config.tls_renegotiation = true;
            }
            current = err.source();
        }
        config
    }
}

/// Builds a client for a [`ClientConfig`] and performs one exchange with it.
#[async_trait]
trait Connector: Send + Sync {
    type Client: Clone + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static + Into<crate::error::Error>;

    fn build(&self, options: &TransportOptions, config: ClientConfig)
        -> PipelineResult<Self::Client>;

    async fn execute(
        &self,
        client: &Self::Client,
        outgoing: Outgoing,
    ) -> Result<Response, Self::Error>;
}

#[derive(Debug, Clone, Copy, Default)]
struct ReqwestConnector;

#[async_trait]
impl Connector for ReqwestConnector {
    type Client = reqwest::Client;
    type Error = reqwest::Error;

    fn build(
        &self,
        options: &TransportOptions,
        config: ClientConfig,
    ) -> PipelineResult<reqwest::Client> {
        build_client(options, config)
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        outgoing: Outgoing,
    ) -> Result<Response, reqwest::Error> {
        let response = outgoing.into_reqwest(client).send().await?;
        Ok(Response::from_reqwest(response))
    }
}

/// One client per [`ClientConfig`], plus the config new sends start from.
struct AdaptiveClients<C: Connector> {
    connector: C,
    options: TransportOptions,
    clients: RwLock<HashMap<ClientConfig, C::Client>>,
    active: RwLock<ClientConfig>,
}

impl<C: Connector> AdaptiveClients<C> {
    fn new(connector: C, options: TransportOptions) -> PipelineResult<Self> {
        let config = ClientConfig::default();
        let client = connector.build(&options, config)?;
        Ok(Self {
            connector,
            options,
            clients: RwLock::new(HashMap::from([(config, client)])),
            active: RwLock::new(config),
        })
    }

    fn active_config(&self) -> ClientConfig {
        *self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_for(&self, config: ClientConfig) -> PipelineResult<C::Client> {
        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&config)
        {
            return Ok(client.clone());
        }

        let client = self.connector.build(&self.options, config)?;
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        Ok(clients.entry(config).or_insert(client).clone())
    }

    fn publish(&self, config: ClientConfig) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = active.merge(config);
    }

    async fn send(&self, outgoing: Outgoing) -> PipelineResult<Response> {
        let mut config = self.active_config();

        loop {
            let client = self.client_for(config)?;
            match self.connector.execute(&client, outgoing.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let adjusted = config.merge(ClientConfig::fallback_for(&err));
                    if adjusted == config {
                        return Err(err.into());
                    }
                    tracing::debug!(
                        http1_only = adjusted.http1_only,
                        tls_renegotiation = adjusted.tls_renegotiation,
                        error = %err,
                        "peer rejected connection settings, retrying with adjusted client"
                    );
                    self.publish(adjusted);
                    config = adjusted;
                }
            }
        }
    }
}

/// The default transport: a pooled `reqwest` client per [`ClientConfig`].
///
/// Starts with HTTP/2 allowed. When a peer rejects HTTP/2 or demands TLS
/// renegotiation, the send is repeated with an adjusted client and the
/// adjustment is remembered for the rest of this transport's lifetime.
pub struct DefaultTransport {
    clients: AdaptiveClients<ReqwestConnector>,
}

impl DefaultTransport {
    pub fn new() -> PipelineResult<Self> {
        Self::with_options(TransportOptions::default())
    }

    pub fn with_options(options: TransportOptions) -> PipelineResult<Self> {
        Ok(Self {
            clients: AdaptiveClients::new(ReqwestConnector, options)?,
        })
    }

    pub fn options(&self) -> &TransportOptions {
        &self.clients.options
    }

    /// The configuration new sends start with.
    pub fn active_config(&self) -> ClientConfig {
        self.clients.active_config()
    }
}

impl fmt::Debug for DefaultTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTransport")
            .field("options", self.options())
            .field("active", &self.active_config())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn send(&self, request: &mut Request) -> PipelineResult<Response> {
        let outgoing = Outgoing::read(request).await?;
        self.clients.send(outgoing).await
    }
}

/// Use a caller-configured `reqwest` client as-is, without protocol fallbacks.
#[async_trait]
impl Transport for reqwest::Client {
    async fn send(&self, request: &mut Request) -> PipelineResult<Response> {
        let outgoing = Outgoing::read(request).await?;
        let response = outgoing.into_reqwest(self).send().await?;
        Ok(Response::from_reqwest(response))
    }
}

fn build_client(options: &TransportOptions, config: ClientConfig) -> PipelineResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(options.connect_timeout)
        .timeout(options.read_timeout)
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .min_tls_version(reqwest::tls::Version::TLS_1_2);
    if config.http1_only {
        builder = builder.http1_only();
    }
    if config.tls_renegotiation {
        builder = builder.max_tls_version(reqwest::tls::Version::TLS_1_2);
    }
    Ok(builder.build()?)
}

/// A fully buffered request, ready to be sent any number of times.
#[derive(Debug, Clone)]
struct Outgoing {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Outgoing {
    async fn read(request: &mut Request) -> PipelineResult<Self> {
        let body = match request.body_mut() {
            Some(body) => Some(body.read_to_bytes().await?),
            None => None,
        };
        Ok(Self {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
        })
    }

    fn into_reqwest(self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let builder = client.request(self.method, self.url).headers(self.headers);
        match self.body {
            Some(body) => builder.body(body),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::Mutex;
    use thiserror::Error;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Error)]
    #[error("connection error")]
    struct Outer(#[source] Inner);

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Inner(&'static str);

    #[test]
    fn http2_refusal_detected_in_source_chain() {
        let err = Outer(Inner("stream error received: HTTP_1_1_REQUIRED"));
        let config = ClientConfig::fallback_for(&err);
        assert!(config.http1_only);
        assert!(!config.tls_renegotiation);
    }

    #[test]
    fn renegotiation_demand_detected() {
        let err = Inner("remote error: tls: no renegotiation");
        let config = ClientConfig::fallback_for(&err);
        assert!(config.tls_renegotiation);
        assert!(!config.http1_only);
    }

    #[test]
    fn unrelated_errors_need_no_fallback() {
        let err = Inner("connection refused");
        assert_eq!(ClientConfig::fallback_for(&err), ClientConfig::default());
    }

    #[test]
    fn merge_never_undoes_adjustments() {
        let http1 = ClientConfig {
            http1_only: true,
            tls_renegotiation: false,
        };
        let merged = http1.merge(ClientConfig::default());
        assert_eq!(merged, http1);
        let both = merged.merge(ClientConfig {
            http1_only: false,
            tls_renegotiation: true,
        });
        assert!(both.http1_only && both.tls_renegotiation);
    }

    #[test]
    fn published_config_is_merged() {
        let transport = DefaultTransport::new().expect("transport");
        transport.clients.publish(ClientConfig {
            http1_only: true,
            tls_renegotiation: false,
        });
        transport.clients.publish(ClientConfig::default());
        assert!(transport.active_config().http1_only);
    }

    #[test]
    fn clients_are_memoized_per_config() {
        let transport = DefaultTransport::new().expect("transport");
        let config = ClientConfig {
            http1_only: true,
            tls_renegotiation: false,
        };
        transport.clients.client_for(config).unwrap();
        transport.clients.client_for(config).unwrap();
        assert_eq!(transport.clients.clients.read().unwrap().len(), 2);
    }

    /// Clients are the configs they were built for. Sends fail while the
    /// client lacks an adjustment the peer insists on.
    #[derive(Default)]
    struct PickyConnector {
        needs: ClientConfig,
        refusal: &'static str,
        yield_first: bool,
        builds: Mutex<Vec<ClientConfig>>,
        sends: Mutex<Vec<ClientConfig>>,
    }

    impl PickyConnector {
        fn http2_refusing() -> Self {
            Self {
                needs: ClientConfig {
                    http1_only: true,
                    tls_renegotiation: false,
                },
                refusal: "stream error received: HTTP_1_1_REQUIRED",
                ..Self::default()
            }
        }

        fn builds(&self) -> Vec<ClientConfig> {
            self.builds.lock().unwrap().clone()
        }

        fn sends(&self) -> Vec<ClientConfig> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for PickyConnector {
        type Client = ClientConfig;
        type Error = std::io::Error;

        fn build(
            &self,
            _options: &TransportOptions,
            config: ClientConfig,
        ) -> PipelineResult<ClientConfig> {
            self.builds.lock().unwrap().push(config);
            Ok(config)
        }

        async fn execute(
            &self,
            client: &ClientConfig,
            _outgoing: Outgoing,
        ) -> Result<Response, std::io::Error> {
            self.sends.lock().unwrap().push(*client);
            if self.yield_first {
                tokio::task::yield_now().await;
            }
            if client.merge(self.needs) == *client {
                Ok(Response::new(StatusCode::OK, HeaderMap::new(), "ok"))
            } else {
                Err(std::io::Error::other(self.refusal))
            }
        }
    }

    fn outgoing() -> Outgoing {
        Outgoing {
            method: Method::GET,
            url: Url::parse("https://example.com/resource").unwrap(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    const HTTP1: ClientConfig = ClientConfig {
        http1_only: true,
        tls_renegotiation: false,
    };

    #[tokio::test]
    async fn http2_refusal_resends_once_with_http1_client() {
        let clients =
            AdaptiveClients::new(PickyConnector::http2_refusing(), TransportOptions::default())
                .unwrap();

        let response = clients.send(outgoing()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(clients.connector.sends(), vec![ClientConfig::default(), HTTP1]);
        assert_eq!(clients.active_config(), HTTP1);

        // Later sends start from the adjusted client.
        clients.send(outgoing()).await.unwrap();
        assert_eq!(clients.connector.sends().len(), 3);
        assert_eq!(clients.connector.sends()[2], HTTP1);
    }

    #[tokio::test]
    async fn renegotiation_demand_caps_tls() {
        let connector = PickyConnector {
            needs: ClientConfig {
                http1_only: false,
                tls_renegotiation: true,
            },
            refusal: "remote error: tls: no renegotiation",
            ..PickyConnector::default()
        };
        let clients = AdaptiveClients::new(connector, TransportOptions::default()).unwrap();

        clients.send(outgoing()).await.unwrap();

        assert!(clients.active_config().tls_renegotiation);
        assert!(!clients.active_config().http1_only);
        assert_eq!(clients.connector.sends().len(), 2);
    }

    #[tokio::test]
    async fn repeated_refusal_is_returned_without_looping() {
        // The peer keeps refusing even the adjusted client.
        let connector = PickyConnector {
            needs: ClientConfig {
                http1_only: true,
                tls_renegotiation: true,
            },
            refusal: "stream error received: HTTP_1_1_REQUIRED",
            ..PickyConnector::default()
        };
        let clients = AdaptiveClients::new(connector, TransportOptions::default()).unwrap();

        let err = clients.send(outgoing()).await.unwrap_err();

        assert!(err.to_string().contains("HTTP_1_1_REQUIRED"));
        assert_eq!(clients.connector.sends(), vec![ClientConfig::default(), HTTP1]);
        assert_eq!(clients.active_config(), HTTP1);
    }

    #[tokio::test]
    async fn unrelated_failure_is_not_resent() {
        let connector = PickyConnector {
            refusal: "connection refused",
            ..PickyConnector::http2_refusing()
        };
        let clients = AdaptiveClients::new(connector, TransportOptions::default()).unwrap();

        clients.send(outgoing()).await.unwrap_err();

        assert_eq!(clients.connector.sends().len(), 1);
        assert_eq!(clients.active_config(), ClientConfig::default());
    }

    #[tokio::test]
    async fn concurrent_first_sends_share_one_adjusted_client() {
        let connector = PickyConnector {
            yield_first: true,
            ..PickyConnector::http2_refusing()
        };
        let clients = AdaptiveClients::new(connector, TransportOptions::default()).unwrap();

        let (first, second) = tokio::join!(clients.send(outgoing()), clients.send(outgoing()));

        assert_eq!(first.unwrap().status(), StatusCode::OK);
        assert_eq!(second.unwrap().status(), StatusCode::OK);
        // Both discovered the refusal; only one HTTP/1.1 client was built.
        assert_eq!(
            clients.connector.sends(),
            vec![ClientConfig::default(), ClientConfig::default(), HTTP1, HTTP1]
        );
        assert_eq!(clients.connector.builds(), vec![ClientConfig::default(), HTTP1]);
        assert_eq!(clients.clients.read().unwrap().len(), 2);
        assert_eq!(clients.active_config(), HTTP1);
    }

    #[tokio::test]
    async fn default_transport_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/things/1"))
            .and(header("x-test", "yes"))
            .and(body_string("payload"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = DefaultTransport::new().expect("transport");
        let url = Url::parse(&format!("{}/things/1", server.uri())).unwrap();
        let mut request = Request::new(Method::PUT, url);
        request
            .insert_header(reqwest::header::HeaderName::from_static("x-test"), "yes")
            .unwrap();
        request.set_body("payload");

        let mut response = transport.send(&mut request).await.expect("should send");

        assert_eq!(response.status().as_u16(), 201);
        assert_eq!(response.text().await.unwrap(), "created");
        assert_eq!(transport.active_config(), ClientConfig::default());
    }

    #[tokio::test]
    async fn reqwest_client_is_a_transport() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = Url::parse(&format!("{}/ping", server.uri())).unwrap();
        let mut request = Request::new(Method::GET, url);

        let mut response = Transport::send(&client, &mut request).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn transport_policy_records_request_info() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let policy = TransportPolicy::new(Arc::new(DefaultTransport::new().unwrap()));
        let url = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        let mut request = Request::new(Method::DELETE, url.clone());

        let response = policy.send(&Context::new(), &mut request).await.unwrap();
        let info = response.request().expect("info");
        assert_eq!(info.method, Method::DELETE);
        assert_eq!(info.url, url);
    }
}
