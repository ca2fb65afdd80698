//! Relay endpoints: where relay sessions get their connections from.

use crate::network::error::{RelayError, TransportError};
use crate::network::transport::NetworkStream;
use crate::network::websocket::WebSocketTransport;
use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, instrument, warn};
use url::Url;

pub const DEFAULT_RELAY_HOST: &str = "tunnel.cloudproxy.app";
pub const DEFAULT_MTLS_RELAY_HOST: &str = "mtls.tunnel.cloudproxy.app";
pub const RELAY_SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";
pub const DEFAULT_ORIGIN: &str = "bot:iap-tunneler";
pub const DEFAULT_INTERFACE: &str = "nic0";

/// Target for a relay connection.
#[async_trait]
pub trait RelayTarget: Send + Sync {
    /// Whether connections authenticate with a client certificate
    fn is_mutual_tls_enabled(&self) -> bool {
        false
    }

    /// Open a connection for a brand-new session.
    async fn connect(&self) -> Result<Arc<dyn NetworkStream>, RelayError>;

    /// Open a connection that resumes session `sid`. `last_byte_consumed`
    /// is the number of bytes this client has received so far.
    async fn reconnect(
        &self,
        sid: &str,
        last_byte_consumed: u64,
    ) -> Result<Arc<dyn NetworkStream>, RelayError>;
}

/// Supplies short-lived bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<String>;
}

/// A token that never changes, e.g. one passed on the command line.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        if self.0.is_empty() {
            anyhow::bail!("No access token configured");
        }
        Ok(self.0.clone())
    }
}

/// Identifies the VM instance a tunnel leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLocator {
    pub project: String,
    pub zone: String,
    pub instance: String,
}

impl InstanceLocator {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project, self.zone, self.instance
        )
    }
}

/// Connection parameters shared by all endpoints
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub relay_host: String,
    pub mtls_relay_host: String,
    pub origin: String,
    pub user_agent: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            mtls_relay_host: DEFAULT_MTLS_RELAY_HOST.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            user_agent: Some(format!("relay-tunnel/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// WebSocket endpoint of the tunneling relay for one instance and port.
pub struct RelayEndpoint {
    config: EndpointConfig,
    locator: InstanceLocator,
    port: u16,
    interface: String,
    token_source: Arc<dyn TokenSource>,
    client_identity: Option<native_tls::Identity>,
}

impl RelayEndpoint {
    pub fn new(locator: InstanceLocator, port: u16, token_source: Arc<dyn TokenSource>) -> Self {
        Self {
            config: EndpointConfig::default(),
            locator,
            port,
            interface: DEFAULT_INTERFACE.to_string(),
            token_source,
            client_identity: None,
        }
    }

    pub fn with_config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Authenticate with a client certificate. This switches to the mTLS
    /// relay host.
    pub fn with_client_identity(mut self, identity: native_tls::Identity) -> Self {
        self.client_identity = Some(identity);
        self
    }

    pub fn locator(&self) -> &InstanceLocator {
        &self.locator
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn host(&self) -> &str {
        if self.client_identity.is_some() {
            &self.config.mtls_relay_host
        } else {
            &self.config.relay_host
        }
    }

    // Defeats caching proxies between us and the relay.
    fn cache_buster() -> String {
        rand::thread_rng().gen::<u32>().to_string()
    }

    fn parse_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, RelayError> {
        let base = format!("wss://{}/v4/{}", self.host(), path);
        Url::parse_with_params(&base, params)
            .map_err(|e| RelayError::InvalidEndpoint(format!("{}: {}", base, e)))
    }

    /// URL for opening a new session
    pub fn connect_url(&self) -> Result<Url, RelayError> {
        self.parse_url(
            "connect",
            &[
                ("project", self.locator.project.clone()),
                ("port", self.port.to_string()),
                ("newWebsocket", "true".to_string()),
                ("zone", self.locator.zone.clone()),
                ("instance", self.locator.instance.clone()),
                ("interface", self.interface.clone()),
                ("_", Self::cache_buster()),
            ],
        )
    }

    /// URL for resuming session `sid`
    pub fn reconnect_url(&self, sid: &str, ack: u64) -> Result<Url, RelayError> {
        self.parse_url(
            "reconnect",
            &[
                ("sid", sid.to_string()),
                ("ack", ack.to_string()),
                ("newWebsocket", "true".to_string()),
                ("zone", self.locator.zone.clone()),
                ("_", Self::cache_buster()),
            ],
        )
    }

    /// Build the upgrade request with the headers the relay requires
    pub fn build_request(&self, url: &Url, token: &str) -> Result<Request, RelayError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::InvalidEndpoint(e.to_string()))?;

        let origin = HeaderValue::from_str(&self.config.origin)
            .map_err(|e| RelayError::InvalidEndpoint(format!("Invalid origin: {}", e)))?;
        let authorization = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RelayError::AccessDenied("The access token is malformed".into()))?;

        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(RELAY_SUBPROTOCOL),
        );
        headers.insert(header::ORIGIN, origin);
        headers.insert(header::AUTHORIZATION, authorization);

        if let Some(user_agent) = &self.config.user_agent {
            match HeaderValue::from_str(user_agent) {
                Ok(value) => {
                    headers.insert(header::USER_AGENT, value);
                }
                Err(e) => warn!(error = %e, "Failed to set user agent, continuing without it"),
            }
        }

        Ok(request)
    }

    fn tls_connector(&self) -> Result<Option<Connector>, RelayError> {
        let Some(identity) = &self.client_identity else {
            return Ok(None);
        };
        let connector = native_tls::TlsConnector::builder()
            .identity(identity.clone())
            .build()
            .map_err(|e| RelayError::InvalidEndpoint(format!("Invalid client certificate: {}", e)))?;
        Ok(Some(Connector::NativeTls(connector)))
    }

    #[instrument(level = "debug", skip(self, url), fields(path = url.path()))]
    async fn open(&self, url: Url) -> Result<Arc<dyn NetworkStream>, RelayError> {
        let token = self.token_source.access_token().await.map_err(|e| {
            RelayError::AccessDenied(format!("Failed to obtain an access token: {:#}", e))
        })?;

        let request = self.build_request(&url, &token)?;
        let connector = self.tls_connector()?;

        let (socket, response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| match e {
                WsError::Http(response) => {
                    let status = response.status().as_u16();
                    if status == 401 || status == 403 {
                        RelayError::AccessDenied(format!(
                            "The relay rejected the credentials (HTTP {})",
                            status
                        ))
                    } else {
                        TransportError::HandshakeRejected { status }.into()
                    }
                }
                WsError::Io(e) => TransportError::Io(e).into(),
                other => TransportError::WebSocket(other.to_string()).into(),
            })?;

        debug!(status = %response.status(), "WebSocket connection established");
        Ok(Arc::new(WebSocketTransport::new(socket)))
    }
}

#[async_trait]
impl RelayTarget for RelayEndpoint {
    fn is_mutual_tls_enabled(&self) -> bool {
        self.client_identity.is_some()
    }

    async fn connect(&self) -> Result<Arc<dyn NetworkStream>, RelayError> {
        debug!(target_instance = %self.locator, port = self.port, "Connecting to relay");
        let url = self.connect_url()?;
        self.open(url).await
    }

    async fn reconnect(
        &self,
        sid: &str,
        last_byte_consumed: u64,
    ) -> Result<Arc<dyn NetworkStream>, RelayError> {
        debug!(ack = last_byte_consumed, "Reconnecting to relay");
        let url = self.reconnect_url(sid, last_byte_consumed)?;
        self.open(url).await
    }
}
