use crate::cli::commands::TargetArgs;
use crate::network::{
    AcceptPolicy, AllowList, Bridge, EndpointConfig, InstanceLocator, LoopbackOnly,
    RelayEndpoint, RelayStream, SessionConfig, StaticToken,
};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay host for bearer-token connections
    pub relay_host: String,
    /// Relay host used when a client certificate is configured
    pub mtls_relay_host: String,
    /// Origin header sent with every connection
    pub origin: String,
    /// User agent sent with every connection. Empty disables the header
    pub user_agent: String,
    /// Reconnects per read or write before giving up
    pub max_reconnects: u32,
    /// Bytes a reader consumes before forcing an ACK
    pub max_read_data_per_ack: u64,
    /// Default timeout of the probe command
    pub probe_timeout_secs: u64,
    /// Default listen address for forwarding
    pub bind_addr: String,
    /// Non-loopback addresses allowed to use forwarded ports
    pub allowed_sources: Vec<IpAddr>,
    /// Default PKCS#12 client certificate
    pub client_certificate: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let endpoint = EndpointConfig::default();
        let session = SessionConfig::default();
        Self {
            relay_host: endpoint.relay_host,
            mtls_relay_host: endpoint.mtls_relay_host,
            origin: endpoint.origin,
            user_agent: endpoint.user_agent.unwrap_or_default(),
            max_reconnects: session.max_reconnects,
            max_read_data_per_ack: session.max_read_data_per_ack,
            probe_timeout_secs: 10,
            bind_addr: "127.0.0.1:0".to_string(),
            allowed_sources: Vec::new(),
            client_certificate: None,
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "relay-tunnel", "relay-tunnel")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load configuration from `path`, creating a default file if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).context("Failed to parse configuration file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content).context("Failed to write configuration file")?;
        Ok(())
    }

    /// Reject values the relay client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.relay_host.trim().is_empty() || self.mtls_relay_host.trim().is_empty() {
            anyhow::bail!("Relay hosts must not be empty");
        }
        if self.max_read_data_per_ack == 0 {
            anyhow::bail!("max_read_data_per_ack must be greater than zero");
        }
        if self.probe_timeout_secs == 0 {
            anyhow::bail!("probe_timeout_secs must be greater than zero");
        }
        self.bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind address: {}", self.bind_addr))?;
        Ok(())
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            relay_host: self.relay_host.clone(),
            mtls_relay_host: self.mtls_relay_host.clone(),
            origin: self.origin.clone(),
            user_agent: Some(self.user_agent.clone()).filter(|agent| !agent.is_empty()),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_reconnects: self.max_reconnects,
            max_read_data_per_ack: self.max_read_data_per_ack,
        }
    }

    /// Accept policy for forwarded ports: loopback, plus any allowed sources
    pub fn accept_policy(&self, extra: &[IpAddr]) -> Arc<dyn AcceptPolicy> {
        let mut allowed: Vec<IpAddr> = self.allowed_sources.clone();
        allowed.extend_from_slice(extra);
        if allowed.is_empty() {
            return Arc::new(LoopbackOnly);
        }
        allowed.push(IpAddr::from([127, 0, 0, 1]));
        allowed.push(IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]));
        Arc::new(AllowList(allowed))
    }
}

/// Main application state
pub struct App {
    pub config: Config,
    pub config_path: PathBuf,
}

impl App {
    /// Load configuration from `config_path`, or the default location
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => Config::default_config_file()?,
        };
        let config = Config::load_or_create(&config_path)
            .context("Failed to initialize configuration")?;
        Ok(Self {
            config,
            config_path,
        })
    }

    /// Build the relay endpoint for `target`
    pub fn endpoint(&self, target: &TargetArgs) -> Result<RelayEndpoint> {
        let locator = InstanceLocator::new(&target.project, &target.zone, &target.instance);
        let mut endpoint = RelayEndpoint::new(
            locator,
            target.port,
            Arc::new(StaticToken::new(target.token.clone())),
        )
        .with_config(self.config.endpoint_config())
        .with_interface(&target.interface);

        let certificate = target
            .client_cert
            .as_ref()
            .or(self.config.client_certificate.as_ref());
        if let Some(path) = certificate {
            let der = std::fs::read(path).with_context(|| {
                format!("Failed to read client certificate: {}", path.display())
            })?;
            let identity = native_tls::Identity::from_pkcs12(&der, &target.client_cert_password)
                .context("Failed to load client certificate")?;
            endpoint = endpoint.with_client_identity(identity);
        }

        Ok(endpoint)
    }

    /// Forward a local port until interrupted
    pub async fn forward(
        &self,
        target: &TargetArgs,
        listen: Option<&str>,
        allow: &[IpAddr],
    ) -> Result<()> {
        let endpoint = Arc::new(self.endpoint(target)?);
        let listen = listen.unwrap_or(&self.config.bind_addr);

        let bridge = Bridge::bind(listen, endpoint)
            .await?
            .with_policy(self.config.accept_policy(allow))
            .with_session_config(self.config.session_config());

        let local_addr = bridge.local_addr()?;
        println!(
            "Forwarding {} to {}/{} port {}",
            local_addr, target.zone, target.instance, target.port
        );

        let statistics = bridge.statistics();
        bridge
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        info!(
            "Forwarded {} clients, {} bytes sent, {} bytes received",
            statistics.accepted(),
            statistics.bytes_sent(),
            statistics.bytes_received()
        );
        Ok(())
    }

    /// Probe the relay for `target`
    pub async fn probe(&self, target: &TargetArgs, timeout: Option<u64>) -> Result<()> {
        let endpoint = Arc::new(self.endpoint(target)?);
        let timeout = Duration::from_secs(timeout.unwrap_or(self.config.probe_timeout_secs));

        RelayStream::probe(endpoint, timeout)
            .await
            .with_context(|| format!("Probing {}/{} failed", target.instance, target.port))?;

        println!(
            "{}/{} port {} is reachable",
            target.zone, target.instance, target.port
        );
        Ok(())
    }
}
