use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relay-tunnel")]
#[command(about = "Forward local TCP ports to VM instances through the tunneling relay")]
pub struct Cli {
    /// Use this configuration file instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identifies the instance and port to tunnel to
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Project that contains the instance
    #[arg(long)]
    pub project: String,
    /// Zone of the instance (e.g., us-central1-a)
    #[arg(long)]
    pub zone: String,
    /// Name of the instance
    pub instance: String,
    /// Port on the instance
    #[arg(short, long, default_value_t = 22)]
    pub port: u16,
    /// Network interface of the instance
    #[arg(long, default_value = "nic0")]
    pub interface: String,
    /// OAuth access token used to authenticate against the relay
    #[arg(long, env = "RELAY_ACCESS_TOKEN", hide_env_values = true)]
    pub token: String,
    /// PKCS#12 client certificate for mutual TLS
    #[arg(long)]
    pub client_cert: Option<PathBuf>,
    /// Password of the client certificate
    #[arg(long, env = "RELAY_CLIENT_CERT_PASSWORD", hide_env_values = true, default_value = "")]
    pub client_cert_password: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Listen on a local port and forward each client through the relay
    ///
    /// Examples:
    ///   relay-tunnel forward --project p --zone us-central1-a vm-1 --port 22
    ///   relay-tunnel forward --project p --zone us-central1-a vm-1 --listen 127.0.0.1:2222
    Forward {
        #[command(flatten)]
        target: TargetArgs,
        /// Local address to listen on. Defaults to the configured bind address
        #[arg(short, long)]
        listen: Option<String>,
        /// Additionally accept clients from these addresses
        #[arg(long = "allow")]
        allow: Vec<IpAddr>,
    },
    /// Check that the relay lets us reach the instance, without sending data
    Probe {
        #[command(flatten)]
        target: TargetArgs,
        /// Seconds to wait for the relay. Defaults to the configured timeout
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Configuration management commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the configuration file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write the default configuration (overwrites existing)
    Init,
}
