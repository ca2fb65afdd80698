use anyhow::Result;
use clap::Parser;
use relay_tunnel::cli::{App, Cli, Commands, Config, ConfigCommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("relay_tunnel=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => Config::default_config_file()?,
        };
        match command {
            ConfigCommand::Path => {
                println!("{}", path.display());
                if !path.exists() {
                    info!("Configuration file does not exist yet");
                }
            }
            ConfigCommand::Show => {
                let config = Config::load_or_create(&path)?;
                print!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigCommand::Init => {
                Config::default().save_to(&path)?;
                info!("Default configuration written to {}", path.display());
            }
        }
        return Ok(());
    }

    let app = App::new(cli.config.clone())?;

    let result = match &cli.command {
        Commands::Forward {
            target,
            listen,
            allow,
        } => app.forward(target, listen.as_deref(), allow).await,
        Commands::Probe { target, timeout } => app.probe(target, *timeout).await,
        Commands::Config { .. } => Ok(()),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
