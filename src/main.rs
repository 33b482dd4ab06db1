//! labhost binary: serve the instrument host or validate a configuration.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use labhost::config::Settings;
use labhost::proxy::ProxyServer;
use labhost::registry::{InstrumentDescriptor, Registry};
use labhost::session::SessionManager;

#[derive(Parser)]
#[command(name = "labhost", version, about = "Remote access host for laboratory instruments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the host: naming service, session manager and TCP proxy.
    Serve {
        /// Path to a TOML configuration file (default: config/default.toml).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a configuration file, then exit.
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Query a running host for one instrument's status.
    Status {
        /// Host address, e.g. 127.0.0.1:9090.
        #[arg(short, long)]
        addr: String,
        instrument: String,
    },
}

fn load_settings(config: &Option<PathBuf>) -> anyhow::Result<Settings> {
    match config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Settings::new(None).context("failed to load configuration from config/default"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { config } => {
            let settings = load_settings(&config)?;
            println!(
                "configuration ok: {} instrument(s), proxy on {}:{}",
                settings.instruments.len(),
                settings.server.bind_addr,
                settings.server.port
            );
            Ok(())
        }
        Command::Status { addr, instrument } => {
            let mut client = labhost::client::RemoteClient::connect(addr.as_str())
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            let status = client.status(&instrument).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Serve { config } => serve(load_settings(&config)?).await,
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = Arc::new(Registry::new(&settings.registry));
    let sweeper = registry.start_sweeper();

    let sessions = Arc::new(SessionManager::from_settings(&settings)?);

    // Locally served instruments announce themselves to this host's own
    // naming service, so clients can discover them by name.
    for name in sessions.instruments() {
        if let Some(instrument) = settings.instruments.get(&name) {
            registry
                .register(InstrumentDescriptor {
                    name: name.clone(),
                    driver_type: instrument.driver.clone(),
                    host: settings.server.bind_addr.clone(),
                    port: settings.server.port,
                })
                .await?;
        }
    }

    // Keep the self-registrations alive for as long as the host runs.
    let renewer = {
        let registry = Arc::clone(&registry);
        let names = sessions.instruments();
        let interval = settings.registry.entry_ttl / 2;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for name in &names {
                    let _ = registry.renew(name).await;
                }
            }
        })
    };

    let server = ProxyServer::bind(&settings.server, Arc::clone(&registry), Arc::clone(&sessions))
        .await?;
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("shutdown signal received, draining sessions");

    server_task.abort();
    renewer.abort();
    sweeper.abort();
    sessions.shutdown().await;
    info!("labhost stopped");
    Ok(())
}
