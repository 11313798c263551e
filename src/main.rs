//! SqlExc - MySQL-wire-compatible SQL execution gateway

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlexec::config::GatewayConfig;
use sqlexec::server::{GatewayContext, SqlServer};

/// SqlExc - MySQL-wire-compatible SQL execution gateway
#[derive(Parser)]
#[command(name = "sqlexec")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (overrides the search path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Data directory for the persistent KV backend
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Write a default configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start { data_dir } => run_start(cli.config, data_dir).await,
        Commands::Init { output } => run_init(&output),
        Commands::Validate => run_validate(cli.config),
        Commands::Version => {
            println!("sqlexec {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("sqlexec={level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<GatewayConfig> {
    Ok(match path {
        Some(path) => GatewayConfig::load_from(&path)?,
        None => GatewayConfig::load()?,
    })
}

async fn run_start(config: Option<PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let ctx = GatewayContext::new(config, data_dir.as_deref()).await?;
    let server = SqlServer::new(ctx);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

fn run_init(output: &PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    std::fs::write(output, GatewayConfig::default_json())?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

fn run_validate(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    config.validate()?;
    println!(
        "Configuration OK (listen {}:{})",
        config.server.host, config.server.port
    );
    Ok(())
}
