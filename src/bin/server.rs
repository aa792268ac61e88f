//! # Secure Transfer Server
//!
//! Serves authenticated rename requests, or provisions an identity directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secure_transfer::{
    generate_sample, load_config, provision, run, Config, ServerContext, TransportListener,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Secure transfer server
#[derive(Parser)]
#[command(name = "st-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity directory (overrides config)
    #[arg(long)]
    identity_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections and serve commands
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Storage root (overrides config)
        #[arg(short, long)]
        storage: Option<PathBuf>,
    },

    /// Generate authority, server and user keys into the identity directory
    Keygen {
        /// Users to create keys for (defaults to the configured users)
        #[arg(short, long)]
        users: Vec<String>,
    },

    /// Print a sample configuration file
    SampleConfig,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = cli.identity_dir {
        config.server.identity_dir = dir;
    }

    match cli.command {
        Commands::Serve { listen, storage } => {
            if let Some(addr) = listen {
                config.server.listen = addr;
            }
            if let Some(root) = storage {
                config.server.storage_root = root;
            }

            let ctx = ServerContext::from_config(&config).with_context(|| {
                format!(
                    "Failed to load identities from {}",
                    config.server.identity_dir.display()
                )
            })?;
            let listener = TransportListener::bind(config.server.listen, config.protocol.clone())
                .await
                .with_context(|| format!("Failed to bind {}", config.server.listen))?;

            run(listener, Arc::new(ctx)).await?;
        }

        Commands::Keygen { users } => {
            let users = if users.is_empty() {
                config.server.users.clone()
            } else {
                users
            };
            let written = provision(
                &config.server.identity_dir,
                &config.server.authority,
                &config.server.name,
                &users,
            )
            .context("Failed to provision identities")?;
            for path in written {
                info!("Wrote {}", path.display());
            }
        }

        Commands::SampleConfig => {
            print!("{}", generate_sample());
        }
    }

    Ok(())
}
