//! # Secure Transfer Client
//!
//! Authenticates to a server and renames files in the user's directory.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secure_transfer::{load_config, CertificateAuthority, Client, ClientIdentity, Config};
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Secure transfer client
#[derive(Parser)]
#[command(name = "st-client")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Username (overrides config)
    #[arg(short, long)]
    user: Option<String>,

    /// Identity directory (overrides config)
    #[arg(long)]
    identity_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rename one file, then log out
    Rename { old: String, new: String },

    /// Read `rename <old> <new>` and `logout` commands from stdin
    Shell,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
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
    if let Some(addr) = cli.server {
        config.client.server = addr;
    }
    if let Some(dir) = cli.identity_dir {
        config.client.identity_dir = dir;
    }
    let Some(username) = cli.user.or(config.client.username.clone()) else {
        bail!("No username given (use --user or set client.username)");
    };

    let identity = ClientIdentity::load(&config.client.identity_dir, &username)
        .context("Failed to load client key")?;
    let authority = CertificateAuthority::load(&config.client.identity_dir, &config.client.authority)
        .context("Failed to load certificate authority key")?;

    let mut client = Client::connect(
        config.client.server,
        &identity,
        &authority,
        &config.client.server_name,
        &config.protocol,
    )
    .await
    .context("Handshake failed")?;
    info!("Session established with '{}'", client.server_name());

    match cli.command {
        Commands::Rename { old, new } => {
            client.rename(&old, &new).await?;
            println!("Renamed '{}' to '{}'", old, new);
        }
        Commands::Shell => {
            println!("Commands: rename <old> <new> | logout");
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.as_slice() {
                    [] => continue,
                    ["rename", old, new] => match client.rename(old, new).await {
                        Ok(()) => println!("OK"),
                        Err(e) if e.is_authentication() => return Err(e.into()),
                        Err(secure_transfer::ProtocolError::CommandRejected(reason)) => {
                            println!("Rejected: {}", reason)
                        }
                        Err(e) => {
                            error!("Request failed: {}", e);
                            return Err(e.into());
                        }
                    },
                    ["logout"] => break,
                    _ => println!("Unknown command"),
                }
            }
        }
    }

    let stats = client.logout().await?;
    info!("Session closed: {}", stats);
    Ok(())
}
