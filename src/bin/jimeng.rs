//! Jimeng gateway CLI binary.
//!
//! # Commands
//!
//! - `serve` - Start the OpenAI-compatible HTTP server
//! - `check-token` - Check whether a session token is still accepted
//! - `credit` - Show the credit balance of a session token

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use jimeng::{
    config::{Config, DeviceIdentity},
    server::{Backend, Server, UpstreamBackend},
    upstream::{get_credit, token_live, UpstreamClient},
    VERSION,
};

#[derive(Parser)]
#[command(name = "jimeng")]
#[command(version = VERSION)]
#[command(about = "OpenAI-compatible image and video generation gateway", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/jimeng/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check whether a session token is still live
    CheckToken {
        /// Session token
        token: String,
    },

    /// Show the credit balance of a session token
    Credit {
        /// Session token
        token: String,
    },
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Serve { host, port } => runtime.block_on(cmd_serve(config, host, port)),
        Commands::CheckToken { token } => runtime.block_on(cmd_check_token(config, &token)),
        Commands::Credit { token } => runtime.block_on(cmd_credit(config, &token)),
    }
}

async fn cmd_serve(mut config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let server = Server::new(config)?;
    server.run().await?;
    Ok(())
}

fn backend(config: Config) -> anyhow::Result<UpstreamBackend> {
    let client = UpstreamClient::new(config.upstream.clone(), Arc::new(DeviceIdentity::generate()))?;
    Ok(UpstreamBackend::new(client, config))
}

async fn cmd_check_token(config: Config, token: &str) -> anyhow::Result<()> {
    let session = backend(config)?.session(token)?;
    let live = token_live(session.control.as_ref()).await?;
    println!("{}", if live { "live" } else { "expired" });
    if !live {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_credit(config: Config, token: &str) -> anyhow::Result<()> {
    let session = backend(config)?.session(token)?;
    let credit = get_credit(session.control.as_ref()).await?;
    println!("Gift:     {}", credit.gift_credit);
    println!("Purchase: {}", credit.purchase_credit);
    println!("VIP:      {}", credit.vip_credit);
    println!("Total:    {}", credit.total());
    Ok(())
}
