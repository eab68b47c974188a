use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devicelink::auth::JwtVerifier;
use devicelink::config::{Config, ConfigOverrides};
use devicelink::daemon;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "devicelink", version)]
struct Cli {
    /// Path to config file (defaults plus environment when omitted)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the signaling server
    Serve {
        /// Listen address, overrides the config
        #[arg(long = "listen")]
        listen: Option<String>,
    },
    /// Print an access token for an identity
    Token {
        #[arg(long = "user")]
        user: Uuid,
        #[arg(long = "ttl-secs", default_value_t = 3600)]
        ttl_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut overrides = ConfigOverrides::from_env();
    if let Commands::Serve {
        listen: Some(listen),
    } = &cli.command
    {
        overrides.listen_addr = Some(listen.clone());
    }
    let cfg = match &cli.config {
        Some(path) => Config::load_with_overrides(path, overrides)?,
        None => Config::with_overrides(overrides)?,
    };

    match cli.command {
        Commands::Serve { .. } => serve(cfg).await,
        Commands::Token { user, ttl_secs } => {
            let token = JwtVerifier::new(&cfg.jwt_secret)
                .issue(user, chrono::Duration::seconds(ttl_secs))
                .context("issue token")?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.notify_one();
        }
    });

    daemon::run_with_shutdown(cfg, shutdown).await
}
