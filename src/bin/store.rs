//! Parameter store binary

use clap::Parser;
use joinrelay::common::{init_tracing, Config};
use joinrelay::StoreServer;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "joinrelay-store")]
#[command(about = "Parameter store used as the join rendezvous point")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, env = "JOINRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for HTTP
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// JSON snapshot file
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Base64 master key for encryption at rest
    #[arg(long, env = "JOINRELAY_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.store.bind_addr = bind;
    }
    if cli.snapshot.is_some() {
        config.store.snapshot_path = cli.snapshot;
    }
    if cli.master_key.is_some() {
        config.store.master_key = cli.master_key;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    init_tracing(&config.log_level, config.log_format);
    tracing::info!("joinrelay-store {}", joinrelay::VERSION);

    StoreServer::new(config.store).serve().await?;
    Ok(())
}
