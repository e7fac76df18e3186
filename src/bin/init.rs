//! Initializer binary

use clap::Parser;
use joinrelay::channel::build_channel;
use joinrelay::common::{init_tracing, parse_duration, ChannelBackend, Config};
use joinrelay::node::{Initializer, TokioRunner};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "joinrelay-init")]
#[command(about = "Initialize the control plane and publish the join credential")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, env = "JOINRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Node ID
    #[arg(long)]
    node_id: Option<String>,

    /// Cluster session the credential is published under
    #[arg(long)]
    session: Option<String>,

    /// Channel backend (memory, http, ssm)
    #[arg(long)]
    backend: Option<ChannelBackend>,

    /// Parameter server URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Parameter server bearer token
    #[arg(long, env = "JOINRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Advertise this address instead of asking the metadata service
    #[arg(long)]
    advertise_address: Option<Ipv4Addr>,

    /// Join token lifetime (e.g. 24h)
    #[arg(long, value_parser = parse_ttl)]
    token_ttl: Option<Duration>,

    /// Refuse to overwrite a credential that is already published
    #[arg(long)]
    refuse_overwrite: bool,

    /// Skip the local bootstrap steps
    #[arg(long)]
    skip_bootstrap: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_ttl(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(session) = cli.session {
        config.channel.session_id = session;
    }
    if let Some(backend) = cli.backend {
        config.channel.backend = backend;
    }
    if let Some(endpoint) = cli.endpoint {
        config.channel.endpoint = endpoint;
    }
    if cli.token.is_some() {
        config.channel.token = cli.token;
    }
    if cli.advertise_address.is_some() {
        config.cluster.advertise_address = cli.advertise_address;
    }
    if let Some(ttl) = cli.token_ttl {
        config.cluster.token_ttl = ttl;
    }
    if cli.refuse_overwrite {
        config.cluster.refuse_overwrite = true;
    }
    if cli.skip_bootstrap {
        config.bootstrap.steps.clear();
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    init_tracing(&config.log_level, config.log_format);
    tracing::info!("joinrelay-init {}", joinrelay::VERSION);

    let runner = Arc::new(TokioRunner::new(config.bootstrap.command_timeout));
    let channel = build_channel(&config.channel, runner.clone())?;

    let mut initializer = Initializer::new(config, runner, channel)?;
    if let Err(e) = initializer.run().await {
        tracing::error!(kind = ?e.kind(), fatal = e.is_fatal(), "joinrelay-init failed: {}", e);
        return Err(e.into());
    }

    tracing::info!("✓ Initializer finished ({})", initializer.phase());
    Ok(())
}
