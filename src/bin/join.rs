//! Joiner binary

use clap::Parser;
use joinrelay::channel::build_channel;
use joinrelay::common::{init_tracing, ChannelBackend, Config};
use joinrelay::node::{Joiner, TokioRunner};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "joinrelay-join")]
#[command(about = "Wait for the join credential and join the cluster")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, env = "JOINRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Node ID
    #[arg(long)]
    node_id: Option<String>,

    /// Cluster session to join
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

    /// Control plane endpoint used when the credential carries none
    #[arg(long)]
    control_plane_endpoint: Option<String>,

    /// Number of polls before giving up
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Skip the local bootstrap steps
    #[arg(long)]
    skip_bootstrap: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

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
    if cli.control_plane_endpoint.is_some() {
        config.cluster.control_plane_endpoint = cli.control_plane_endpoint;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.retry.credential.max_attempts = max_attempts;
    }
    if cli.skip_bootstrap {
        config.bootstrap.steps.clear();
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    init_tracing(&config.log_level, config.log_format);
    tracing::info!("joinrelay-join {}", joinrelay::VERSION);

    let runner = Arc::new(TokioRunner::new(config.bootstrap.command_timeout));
    let channel = build_channel(&config.channel, runner.clone())?;

    let mut joiner = Joiner::new(config, runner, channel)?;
    let membership = match joiner.run().await {
        Ok(membership) => membership,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), fatal = e.is_fatal(), "joinrelay-join failed: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!(
        restarted = membership.restarted,
        registration_seen = membership.registration_seen,
        "✓ Joiner finished ({})",
        joiner.phase()
    );
    Ok(())
}
