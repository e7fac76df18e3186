//! Operator CLI

use anyhow::bail;
use clap::{Parser, Subcommand};
use joinrelay::channel::{build_channel, seed_placeholder, ChannelKey};
use joinrelay::common::auth::generate_token;
use joinrelay::common::{ChannelBackend, Config, ParamCipher};
use joinrelay::credential::JoinCredential;
use joinrelay::node::{BootstrapMarker, TokioRunner};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "joinrelay")]
#[command(about = "joinrelay join coordination CLI")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, env = "JOINRELAY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Cluster session
    #[arg(long, global = true)]
    session: Option<String>,

    /// Channel backend (memory, http, ssm)
    #[arg(long, global = true)]
    backend: Option<ChannelBackend>,

    /// Parameter server URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Parameter server bearer token
    #[arg(long, env = "JOINRELAY_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current value of the join key
    Get,

    /// Overwrite the join key
    Put {
        /// Value to store
        value: String,

        /// Store the value even if it is not a valid credential
        #[arg(long)]
        force: bool,
    },

    /// Write the "not yet published" placeholder
    Placeholder,

    /// Check a value against the credential grammar
    Validate {
        /// Candidate value
        value: String,
    },

    /// Show the local bootstrap marker
    Status {
        /// Marker file (defaults to the configured path)
        #[arg(long)]
        marker: Option<PathBuf>,
    },

    /// Generate a master key and a session token for the parameter store
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
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
    config.validate()?;

    match cli.command {
        Commands::Get => {
            let (channel, key) = open_channel(&config)?;
            match channel.read(&key).await? {
                Some(value) => println!("{}", value),
                None => bail!("{} not found", key),
            }
        }

        Commands::Put { value, force } => {
            if let Err(e) = JoinCredential::parse_with_sentinel(&value, &config.channel.placeholder) {
                if !force {
                    bail!("refusing to store an invalid credential ({}); use --force", e);
                }
                eprintln!("warning: storing value that joiners will ignore: {}", e);
            }
            let (channel, key) = open_channel(&config)?;
            channel.write(&key, &value).await?;
            println!("✓ Wrote {}", key);
        }

        Commands::Placeholder => {
            let (channel, key) = open_channel(&config)?;
            seed_placeholder(channel.as_ref(), &key, &config.channel.placeholder).await?;
            println!("✓ Seeded {} with placeholder", key);
        }

        Commands::Validate { value } => {
            match JoinCredential::parse_with_sentinel(&value, &config.channel.placeholder) {
                Ok(credential) => {
                    println!("✓ Valid join credential");
                    println!(
                        "  endpoint: {}",
                        credential.endpoint().unwrap_or("(none, control_plane_endpoint required)")
                    );
                    println!("  token:    {:?}", credential.token());
                    for hash in credential.ca_cert_hashes() {
                        println!("  ca hash:  {}", hash);
                    }
                }
                Err(e) => bail!("{}", e),
            }
        }

        Commands::Status { marker } => {
            let path = marker.unwrap_or(config.paths.marker);
            match BootstrapMarker::read(&path).await? {
                Some(marker) => {
                    println!("✓ Bootstrap complete");
                    println!("  role:      {}", marker.role);
                    println!("  node:      {}", marker.node_id);
                    println!("  phase:     {}", marker.phase);
                    println!("  completed: {}", marker.completed_at.to_rfc3339());
                }
                None => bail!("bootstrap not complete ({} missing)", path.display()),
            }
        }

        Commands::Keygen => {
            println!("master_key = \"{}\"", ParamCipher::generate_master_key());
            println!("token      = \"{}\"", generate_token());
        }
    }

    Ok(())
}

fn open_channel(
    config: &Config,
) -> anyhow::Result<(Arc<dyn joinrelay::CoordinationChannel>, ChannelKey)> {
    let runner = Arc::new(TokioRunner::new(config.channel.request_timeout));
    let channel = build_channel(&config.channel, runner)?;
    let key = ChannelKey::from_config(&config.channel)?;
    Ok((channel, key))
}
