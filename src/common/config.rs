//! Configuration for joinrelay components
//!
//! Sources are layered: built-in defaults, then an optional TOML file, then
//! `JOINRELAY__SECTION__FIELD` environment variables. Binaries apply their CLI
//! flags on top of the loaded value.

use crate::common::utils::{duration_str, validate_segment};
use crate::common::{Error, Result};
use crate::node::bootstrap::{default_steps, BootstrapStep};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up when none is given explicitly
pub const DEFAULT_CONFIG_FILE: &str = "joinrelay.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node ID (unique identifier, used in logs and the bootstrap marker)
    pub node_id: String,

    /// Logging level
    pub log_level: String,

    /// Log output format
    pub log_format: LogFormat,

    pub channel: ChannelConfig,
    pub cluster: ClusterConfig,
    pub retry: RetrySettings,
    pub paths: PathsConfig,
    pub bootstrap: BootstrapConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            channel: ChannelConfig::default(),
            cluster: ClusterConfig::default(),
            retry: RetrySettings::default(),
            paths: PathsConfig::default(),
            bootstrap: BootstrapConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Role a node plays in the join handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Initializer,
    Joiner,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Initializer => write!(f, "initializer"),
            NodeRole::Joiner => write!(f, "joiner"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelBackend {
    /// In-process map, for tests and single-host runs
    Memory,
    /// joinrelay-store parameter server
    Http,
    /// AWS SSM Parameter Store through the `aws` CLI
    Ssm,
}

impl std::str::FromStr for ChannelBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(ChannelBackend::Memory),
            "http" => Ok(ChannelBackend::Http),
            "ssm" => Ok(ChannelBackend::Ssm),
            other => Err(Error::InvalidConfig(format!(
                "unknown channel backend: {} (expected memory, http or ssm)",
                other
            ))),
        }
    }
}

/// Coordination channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub backend: ChannelBackend,

    /// Key namespace root, first segment of `/<domain>/<session>/join-command`
    pub domain: String,

    /// Cluster/session identifier
    pub session_id: String,

    /// Value meaning "not yet published"
    pub placeholder: String,

    /// Parameter server base URL (http backend)
    pub endpoint: String,

    /// Bearer token presented to the parameter server (http backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Region passed to the aws CLI (ssm backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// KMS key for SecureString parameters (ssm backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,

    /// Per-request timeout for channel reads and writes
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backend: ChannelBackend::Http,
            domain: "joinrelay".to_string(),
            session_id: "default".to_string(),
            placeholder: crate::channel::SENTINEL_PLACEHOLDER.to_string(),
            endpoint: "http://127.0.0.1:7070".to_string(),
            token: None,
            region: None,
            kms_key_id: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Cluster initialization and join settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub pod_network_cidr: String,

    /// Skip metadata lookup and advertise this address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<Ipv4Addr>,

    /// Used by joiners when the credential carries no endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<String>,

    /// Lifetime of the published join token
    #[serde(with = "duration_str")]
    pub token_ttl: Duration,

    /// Instance metadata service base URL
    pub metadata_endpoint: String,

    pub overlay_manifest: String,
    pub overlay_namespace: String,
    pub overlay_selector: String,
    pub overlay_min_running: usize,

    /// Refuse to overwrite a credential another initializer already published
    pub refuse_overwrite: bool,

    /// Cluster agent systemd unit
    pub kubelet_unit: String,

    /// How far back the journal is searched for a registration line
    #[serde(with = "duration_str")]
    pub registration_window: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            pod_network_cidr: "10.244.0.0/16".to_string(),
            advertise_address: None,
            control_plane_endpoint: None,
            token_ttl: Duration::from_secs(24 * 3600),
            metadata_endpoint: "http://169.254.169.254".to_string(),
            overlay_manifest:
                "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml"
                    .to_string(),
            overlay_namespace: "kube-flannel".to_string(),
            overlay_selector: "app=flannel".to_string(),
            overlay_min_running: 1,
            refuse_overwrite: false,
            kubelet_unit: "kubelet".to_string(),
            registration_window: Duration::from_secs(120),
        }
    }
}

/// One bounded polling site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollSettings {
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl PollSettings {
    pub const API_READY: Self = Self {
        max_attempts: 24,
        interval: Duration::from_secs(5),
    };
    pub const OVERLAY_READY: Self = Self {
        max_attempts: 30,
        interval: Duration::from_secs(10),
    };
    pub const CREDENTIAL: Self = Self {
        max_attempts: 30,
        interval: Duration::from_secs(30),
    };
}

/// `[retry.<site>]` tables may set either field; the other keeps the site default
mod poll_site {
    use super::PollSettings;
    use crate::common::utils::parse_duration;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct PollOverride {
        max_attempts: Option<u32>,
        interval: Option<String>,
    }

    fn merge<'de, D: Deserializer<'de>>(d: D, base: PollSettings) -> Result<PollSettings, D::Error> {
        let over = PollOverride::deserialize(d)?;
        let interval = match over.interval {
            Some(raw) => parse_duration(&raw).map_err(serde::de::Error::custom)?,
            None => base.interval,
        };
        Ok(PollSettings {
            max_attempts: over.max_attempts.unwrap_or(base.max_attempts),
            interval,
        })
    }

    pub fn api_ready<'de, D: Deserializer<'de>>(d: D) -> Result<PollSettings, D::Error> {
        merge(d, PollSettings::API_READY)
    }

    pub fn overlay_ready<'de, D: Deserializer<'de>>(d: D) -> Result<PollSettings, D::Error> {
        merge(d, PollSettings::OVERLAY_READY)
    }

    pub fn credential<'de, D: Deserializer<'de>>(d: D) -> Result<PollSettings, D::Error> {
        merge(d, PollSettings::CREDENTIAL)
    }
}

/// Attempt budgets for every polling site
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    #[serde(deserialize_with = "poll_site::api_ready")]
    pub api_ready: PollSettings,
    #[serde(deserialize_with = "poll_site::overlay_ready")]
    pub overlay_ready: PollSettings,
    #[serde(deserialize_with = "poll_site::credential")]
    pub credential: PollSettings,

    /// Delay before checking the cluster agent after a join
    #[serde(with = "duration_str")]
    pub settle_time: Duration,

    /// 1.0 keeps intervals fixed
    pub backoff_multiplier: f64,

    /// Randomize each sleep to 0.5x..1.5x
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            api_ready: PollSettings::API_READY,
            overlay_ready: PollSettings::OVERLAY_READY,
            credential: PollSettings::CREDENTIAL,
            settle_time: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Written once when a role finishes successfully
    pub marker: PathBuf,

    /// Admin kubeconfig produced by `kubeadm init`
    pub admin_kubeconfig: PathBuf,

    /// Where the admin kubeconfig is copied for kubectl
    pub kubeconfig: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            marker: PathBuf::from("/var/lib/joinrelay/bootstrap-complete"),
            admin_kubeconfig: PathBuf::from("/etc/kubernetes/admin.conf"),
            kubeconfig: PathBuf::from("/root/.kube/config"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub steps: Vec<BootstrapStep>,

    /// Timeout applied to each bootstrap command
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            command_timeout: Duration::from_secs(600),
        }
    }
}

/// Parameter server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub bind_addr: SocketAddr,

    /// Base64 master key for encryption at rest; plaintext storage when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,

    /// JSON snapshot persisted after every write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,

    /// Session grants accepted by the server
    pub grants: Vec<GrantConfig>,

    /// Request body limit in bytes
    pub max_body_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            master_key: None,
            snapshot_path: None,
            grants: Vec::new(),
            max_body_bytes: 16 * 1024,
        }
    }
}

/// A bearer token scoped to one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantConfig {
    pub token: String,
    pub session: String,
    pub role: crate::common::auth::AccessRole,
}

impl Config {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// An explicit path must exist; the default `joinrelay.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(required))
            .add_source(
                config::Environment::with_prefix("JOINRELAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot possibly work
    pub fn validate(&self) -> Result<()> {
        validate_segment("domain", &self.channel.domain)?;
        validate_segment("session id", &self.channel.session_id)?;

        if self.channel.placeholder.trim().is_empty() {
            return Err(Error::InvalidConfig("placeholder cannot be empty".into()));
        }

        for (name, poll) in [
            ("api_ready", &self.retry.api_ready),
            ("overlay_ready", &self.retry.overlay_ready),
            ("credential", &self.retry.credential),
        ] {
            if poll.max_attempts == 0 {
                return Err(Error::InvalidConfig(format!(
                    "retry.{}.max_attempts must be at least 1",
                    name
                )));
            }
        }

        if let Some(endpoint) = &self.cluster.control_plane_endpoint {
            crate::credential::parse_endpoint(endpoint).map_err(|_| {
                Error::InvalidConfig(format!(
                    "cluster.control_plane_endpoint is not <host>:<port>: {}",
                    endpoint
                ))
            })?;
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }

        for grant in &self.store.grants {
            validate_segment("grant session", &grant.session)?;
            if grant.token.len() < 16 {
                return Err(Error::InvalidConfig(format!(
                    "grant token for session {} is too short (min 16 chars)",
                    grant.session
                )));
            }
        }

        Ok(())
    }
}
