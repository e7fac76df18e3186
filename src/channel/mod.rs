//! Coordination channel: the shared store joiners and the initializer meet at
//!
//! One key per session, `/<domain>/<session-id>/join-command`, holding either
//! the sentinel placeholder or a join credential. Readers never mutate the
//! entry; writes overwrite it (last write wins).

pub mod http;
pub mod memory;
pub mod ssm;

pub use http::HttpChannel;
pub use memory::MemoryChannel;
pub use ssm::SsmChannel;

use async_trait::async_trait;
use std::sync::Arc;

use crate::common::utils::validate_segment;
use crate::common::{ChannelBackend, ChannelConfig, Result};
use crate::node::exec::CommandRunner;

/// Value meaning "no credential published yet"
pub const SENTINEL_PLACEHOLDER: &str = "PLACEHOLDER";

/// Last key segment
pub const JOIN_COMMAND_SEGMENT: &str = "join-command";

/// Shared key-value store used as the rendezvous point
#[async_trait]
pub trait CoordinationChannel: Send + Sync {
    /// Current value, `None` if the key has never been written
    async fn read(&self, key: &ChannelKey) -> Result<Option<String>>;

    /// Overwrite the value
    async fn write(&self, key: &ChannelKey, value: &str) -> Result<()>;

    /// Backend name for logs
    fn describe(&self) -> String;
}

/// Namespaced key `/<domain>/<session-id>/join-command`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    domain: String,
    session_id: String,
}

impl ChannelKey {
    pub fn new(domain: &str, session_id: &str) -> Result<Self> {
        validate_segment("domain", domain)?;
        validate_segment("session id", session_id)?;
        Ok(Self {
            domain: domain.to_string(),
            session_id: session_id.to_string(),
        })
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        Self::new(&config.domain, &config.session_id)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Path segments, without separators
    pub fn segments(&self) -> [&str; 3] {
        [&self.domain, &self.session_id, JOIN_COMMAND_SEGMENT]
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}/{}", self.domain, self.session_id, JOIN_COMMAND_SEGMENT)
    }
}

/// Write the placeholder so readers see "not yet published" instead of a miss
pub async fn seed_placeholder(
    channel: &dyn CoordinationChannel,
    key: &ChannelKey,
    placeholder: &str,
) -> Result<()> {
    channel.write(key, placeholder).await?;
    tracing::info!(key = %key, backend = %channel.describe(), "Placeholder seeded");
    Ok(())
}

/// Build the configured backend
pub fn build_channel(
    config: &ChannelConfig,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn CoordinationChannel>> {
    let channel: Arc<dyn CoordinationChannel> = match config.backend {
        ChannelBackend::Memory => Arc::new(MemoryChannel::new()),
        ChannelBackend::Http => Arc::new(HttpChannel::new(
            &config.endpoint,
            config.token.clone(),
            config.request_timeout,
        )?),
        ChannelBackend::Ssm => Arc::new(SsmChannel::new(
            runner,
            config.region.clone(),
            config.kms_key_id.clone(),
            config.request_timeout,
        )),
    };
    Ok(channel)
}
