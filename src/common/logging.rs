//! Structured phase logging
//!
//! A [`PhaseLog`] is created once per node run and handed to every phase.
//! Each event carries `node`, `role`, `phase` and `status` fields so an
//! operator tailing the stream can follow progress without parsing text.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::common::config::{LogFormat, NodeRole};

/// Phases of a node run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrap,
    Metadata,
    ControlPlane,
    ApiReady,
    Overlay,
    Publish,
    AwaitCredential,
    Join,
    Verify,
    Marker,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Bootstrap => "bootstrap",
            Phase::Metadata => "metadata",
            Phase::ControlPlane => "control-plane",
            Phase::ApiReady => "api-ready",
            Phase::Overlay => "overlay",
            Phase::Publish => "publish",
            Phase::AwaitCredential => "await-credential",
            Phase::Join => "join",
            Phase::Verify => "verify",
            Phase::Marker => "marker",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging context for one node run
#[derive(Debug, Clone)]
pub struct PhaseLog {
    node_id: String,
    role: NodeRole,
}

impl PhaseLog {
    pub fn new(node_id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            node_id: node_id.into(),
            role,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn info(&self, phase: Phase, message: &str) {
        tracing::info!(
            node = %self.node_id,
            role = %self.role,
            phase = %phase,
            status = "info",
            "{}",
            message
        );
    }

    pub fn success(&self, phase: Phase, message: &str) {
        tracing::info!(
            node = %self.node_id,
            role = %self.role,
            phase = %phase,
            status = "success",
            "{}",
            message
        );
    }

    /// Non-fatal problem; execution continues
    pub fn warn(&self, phase: Phase, message: &str) {
        tracing::warn!(
            node = %self.node_id,
            role = %self.role,
            phase = %phase,
            status = "warning",
            "{}",
            message
        );
    }

    pub fn error(&self, phase: Phase, message: &str) {
        tracing::error!(
            node = %self.node_id,
            role = %self.role,
            phase = %phase,
            status = "error",
            "{}",
            message
        );
    }

    /// Span covering a whole node run
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("node_run", node = %self.node_id, role = %self.role)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
}
