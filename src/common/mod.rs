//! Common utilities and types shared across joinrelay

pub mod auth;
pub mod config;
pub mod encryption;
pub mod error;
pub mod logging;
pub mod retry;
pub mod utils;

pub use auth::{Access, AccessPolicy, AccessRole, AuthContext};
pub use config::{ChannelBackend, ChannelConfig, ClusterConfig, Config, NodeRole, RetrySettings};
pub use encryption::ParamCipher;
pub use error::{Error, ErrorKind, Result};
pub use logging::{init_tracing, Phase, PhaseLog};
pub use retry::{retry_until, Attempt, RetryPolicy};
pub use utils::{format_duration, parse_duration};
