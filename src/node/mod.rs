//! Node runtime: the two roles and the host tools they drive

pub mod bootstrap;
pub mod exec;
pub mod initializer;
pub mod joiner;
pub mod kubeadm;
pub mod kubectl;
pub mod marker;
pub mod metadata;
pub mod systemd;

pub use exec::{CommandOutput, CommandRunner, CommandSpec, TokioRunner};
pub use initializer::{InitPhase, Initializer};
pub use joiner::{JoinPhase, Joiner, Membership};
pub use marker::BootstrapMarker;
