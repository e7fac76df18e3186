//! # joinrelay
//!
//! Join coordination for bootstrapping a cluster through a shared
//! key-value parameter store:
//! - One initializer brings up the control plane and publishes a join credential
//! - Any number of joiners poll the same key with bounded retries
//! - Credentials are grammar-checked once and passed to the join action as
//!   typed arguments, never re-interpreted as a shell command
//! - A self-hosted parameter server (encrypted at rest, per-session tokens)
//!   or a cloud parameter store can act as the rendezvous point
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────┐   write    ┌────────────────────────────┐
//!   │   Initializer    │───────────▶│  /<domain>/<session>/      │
//!   │  kubeadm init    │            │      join-command          │
//!   │  token create    │            │  (PLACEHOLDER → credential)│
//!   └──────────────────┘            └──────────────┬─────────────┘
//!                                          read    │ (poll N × interval)
//!                          ┌───────────────────────┼──────────────────┐
//!                        ┌─▼────────┐        ┌─────▼────┐       ┌─────▼────┐
//!                        │ Joiner 1 │        │ Joiner 2 │       │ Joiner 3 │
//!                        │ kubeadm  │        │ kubeadm  │       │ kubeadm  │
//!                        │   join   │        │   join   │       │   join   │
//!                        └──────────┘        └──────────┘       └──────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a parameter server
//! ```bash
//! joinrelay-store --config store.toml
//! ```
//!
//! ### Seed the placeholder, then start the nodes
//! ```bash
//! joinrelay placeholder --session prod
//! joinrelay-init --config joinrelay.toml --session prod
//! joinrelay-join --config joinrelay.toml --session prod
//! ```
//!
//! ### Inspect
//! ```bash
//! joinrelay get --session prod
//! joinrelay validate "join 10.0.1.15:6443 --token ... --discovery-token-ca-cert-hash sha256:..."
//! joinrelay status
//! ```

#![allow(clippy::result_large_err)]

pub mod channel;
pub mod common;
pub mod credential;
pub mod node;
pub mod store;

// Re-export commonly used types
pub use channel::{ChannelKey, CoordinationChannel, SENTINEL_PLACEHOLDER};
pub use common::{Config, Error, Result};
pub use credential::{is_valid_credential, JoinCredential};
pub use node::{Initializer, Joiner};
pub use store::StoreServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
