//! Self-hosted parameter store
//!
//! An HTTP rendezvous point with the same contract as a cloud parameter
//! store: namespaced keys, overwrite semantics, encryption at rest, and
//! per-session reader/writer tokens.

pub mod api;
pub mod http;
pub mod params;
pub mod server;

pub use params::{Parameter, ParameterStore};
pub use server::StoreServer;
