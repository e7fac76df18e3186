//! Parameter server

use std::sync::Arc;
use tokio::net::TcpListener;

use crate::common::config::StoreConfig;
use crate::common::{AccessPolicy, ParamCipher, Result};
use crate::store::http::{create_router, StoreState};
use crate::store::params::ParameterStore;

pub struct StoreServer {
    config: StoreConfig,
}

impl StoreServer {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Build shared state from config
    pub fn state(&self) -> Result<StoreState> {
        let cipher = ParamCipher::from_config(self.config.master_key.as_deref())?;
        let params = match &self.config.snapshot_path {
            Some(path) => ParameterStore::open(cipher, path)?,
            None => ParameterStore::new(cipher),
        };
        Ok(StoreState {
            params: Arc::new(params),
            policy: Arc::new(AccessPolicy::from_grants(&self.config.grants)),
        })
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let state = self.state()?;

        tracing::info!("Starting parameter store");
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  Encryption at rest: {}", state.params.is_encrypted());
        tracing::info!(
            "  Snapshot: {}",
            self.config
                .snapshot_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none (memory only)".to_string())
        );
        if state.policy.is_open() {
            tracing::warn!("No session grants configured, API is open to any client");
        }

        let router = create_router(state, self.config.max_body_bytes);

        tracing::info!("✓ Parameter store ready");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Parameter store stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
