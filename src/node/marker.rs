//! Bootstrap completion marker
//!
//! A small JSON record written once, at the end of a successful run, so
//! supervisors can tell a finished node from one that is still converging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::common::{Error, NodeRole, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapMarker {
    pub role: NodeRole,
    pub node_id: String,
    pub completed_at: DateTime<Utc>,
    /// Last phase the role reached
    pub phase: String,
}

impl BootstrapMarker {
    pub fn new(role: NodeRole, node_id: &str, phase: impl Into<String>) -> Self {
        Self {
            role,
            node_id: node_id.to_string(),
            completed_at: Utc::now(),
            phase: phase.into(),
        }
    }

    /// Create the marker; fails if one already exists.
    ///
    /// The record is fully written and synced to a temp file first, then
    /// linked into place, so `path` either holds a complete marker or nothing.
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        let mut body = serde_json::to_vec_pretty(self)?;
        body.push(b'\n');

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::Marker(format!("cannot create {}: {}", tmp.display(), e)))?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        let linked = tokio::fs::hard_link(&tmp, path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        linked.map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                Error::Marker(format!("{} already exists", path.display()))
            }
            _ => Error::Marker(format!("cannot create {}: {}", path.display(), e)),
        })
    }

    /// `None` when no run has completed yet
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Marker(format!("{} is malformed: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
