//! Parameter storage with encryption at rest
//!
//! Values are sealed before they enter the map and opened on the way out, so
//! neither memory snapshots nor the JSON snapshot file hold plaintext when a
//! master key is configured. Each key carries a version that increments on
//! every write.

use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::common::{Error, ParamCipher, Result};

/// A stored parameter (value still sealed)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredParam {
    /// Sealed value, base64 in snapshots
    #[serde(with = "b64")]
    pub sealed: Vec<u8>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// A decrypted parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key: String,
    pub value: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

pub struct ParameterStore {
    entries: RwLock<HashMap<String, StoredParam>>,
    cipher: ParamCipher,
    snapshot: Option<PathBuf>,
}

impl ParameterStore {
    /// In-memory store
    pub fn new(cipher: ParamCipher) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cipher,
            snapshot: None,
        }
    }

    /// Store persisted to a JSON snapshot, loaded now if it exists
    pub fn open(cipher: ParamCipher, snapshot: impl AsRef<Path>) -> Result<Self> {
        let snapshot = snapshot.as_ref().to_path_buf();
        let entries = match std::fs::read(&snapshot) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %snapshot.display(),
            params = entries.len(),
            encrypted = cipher.is_enabled(),
            "Parameter store opened"
        );

        Ok(Self {
            entries: RwLock::new(entries),
            cipher,
            snapshot: Some(snapshot),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_enabled()
    }

    pub fn get(&self, key: &str) -> Result<Option<Parameter>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Internal("parameter store lock poisoned".into()))?;

        let Some(stored) = entries.get(key) else {
            return Ok(None);
        };

        let plaintext = self.cipher.open(key, &stored.sealed)?;
        let value = String::from_utf8(plaintext)
            .map_err(|_| Error::Internal(format!("parameter {} is not UTF-8", key)))?;

        Ok(Some(Parameter {
            key: key.to_string(),
            value,
            version: stored.version,
            updated_at: stored.updated_at,
        }))
    }

    /// Overwrite `key`, returning the new version.
    ///
    /// When the snapshot cannot be written the previous entry is restored.
    pub fn put(&self, key: &str, value: &str) -> Result<u64> {
        let sealed = self.cipher.seal(key, value.as_bytes())?;

        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::Internal("parameter store lock poisoned".into()))?;

        let version = entries.get(key).map(|p| p.version + 1).unwrap_or(1);
        let previous = entries.insert(
            key.to_string(),
            StoredParam {
                sealed,
                version,
                updated_at: Utc::now(),
            },
        );

        if let Some(path) = &self.snapshot {
            if let Err(e) = write_snapshot(path, &entries) {
                match previous {
                    Some(prev) => entries.insert(key.to_string(), prev),
                    None => entries.remove(key),
                };
                tracing::error!(key, path = %path.display(), "Snapshot write failed: {}", e);
                return Err(e);
            }
        }

        Ok(version)
    }

    /// Raw sealed bytes, for inspection
    pub fn sealed(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).map(|p| p.sealed.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write to a temp file next to the target, then rename over it
fn write_snapshot(path: &Path, entries: &HashMap<String, StoredParam>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let written = std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)
        .and_then(|_| std::fs::rename(&tmp, path));
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    Ok(written?)
}

mod b64 {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        BASE64.decode(raw).map_err(serde::de::Error::custom)
    }
}
