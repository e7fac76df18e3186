//! In-process coordination channel

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{ChannelKey, CoordinationChannel};
use crate::common::{Error, Result};

/// Map-backed channel. Clones of an `Arc<MemoryChannel>` share state.
#[derive(Default)]
pub struct MemoryChannel {
    map: RwLock<HashMap<String, String>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reads served so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of writes applied so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationChannel for MemoryChannel {
    async fn read(&self, key: &ChannelKey) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let map = self
            .map
            .read()
            .map_err(|_| Error::Channel("memory channel lock poisoned".into()))?;
        Ok(map.get(&key.to_string()).cloned())
    }

    async fn write(&self, key: &ChannelKey, value: &str) -> Result<()> {
        let mut map = self
            .map
            .write()
            .map_err(|_| Error::Channel("memory channel lock poisoned".into()))?;
        map.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ChannelKey {
        ChannelKey::new("joinrelay", "s1").unwrap()
    }

    #[tokio::test]
    async fn test_missing_key() {
        let channel = MemoryChannel::new();
        assert_eq!(channel.read(&key()).await.unwrap(), None);
        assert_eq!(channel.reads(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_read() {
        let channel = MemoryChannel::new();
        channel.write(&key(), "join --token a.b --discovery-token-ca-cert-hash sha256:1").await.unwrap();
        let first = channel.read(&key()).await.unwrap();
        for _ in 0..10 {
            assert_eq!(channel.read(&key()).await.unwrap(), first);
        }
        assert_eq!(channel.writes(), 1);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let channel = MemoryChannel::new();
        channel.write(&key(), "A").await.unwrap();
        channel.write(&key(), "B").await.unwrap();
        assert_eq!(channel.read(&key()).await.unwrap().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let channel = MemoryChannel::new();
        let other = ChannelKey::new("joinrelay", "s2").unwrap();
        channel.write(&key(), "A").await.unwrap();
        assert_eq!(channel.read(&other).await.unwrap(), None);
    }
}
