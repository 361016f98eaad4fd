use crate::cleaner::types::{ChatSnapshot, UserId};
use crate::persistence::{PurgeResult, SnapshotStore};
use crate::utils::error::{CleanerError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// In-process snapshot store with TTL. Nothing survives a restart.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<UserId, (Instant, ChatSnapshot)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, user_id: UserId, snapshot: &ChatSnapshot, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now().checked_add(ttl).ok_or_else(|| {
            CleanerError::persistence(user_id, format!("snapshot ttl out of range: {ttl:?}"))
        })?;
        self.entries
            .write()
            .await
            .insert(user_id, (expires_at, snapshot.clone()));
        Ok(())
    }

    async fn load(&self, user_id: UserId) -> Result<Option<ChatSnapshot>> {
        let guard = self.entries.read().await;
        Ok(guard
            .get(&user_id)
            .filter(|(expires_at, _)| *expires_at > Instant::now())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        self.entries.write().await.remove(&user_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<PurgeResult> {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        let scanned = guard.len();
        guard.retain(|_, (expires_at, _)| *expires_at > now);
        Ok(PurgeResult {
            scanned,
            deleted: scanned - guard.len(),
            bytes_freed: 0,
        })
    }
}
