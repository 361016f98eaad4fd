//! Snapshot persistence for per-user cleanup state.
//!
//! Stores return `Result`; `PersistenceBridge` sits in front of them and
//! turns every failure into a logged no-op so the engine never sees one.

use crate::cleaner::types::{ChatSnapshot, UserId};
use crate::config::PersistenceConfig;
use crate::utils::error::{CleanerError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{Level, debug, error, info, warn};

pub mod file;
pub mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

/// Default snapshot lifetime (48 hours)
pub const DEFAULT_SNAPSHOT_TTL_SECS: u64 = 48 * 60 * 60;

/// Key-value store with per-entry expiry.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, user_id: UserId, snapshot: &ChatSnapshot, ttl: Duration) -> Result<()>;

    /// `Ok(None)` when nothing is stored or the entry has expired.
    async fn load(&self, user_id: UserId) -> Result<Option<ChatSnapshot>>;

    async fn delete(&self, user_id: UserId) -> Result<()>;

    /// Drops expired entries. Stores that expire natively can keep the default.
    async fn purge_expired(&self) -> Result<PurgeResult> {
        Ok(PurgeResult::default())
    }
}

/// Result of a purge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeResult {
    pub scanned: usize,
    pub deleted: usize,
    pub bytes_freed: u64,
}

/// Stamp taken under the engine's registry lock when a snapshot or delete
/// is decided. Strictly increasing across the whole engine.
pub type Generation = u64;

#[derive(Debug, Default)]
struct WriteSlot {
    applied: Generation,
    /// Purge epoch at which the last applied write was a delete
    tombstoned_at: Option<u64>,
}

/// Best-effort front for a snapshot store.
///
/// Writes for one user are serialized and stamped with a `Generation`;
/// a write older than the last one applied for that user is dropped, so a
/// slow save cannot overwrite a newer snapshot or resurrect a deleted one.
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Option<Arc<dyn SnapshotStore>>,
    ttl: Duration,
    slots: Arc<Mutex<HashMap<UserId, Arc<Mutex<WriteSlot>>>>>,
    purge_epoch: Arc<AtomicU64>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn SnapshotStore>, ttl: Duration) -> Self {
        Self {
            store: Some(store),
            ttl,
            slots: Arc::default(),
            purge_epoch: Arc::default(),
        }
    }

    /// Bridge with persistence turned off; every call is a no-op.
    pub fn disabled() -> Self {
        Self {
            store: None,
            ttl: Duration::from_secs(DEFAULT_SNAPSHOT_TTL_SECS),
            slots: Arc::default(),
            purge_epoch: Arc::default(),
        }
    }

    /// Builds the bridge the binary runs with: a file store under the
    /// configured directory, or a disabled bridge.
    pub async fn open(config: &PersistenceConfig) -> Result<Self> {
        if !config.enabled {
            info!("Snapshot persistence disabled");
            return Ok(Self::disabled());
        }
        config.validate()?;
        let dir = config
            .resolved_dir()
            .ok_or_else(|| CleanerError::config("Could not determine snapshot directory"))?;
        let store = FileSnapshotStore::new(dir);
        store.create_dir().await?;
        info!(dir = ?store.dir, ttl_secs = config.snapshot_ttl_secs, "Snapshot persistence enabled");
        Ok(Self::new(Arc::new(store), config.snapshot_ttl()))
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    async fn slot(&self, user_id: UserId) -> Arc<Mutex<WriteSlot>> {
        Arc::clone(self.slots.lock().await.entry(user_id).or_default())
    }

    pub async fn save(&self, user_id: UserId, snapshot: &ChatSnapshot, generation: Generation) {
        let Some(store) = &self.store else {
            return;
        };
        let slot = self.slot(user_id).await;
        let mut slot = slot.lock().await;
        if generation <= slot.applied {
            debug!(user_id, generation, applied = slot.applied, "Skipping stale snapshot");
            return;
        }
        slot.applied = generation;
        slot.tombstoned_at = None;

        match store.save(user_id, snapshot, self.ttl).await {
            Ok(()) => debug!(
                user_id,
                count = snapshot.messages.len(),
                "Saved tracked messages"
            ),
            Err(e) => log_failure("save", &e),
        }
    }

    /// Absent and failed loads both come back as `None`.
    pub async fn load(&self, user_id: UserId) -> Option<ChatSnapshot> {
        let store = self.store.as_ref()?;
        match store.load(user_id).await {
            Ok(Some(snapshot)) => {
                debug!(
                    user_id,
                    count = snapshot.messages.len(),
                    "Loaded tracked messages"
                );
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                log_failure("load", &e);
                None
            }
        }
    }

    pub async fn delete(&self, user_id: UserId, generation: Generation) {
        let Some(store) = &self.store else {
            return;
        };
        let slot = self.slot(user_id).await;
        let mut slot = slot.lock().await;
        if generation <= slot.applied {
            debug!(user_id, generation, applied = slot.applied, "Skipping stale delete");
            return;
        }
        slot.applied = generation;
        slot.tombstoned_at = Some(self.purge_epoch.load(Ordering::SeqCst));

        if let Err(e) = store.delete(user_id).await {
            log_failure("delete", &e);
        }
    }

    /// Purges expired snapshots, then forgets write slots of users deleted
    /// before the previous purge.
    pub async fn purge_expired(&self) -> PurgeResult {
        let Some(store) = &self.store else {
            return PurgeResult::default();
        };
        let result = match store.purge_expired().await {
            Ok(result) => result,
            Err(e) => {
                log_failure("purge", &e);
                PurgeResult::default()
            }
        };

        let epoch = self.purge_epoch.fetch_add(1, Ordering::SeqCst);
        let mut slots = self.slots.lock().await;
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(slot) => !slot.tombstoned_at.is_some_and(|at| at < epoch),
            Err(_) => true,
        });
        result
    }
}

fn log_failure(action: &'static str, e: &CleanerError) {
    if e.severity() == Level::ERROR {
        error!(action, error = %e, "Snapshot store failure");
    } else {
        warn!(action, error = %e, "Snapshot store failure");
    }
}
