use crate::cleaner::types::{ChatSnapshot, UserId};
use crate::persistence::{PurgeResult, SnapshotStore};
use crate::utils::error::{CleanerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info};

const FILE_PREFIX: &str = "chatcleaner_";

/// What actually lands on disk: the snapshot plus its expiry.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    user_id: UserId,
    expires_at: DateTime<Utc>,
    snapshot: ChatSnapshot,
}

impl Envelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One JSON file per user under `dir`, readable by the owner only.
pub struct FileSnapshotStore {
    pub dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn file_path(&self, user_id: UserId) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{user_id}.json"))
    }

    pub async fn create_dir(&self) -> Result<()> {
        if fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CleanerError::io(&self.dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o755);
            fs::set_permissions(&self.dir, permissions)
                .await
                .map_err(|e| CleanerError::io(&self.dir, e))?;
        }

        info!("Created snapshot directory: {:?}", self.dir);
        Ok(())
    }

    async fn read_envelope(&self, path: &Path) -> Result<Option<Envelope>> {
        let json = match fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CleanerError::io(path, e)),
        };
        match serde_json::from_str::<Envelope>(&json) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                error!("Failed to parse snapshot {:?}: {}", path, e);
                self.quarantine(path).await?;
                Ok(None)
            }
        }
    }

    /// Moves an unreadable file aside so the next save starts clean.
    async fn quarantine(&self, path: &Path) -> Result<()> {
        let corrupted_path = path.with_extension("json.corrupted");
        fs::rename(path, &corrupted_path)
            .await
            .map_err(|e| CleanerError::io(path, e))?;
        error!(
            "Corrupted snapshot detected. Moved {:?} to {:?}",
            path, corrupted_path
        );
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CleanerError::io(path, e)),
        }
    }

    async fn file_size(path: &Path) -> u64 {
        match fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                debug!("Failed to get file size for {:?}: {}", path, e);
                0
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, user_id: UserId, snapshot: &ChatSnapshot, ttl: Duration) -> Result<()> {
        self.create_dir().await?;

        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| {
                CleanerError::persistence(user_id, format!("snapshot ttl out of range: {ttl:?}"))
            })?;
        let envelope = Envelope {
            user_id,
            expires_at,
            snapshot: snapshot.clone(),
        };
        let json = serde_json::to_string(&envelope)?;

        let file_path = self.file_path(user_id);
        fs::write(&file_path, json)
            .await
            .map_err(|e| CleanerError::io(&file_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&file_path, permissions)
                .await
                .map_err(|e| CleanerError::io(&file_path, e))?;
        }

        debug!(user_id, path = ?file_path, "Wrote snapshot");
        Ok(())
    }

    async fn load(&self, user_id: UserId) -> Result<Option<ChatSnapshot>> {
        let file_path = self.file_path(user_id);
        let Some(envelope) = self.read_envelope(&file_path).await? else {
            return Ok(None);
        };
        if envelope.is_expired(Utc::now()) {
            debug!(user_id, "Snapshot expired, removing");
            self.remove(&file_path).await?;
            return Ok(None);
        }
        Ok(Some(envelope.snapshot))
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        self.remove(&self.file_path(user_id)).await
    }

    async fn purge_expired(&self) -> Result<PurgeResult> {
        let mut result = PurgeResult::default();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(CleanerError::io(&self.dir, e)),
        };

        let now = Utc::now();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CleanerError::io(&self.dir, e))?
        {
            let path = entry.path();

            // Only .json files, .corrupted ones are left for inspection
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            result.scanned += 1;

            let envelope = match self.read_envelope(&path).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to read snapshot {:?}: {}", path, e);
                    continue;
                }
            };
            if !envelope.is_expired(now) {
                continue;
            }

            let size = Self::file_size(&path).await;
            match self.remove(&path).await {
                Ok(()) => {
                    result.deleted += 1;
                    result.bytes_freed += size;
                    debug!(user_id = envelope.user_id, "Purged expired snapshot");
                }
                Err(e) => error!("Failed to purge snapshot {:?}: {}", path, e),
            }
        }

        if result.deleted > 0 {
            info!(
                scanned = result.scanned,
                deleted = result.deleted,
                bytes_freed = result.bytes_freed,
                "Purged expired snapshots"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::types::{MessageContext, MessageRef, MessageTracker};
    use tempfile::TempDir;

    fn sample_snapshot() -> ChatSnapshot {
        ChatSnapshot {
            messages: vec![
                MessageTracker::new(MessageRef::new(100, 1), MessageContext::Menu),
                MessageTracker::new(MessageRef::new(100, 2), MessageContext::Temp),
            ],
            current_menu_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_save_creates_dir_and_loads_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().join("snapshots"));

        store
            .save(42, &sample_snapshot(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.file_path(42).exists());
        let loaded = store.load(42).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.current_menu_id, Some(1));
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().to_path_buf());

        let result = store
            .save(4, &sample_snapshot(), Duration::from_secs(10_000_000_000_000))
            .await;

        assert!(matches!(result, Err(CleanerError::Persistence { user_id: 4, .. })));
        assert!(!store.file_path(4).exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().to_path_buf());
        assert!(store.load(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_absent_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().to_path_buf());

        store
            .save(5, &sample_snapshot(), Duration::ZERO)
            .await
            .unwrap();

        assert!(store.load(5).await.unwrap().is_none());
        assert!(!store.file_path(5).exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_quarantined() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().to_path_buf());

        let file_path = store.file_path(9);
        fs::write(&file_path, "invalid json {{").await.unwrap();

        assert!(store.load(9).await.unwrap().is_none());
        assert!(temp_dir.path().join("chatcleaner_9.json.corrupted").exists());
        assert!(!file_path.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().to_path_buf());
        store.delete(1).await.unwrap();

        store
            .save(1, &sample_snapshot(), Duration::from_secs(60))
            .await
            .unwrap();
        store.delete(1).await.unwrap();
        assert!(!store.file_path(1).exists());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().to_path_buf());

        store
            .save(1, &sample_snapshot(), Duration::ZERO)
            .await
            .unwrap();
        store
            .save(2, &sample_snapshot(), Duration::from_secs(3600))
            .await
            .unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored")
            .await
            .unwrap();

        let result = store.purge_expired().await.unwrap();

        assert_eq!(result.scanned, 2);
        assert_eq!(result.deleted, 1);
        assert!(result.bytes_freed > 0);
        assert!(!store.file_path(1).exists());
        assert!(store.file_path(2).exists());
    }

    #[tokio::test]
    async fn test_purge_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp_dir.path().join("never-created"));
        assert_eq!(store.purge_expired().await.unwrap(), PurgeResult::default());
    }

    #[tokio::test]
    async fn test_file_permissions_unix() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let temp_dir = TempDir::new().unwrap();
            let store = FileSnapshotStore::new(temp_dir.path().to_path_buf());
            store
                .save(3, &sample_snapshot(), Duration::from_secs(60))
                .await
                .unwrap();

            let metadata = fs::metadata(store.file_path(3)).await.unwrap();
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        }
    }
}
