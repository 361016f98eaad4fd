//! Inactivity sweep and engine lifecycle.
//!
//! Users idle longer than `inactive_threshold` are dropped from memory and
//! their snapshots deleted. The sweep only touches bookkeeping; messages
//! already in the chat stay where they are.

use crate::cleaner::engine::{ChatCleaner, CleanerInner, SweepHandle};
use crate::cleaner::types::{ChatSnapshot, UserId};
use crate::persistence::Generation;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use tokio::time::{Instant, interval_at, timeout};
use tracing::{debug, error, info, warn};

/// Result of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub users_scanned: usize,
    pub users_evicted: usize,
    pub snapshots_purged: usize,
}

impl ChatCleaner {
    /// Starts the periodic sweep. Calling it again while running is a no-op.
    pub async fn start(&self) {
        let mut slot = self.inner.sweep.lock().await;
        if slot.is_some() {
            debug!("Chat cleaner already running");
            return;
        }

        let period = self.inner.config.cleanup_interval();
        let weak: Weak<CleanerInner> = Arc::downgrade(&self.inner);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            // First pass one full period after start
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            debug!("Chat cleaner dropped, stopping sweep");
                            break;
                        };
                        let cleaner = ChatCleaner { inner };
                        cleaner.sweep_inactive().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Inactivity sweep shutting down");
                        break;
                    }
                }
            }
        });

        *slot = Some(SweepHandle { task, shutdown_tx });
        info!(
            interval_secs = period.as_secs(),
            inactive_threshold_secs = self.inner.config.inactive_threshold_secs,
            "Chat cleaner started"
        );
    }

    pub async fn is_running(&self) -> bool {
        self.inner.sweep.lock().await.is_some()
    }

    pub async fn sweep_inactive(&self) -> SweepResult {
        self.sweep_inactive_at(Utc::now()).await
    }

    /// One sweep pass as if the clock read `now`.
    pub async fn sweep_inactive_at(&self, now: DateTime<Utc>) -> SweepResult {
        let threshold = self.inner.config.inactive_threshold();

        let (users_scanned, evicted) = {
            let mut guard = self.inner.registry.write().await;
            let scanned = guard.users.len();
            let idle: Vec<UserId> = guard
                .users
                .iter()
                .filter(|(_, state)| state.is_inactive(now, threshold))
                .map(|(user_id, _)| *user_id)
                .collect();
            let mut evicted: Vec<(UserId, Generation)> = Vec::with_capacity(idle.len());
            for user_id in idle {
                guard.users.remove(&user_id);
                guard.auth.remove(&user_id);
                evicted.push((user_id, self.inner.next_generation()));
            }
            (scanned, evicted)
        };

        // Deletes run without the registry lock. A user who came back
        // meanwhile saves with a newer generation, which wins.
        for (user_id, generation) in &evicted {
            debug!(user_id, "Dropping inactive user");
            self.inner.persistence.delete(*user_id, *generation).await;
        }
        let purged = self.inner.persistence.purge_expired().await;

        let result = SweepResult {
            users_scanned,
            users_evicted: evicted.len(),
            snapshots_purged: purged.deleted,
        };
        if result.users_evicted > 0 || result.snapshots_purged > 0 {
            info!(
                users_scanned = result.users_scanned,
                users_evicted = result.users_evicted,
                snapshots_purged = result.snapshots_purged,
                "Inactivity sweep completed"
            );
        } else {
            debug!(users_scanned = result.users_scanned, "Inactivity sweep found nothing to do");
        }
        result
    }

    /// Stops the sweep, aborts pending cascades and flushes every user's
    /// state to the store. Safe to call more than once.
    pub async fn shutdown(&self) {
        let handle = self.inner.sweep.lock().await.take();
        if let Some(SweepHandle {
            mut task,
            shutdown_tx,
        }) = handle
        {
            let _ = shutdown_tx.send(()).await;
            match timeout(self.inner.config.lock_timeout(), &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(error = %e, "Inactivity sweep task failed"),
                Err(_) => {
                    warn!("Inactivity sweep did not stop in time, aborting");
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        let cascades: Vec<_> = self.inner.cascades.lock().await.drain(..).collect();
        let pending = cascades.iter().filter(|h| !h.is_finished()).count();
        for cascade in cascades {
            cascade.abort();
        }
        if pending > 0 {
            debug!(pending, "Aborted pending cascade cleanups");
        }

        // Clone out under a brief read lock, write without it
        let snapshots: Vec<(UserId, Generation, ChatSnapshot)> = {
            let guard = self.inner.registry.read().await;
            guard
                .users
                .iter()
                .map(|(user_id, state)| (*user_id, self.inner.next_generation(), state.snapshot()))
                .collect()
        };
        for (user_id, generation, snapshot) in &snapshots {
            self.inner.persistence.save(*user_id, snapshot, *generation).await;
        }

        info!(users_flushed = snapshots.len(), "Chat cleaner stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::cleaner::ChatCleaner;
    use crate::cleaner::types::{MessageContext, MessageRef};
    use crate::config::CleanerConfig;
    use crate::persistence::{MemorySnapshotStore, PersistenceBridge, SnapshotStore};
    use crate::transport::{DeleteOutcome, TransportBridge};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    struct NullTransport;

    #[async_trait]
    impl TransportBridge for NullTransport {
        async fn delete_messages(&self, _: i64, ids: &[i32]) -> DeleteOutcome {
            DeleteOutcome::Deleted(ids.to_vec())
        }
    }

    fn setup() -> (ChatCleaner, Arc<MemorySnapshotStore>, Arc<dyn TransportBridge>) {
        let store = Arc::new(MemorySnapshotStore::new());
        let cleaner = ChatCleaner::new(
            CleanerConfig::default(),
            PersistenceBridge::new(store.clone(), Duration::from_secs(3600)),
        );
        (cleaner, store, Arc::new(NullTransport))
    }

    #[tokio::test]
    async fn test_sweep_drops_only_idle_users() {
        let (cleaner, store, transport) = setup();
        cleaner
            .track_message(&transport, 1, MessageRef::new(10, 1), MessageContext::Temp, None)
            .await;
        cleaner.set_auth_state(1, true).await;

        // Nobody is idle yet
        let result = cleaner.sweep_inactive().await;
        assert_eq!(result.users_evicted, 0);
        assert_eq!(cleaner.user_count().await, 1);

        let later = Utc::now() + ChronoDuration::hours(2);
        let result = cleaner.sweep_inactive_at(later).await;

        assert_eq!(result.users_scanned, 1);
        assert_eq!(result.users_evicted, 1);
        assert_eq!(cleaner.user_count().await, 0);
        assert!(!cleaner.is_in_auth(1).await);
        assert!(store.load(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_stops() {
        let (cleaner, _store, _transport) = setup();
        cleaner.start().await;
        cleaner.start().await;
        assert!(cleaner.is_running().await);

        cleaner.shutdown().await;
        assert!(!cleaner.is_running().await);
        // Second shutdown is harmless
        cleaner.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_state() {
        let (cleaner, store, transport) = setup();
        cleaner
            .track_message(&transport, 4, MessageRef::new(40, 7), MessageContext::Menu, None)
            .await;
        store.delete(4).await.unwrap();

        cleaner.shutdown().await;

        let snapshot = store.load(4).await.unwrap().unwrap();
        assert_eq!(snapshot.current_menu_id, Some(7));
        assert_eq!(snapshot.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_runs_on_interval() {
        let store = Arc::new(MemorySnapshotStore::new());
        let cleaner = ChatCleaner::new(
            CleanerConfig {
                cleanup_interval_secs: 10,
                inactive_threshold_secs: 0,
                ..CleanerConfig::default()
            },
            PersistenceBridge::new(store, Duration::from_secs(3600)),
        );
        let transport: Arc<dyn TransportBridge> = Arc::new(NullTransport);
        cleaner
            .track_message(&transport, 2, MessageRef::new(20, 1), MessageContext::Temp, None)
            .await;
        cleaner.start().await;

        // Wall-clock time must move past last_activity for a zero threshold
        std::thread::sleep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(cleaner.user_count().await, 0);
        cleaner.shutdown().await;
    }
}
