//! Message-lifecycle engine.
//!
//! Tracks which messages belong to which context for every user, decides
//! what may be deleted on each trigger and deletes it through a
//! `TransportBridge`. Bookkeeping is mirrored to a `PersistenceBridge`
//! after every change.
//!
//! Locking: `registry` guards the map of per-user states and is only held
//! for in-memory work, never across transport or store calls. Each user's
//! cleanup lock is held for a whole cleanup pass, transport calls included,
//! so two passes for the same user never overlap.
//!
//! Every snapshot or delete handed to the store is stamped with a
//! generation taken while `registry` is held, so the store applies them in
//! the order the in-memory changes happened.

use crate::cleaner::types::{
    ChatId, ChatSnapshot, MessageContext, MessageId, MessageRef, MessageTracker, UserChatState,
    UserId,
};
use crate::config::CleanerConfig;
use crate::persistence::{Generation, PersistenceBridge};
use crate::transport::{DeleteOutcome, TransportBridge};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub(super) struct Registry {
    pub(super) users: HashMap<UserId, UserChatState>,
    pub(super) auth: HashSet<UserId>,
}

pub(super) struct SweepHandle {
    pub(super) task: JoinHandle<()>,
    pub(super) shutdown_tx: tokio::sync::mpsc::Sender<()>,
}

pub(super) struct CleanerInner {
    pub(super) config: CleanerConfig,
    pub(super) persistence: PersistenceBridge,
    pub(super) registry: RwLock<Registry>,
    pub(super) sweep: Mutex<Option<SweepHandle>>,
    pub(super) cascades: Mutex<Vec<AbortHandle>>,
    generation: AtomicU64,
}

impl CleanerInner {
    /// Must be called with `registry` held.
    pub(super) fn next_generation(&self) -> Generation {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// What a cleanup call should sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanRequest {
    pub context_filter: Option<HashSet<MessageContext>>,
    pub message_ids: Option<HashSet<MessageId>>,
    pub exclude_current_menu: bool,
}

impl Default for CleanRequest {
    fn default() -> Self {
        Self {
            context_filter: None,
            message_ids: None,
            exclude_current_menu: true,
        }
    }
}

impl CleanRequest {
    pub fn contexts(contexts: impl IntoIterator<Item = MessageContext>) -> Self {
        Self {
            context_filter: Some(contexts.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn ids(ids: impl IntoIterator<Item = MessageId>) -> Self {
        Self {
            message_ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = MessageId>) -> Self {
        self.message_ids
            .get_or_insert_with(HashSet::new)
            .extend(ids);
        self
    }

    /// Allows the current menu into the deletion set.
    pub fn include_current_menu(mut self) -> Self {
        self.exclude_current_menu = false;
        self
    }
}

/// Outcome of one `clean_messages` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Size of the deletion set
    pub requested: usize,
    /// Ids the transport confirmed deleted
    pub deleted: usize,
    /// Ids dropped from tracking because the platform refused or lost them
    pub dropped: usize,
    /// Ids left tracked after a rate limit or transport error
    pub deferred: usize,
    /// Another cleanup held the user's lock for the whole wait
    pub skipped: bool,
}

/// Process-wide cleanup engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatCleaner {
    pub(super) inner: Arc<CleanerInner>,
}

impl ChatCleaner {
    pub fn new(config: CleanerConfig, persistence: PersistenceBridge) -> Self {
        Self {
            inner: Arc::new(CleanerInner {
                config,
                persistence,
                registry: RwLock::new(Registry::default()),
                sweep: Mutex::new(None),
                cascades: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.inner.config
    }

    /// Makes sure the user's state is in memory, restoring it from the
    /// store the first time the user is seen.
    async fn ensure_loaded(&self, user_id: UserId) {
        if self.inner.registry.read().await.users.contains_key(&user_id) {
            return;
        }

        // Store I/O happens without the registry lock
        let restored = self.inner.persistence.load(user_id).await;

        let mut guard = self.inner.registry.write().await;
        guard.users.entry(user_id).or_insert_with(|| match restored {
            Some(snapshot) => {
                info!(
                    user_id,
                    count = snapshot.messages.len(),
                    "Restored tracked messages"
                );
                UserChatState::from_snapshot(snapshot)
            }
            None => UserChatState::new(),
        });
    }

    async fn persist(&self, user_id: UserId, snapshot: Option<(Generation, ChatSnapshot)>) {
        if let Some((generation, snapshot)) = snapshot {
            self.inner.persistence.save(user_id, &snapshot, generation).await;
        }
    }

    /// Records a message the bot sent or received.
    ///
    /// Re-tracking an id replaces its tracker. A new MENU schedules removal
    /// of the previous menu; a COMMAND schedules its own removal after
    /// `command_delete_delay`. Never fails: cascades run detached and
    /// persistence is best-effort.
    pub async fn track_message(
        &self,
        transport: &Arc<dyn TransportBridge>,
        user_id: UserId,
        message: MessageRef,
        context: MessageContext,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) {
        self.ensure_loaded(user_id).await;

        let tracker = MessageTracker::new(message, context).with_metadata(metadata.unwrap_or_default());
        let cap = self.inner.config.max_tracked_messages;

        let (previous_menu, evicted, snapshot) = {
            let mut guard = self.inner.registry.write().await;
            // The sweep may have dropped the user since ensure_loaded
            let state = guard.users.entry(user_id).or_default();
            state.insert(tracker);
            let previous_menu = match context {
                MessageContext::Menu => state.replace_menu(message.message_id),
                _ => None,
            };
            let evicted = state.evict_oldest(cap);
            let snapshot = state.snapshot();
            (previous_menu, evicted, (self.inner.next_generation(), snapshot))
        };

        debug!(
            user_id,
            chat_id = message.chat_id,
            message_id = message.message_id,
            context = %context,
            "Tracked message"
        );
        if !evicted.is_empty() {
            debug!(user_id, evicted = evicted.len(), cap, "Evicted oldest trackers");
        }

        match context {
            MessageContext::Menu => {
                if let Some(previous) = previous_menu.filter(|id| *id != message.message_id) {
                    debug!(user_id, previous, "Scheduling cleanup of superseded menu");
                    let cleaner = self.clone();
                    let transport = Arc::clone(transport);
                    self.spawn_cascade("menu_supersede", async move {
                        cleaner
                            .clean_messages(
                                transport.as_ref(),
                                user_id,
                                message.chat_id,
                                CleanRequest::contexts([MessageContext::Menu]),
                            )
                            .await;
                    })
                    .await;
                }
            }
            MessageContext::Command => {
                let delay = self.inner.config.command_delete_delay();
                let cleaner = self.clone();
                let transport = Arc::clone(transport);
                self.spawn_cascade("command_cleanup", async move {
                    sleep(delay).await;
                    cleaner
                        .clean_messages(
                            transport.as_ref(),
                            user_id,
                            message.chat_id,
                            CleanRequest::ids([message.message_id]),
                        )
                        .await;
                })
                .await;
            }
            _ => {}
        }

        self.persist(user_id, Some(snapshot)).await;
    }

    /// Runs `fut` detached. Panics are logged, and the task is aborted if
    /// still pending at shutdown.
    async fn spawn_cascade<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(fut);
        let abort = task.abort_handle();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(task = label, "Cascade cleanup task panicked");
                }
            }
        });

        let mut tasks = self.inner.cascades.lock().await;
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(abort);
    }

    /// Deletes the messages selected by `request` from `chat_id`.
    ///
    /// Deletion set = explicit ids plus tracked messages whose context is
    /// in the filter, minus the current menu unless asked otherwise. Empty
    /// set returns at once. Otherwise the user's cleanup lock is taken with
    /// a bounded wait; on timeout nothing is deleted. Never fails.
    pub async fn clean_messages(
        &self,
        transport: &dyn TransportBridge,
        user_id: UserId,
        chat_id: ChatId,
        request: CleanRequest,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.ensure_loaded(user_id).await;

        let Some((initial, lock)) = self.deletion_set(user_id, &request).await else {
            return report;
        };
        if initial.is_empty() {
            return report;
        }

        let lock_timeout = self.inner.config.lock_timeout();
        let _guard = match timeout(lock_timeout, lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    user_id,
                    timeout_ms = lock_timeout.as_millis() as u64,
                    "Cleanup lock timeout, skipping this pass"
                );
                report.skipped = true;
                return report;
            }
        };

        // Recompute: a concurrent pass or a new menu may have changed things
        let Some((to_delete, _)) = self.deletion_set(user_id, &request).await else {
            return report;
        };
        if to_delete.is_empty() {
            return report;
        }
        report.requested = to_delete.len();

        if self.inner.config.dry_run {
            info!(
                user_id,
                chat_id,
                ids = ?to_delete,
                "Dry run: would delete messages"
            );
            return report;
        }

        let ids: Vec<MessageId> = to_delete.into_iter().collect();
        for batch in ids.chunks(self.inner.config.deletion_batch_size) {
            let outcome = transport.delete_messages(chat_id, batch).await;
            debug!(user_id, chat_id, size = batch.len(), outcome = outcome.label(), "Delete batch finished");
            match outcome {
                DeleteOutcome::Deleted(deleted) => {
                    report.deleted += deleted.len();
                    self.forget(user_id, &deleted).await;
                }
                DeleteOutcome::Forbidden(ids) => {
                    warn!(user_id, chat_id, count = ids.len(), "Delete forbidden, dropping trackers");
                    report.dropped += ids.len();
                    self.forget(user_id, &ids).await;
                }
                DeleteOutcome::InvalidId(ids) => {
                    warn!(user_id, chat_id, count = ids.len(), "Messages already gone, dropping trackers");
                    report.dropped += ids.len();
                    self.forget(user_id, &ids).await;
                }
                DeleteOutcome::RateLimited(wait) => {
                    warn!(
                        user_id,
                        chat_id,
                        wait_secs = wait.as_secs(),
                        "Rate limited while deleting messages"
                    );
                    report.deferred += batch.len();
                    sleep(wait).await;
                }
                DeleteOutcome::TransportError(detail) => {
                    error!(user_id, chat_id, error = %detail, "Error deleting message batch");
                    report.deferred += batch.len();
                }
            }
        }

        debug!(
            user_id,
            chat_id,
            requested = report.requested,
            deleted = report.deleted,
            dropped = report.dropped,
            deferred = report.deferred,
            "Cleanup pass complete"
        );
        report
    }

    async fn deletion_set(
        &self,
        user_id: UserId,
        request: &CleanRequest,
    ) -> Option<(std::collections::BTreeSet<MessageId>, Arc<Mutex<()>>)> {
        let guard = self.inner.registry.read().await;
        let state = guard.users.get(&user_id)?;
        let set = state.deletion_set(
            request.context_filter.as_ref(),
            request.message_ids.as_ref(),
            request.exclude_current_menu,
        );
        Some((set, state.cleanup_lock()))
    }

    async fn forget(&self, user_id: UserId, ids: &[MessageId]) {
        let snapshot = {
            let mut guard = self.inner.registry.write().await;
            let snapshot = guard.users.get_mut(&user_id).map(|state| {
                state.forget(ids);
                state.snapshot()
            });
            snapshot.map(|snapshot| (self.inner.next_generation(), snapshot))
        };
        self.persist(user_id, snapshot).await;
    }

    /// Cleans the navigation contexts, renders, then tracks the result as
    /// the new menu. Render errors propagate; cleanup never blocks them.
    pub async fn render_menu<F, Fut, E>(
        &self,
        transport: &Arc<dyn TransportBridge>,
        user_id: UserId,
        chat_id: ChatId,
        render: F,
    ) -> Result<MessageRef, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MessageRef, E>>,
    {
        self.clean_messages(
            transport.as_ref(),
            user_id,
            chat_id,
            CleanRequest::contexts(MessageContext::navigation()),
        )
        .await;

        let message = render().await?;
        self.track_message(transport, user_id, message, MessageContext::Menu, None)
            .await;
        Ok(message)
    }

    /// Forgets everything about a user (logout). No transport calls.
    pub async fn clear_user_data(&self, user_id: UserId) {
        let generation = {
            let mut guard = self.inner.registry.write().await;
            guard.users.remove(&user_id);
            guard.auth.remove(&user_id);
            self.inner.next_generation()
        };
        self.inner.persistence.delete(user_id, generation).await;
        info!(user_id, "Cleared user cleanup state");
    }

    pub async fn set_auth_state(&self, user_id: UserId, in_auth: bool) {
        let mut guard = self.inner.registry.write().await;
        if in_auth {
            guard.auth.insert(user_id);
        } else {
            guard.auth.remove(&user_id);
        }
    }

    pub async fn is_in_auth(&self, user_id: UserId) -> bool {
        self.inner.registry.read().await.auth.contains(&user_id)
    }

    pub async fn tracked_count(&self, user_id: UserId) -> usize {
        self.inner
            .registry
            .read()
            .await
            .users
            .get(&user_id)
            .map_or(0, |state| state.messages.len())
    }

    pub async fn current_menu(&self, user_id: UserId) -> Option<MessageId> {
        self.inner
            .registry
            .read()
            .await
            .users
            .get(&user_id)
            .and_then(|state| state.current_menu_id)
    }

    pub async fn snapshot(&self, user_id: UserId) -> Option<ChatSnapshot> {
        self.inner
            .registry
            .read()
            .await
            .users
            .get(&user_id)
            .map(UserChatState::snapshot)
    }

    pub async fn user_count(&self) -> usize {
        self.inner.registry.read().await.users.len()
    }
}
