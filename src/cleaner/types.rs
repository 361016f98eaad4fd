use crate::utils::error::CleanerError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i32;

/// Semantic category of a tracked message. Governs its cleanup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageContext {
    /// Authentication flow prompts and replies
    Auth,
    /// Menu with buttons; at most one live menu per user
    Menu,
    /// Command messages such as `/start`, deleted shortly after tracking
    Command,
    /// Confirmations that survive bulk cleanup
    System,
    /// Anything transient
    Temp,
}

impl MessageContext {
    pub const ALL: [MessageContext; 5] = [
        MessageContext::Auth,
        MessageContext::Menu,
        MessageContext::Command,
        MessageContext::System,
        MessageContext::Temp,
    ];

    /// Contexts a handler sweeps before rendering a new top-level view.
    pub fn navigation() -> HashSet<MessageContext> {
        HashSet::from([
            MessageContext::Menu,
            MessageContext::Command,
            MessageContext::Temp,
        ])
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageContext::Auth => "AUTH",
            MessageContext::Menu => "MENU",
            MessageContext::Command => "COMMAND",
            MessageContext::System => "SYSTEM",
            MessageContext::Temp => "TEMP",
        }
    }
}

impl fmt::Display for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageContext {
    type Err = CleanerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageContext::ALL
            .into_iter()
            .find(|ctx| ctx.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CleanerError::invalid_input(format!("unknown message context: {s}")))
    }
}

/// Identifiers of a message the bot sent or received.
///
/// Only ids are kept; deleting later needs nothing else from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl MessageRef {
    pub fn new(chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

/// One tracked message. Replaced on re-track, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTracker {
    pub message_id: MessageId,
    pub context: MessageContext,
    pub chat_id: ChatId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MessageTracker {
    pub fn new(message: MessageRef, context: MessageContext) -> Self {
        Self {
            message_id: message.message_id,
            context,
            chat_id: message.chat_id,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Serialized form of a user's bookkeeping, as handed to the snapshot store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub messages: Vec<MessageTracker>,
    #[serde(default, alias = "current_menu")]
    pub current_menu_id: Option<MessageId>,
}

/// Per-user aggregate owned by the engine.
#[derive(Debug, Clone)]
pub struct UserChatState {
    pub messages: HashMap<MessageId, MessageTracker>,
    pub current_menu_id: Option<MessageId>,
    pub last_activity: DateTime<Utc>,
    cleanup_lock: Arc<Mutex<()>>,
}

impl Default for UserChatState {
    fn default() -> Self {
        Self::new()
    }
}

impl UserChatState {
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
            current_menu_id: None,
            last_activity: Utc::now(),
            cleanup_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Rebuilds state from a persisted snapshot. Activity restarts now.
    pub fn from_snapshot(snapshot: ChatSnapshot) -> Self {
        let mut state = Self::new();
        state.messages = snapshot
            .messages
            .into_iter()
            .map(|tracker| (tracker.message_id, tracker))
            .collect();
        state.current_menu_id = snapshot.current_menu_id;
        state
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let mut messages: Vec<MessageTracker> = self.messages.values().cloned().collect();
        messages.sort_by_key(|t| (t.timestamp, t.message_id));
        ChatSnapshot {
            messages,
            current_menu_id: self.current_menu_id,
        }
    }

    pub fn cleanup_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.cleanup_lock)
    }

    /// Inserts or replaces the tracker for its message id and bumps activity.
    pub fn insert(&mut self, tracker: MessageTracker) -> Option<MessageTracker> {
        self.last_activity = tracker.timestamp;
        self.messages.insert(tracker.message_id, tracker)
    }

    /// Points the current menu at `message_id`, returning the one it replaced.
    pub fn replace_menu(&mut self, message_id: MessageId) -> Option<MessageId> {
        self.current_menu_id.replace(message_id)
    }

    /// Drops oldest-by-timestamp trackers until at most `cap` remain.
    ///
    /// Context is ignored, so the current menu can go too. Only the
    /// tracking record is removed; `current_menu_id` is left as is.
    pub fn evict_oldest(&mut self, cap: usize) -> Vec<MessageId> {
        if self.messages.len() <= cap {
            return Vec::new();
        }
        let mut by_age: Vec<(DateTime<Utc>, MessageId)> = self
            .messages
            .values()
            .map(|t| (t.timestamp, t.message_id))
            .collect();
        by_age.sort();

        let excess = self.messages.len() - cap;
        let evicted: Vec<MessageId> = by_age.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &evicted {
            self.messages.remove(id);
        }
        evicted
    }

    /// Explicit ids plus every tracked id whose context is in `filter`,
    /// minus the current menu when `exclude_current_menu` is set.
    pub fn deletion_set(
        &self,
        filter: Option<&HashSet<MessageContext>>,
        message_ids: Option<&HashSet<MessageId>>,
        exclude_current_menu: bool,
    ) -> BTreeSet<MessageId> {
        let mut to_delete: BTreeSet<MessageId> = BTreeSet::new();
        if let Some(ids) = message_ids {
            to_delete.extend(ids.iter().copied());
        }
        if let Some(filter) = filter {
            to_delete.extend(
                self.messages
                    .values()
                    .filter(|t| filter.contains(&t.context))
                    .map(|t| t.message_id),
            );
        }
        if exclude_current_menu {
            if let Some(menu_id) = self.current_menu_id {
                to_delete.remove(&menu_id);
            }
        }
        to_delete
    }

    /// Removes trackers for ids that no longer exist on the platform.
    pub fn forget(&mut self, ids: &[MessageId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if self.messages.remove(id).is_some() {
                removed += 1;
            }
            if self.current_menu_id == Some(*id) {
                self.current_menu_id = None;
            }
        }
        removed
    }

    pub fn is_inactive(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.last_activity) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_at(id: MessageId, context: MessageContext, secs_ago: i64) -> MessageTracker {
        MessageTracker::new(MessageRef::new(10, id), context)
            .with_timestamp(Utc::now() - Duration::seconds(secs_ago))
    }

    #[test]
    fn test_context_parse_and_display() {
        assert_eq!("MENU".parse::<MessageContext>().unwrap(), MessageContext::Menu);
        assert_eq!("temp".parse::<MessageContext>().unwrap(), MessageContext::Temp);
        assert_eq!(MessageContext::System.to_string(), "SYSTEM");
        let err = "BANNER".parse::<MessageContext>().unwrap_err();
        assert!(matches!(err, CleanerError::InvalidInput { .. }));
    }

    #[test]
    fn test_context_serializes_by_name() {
        let json = serde_json::to_string(&MessageContext::Command).unwrap();
        assert_eq!(json, "\"COMMAND\"");
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let mut state = UserChatState::new();
        let mut first = HashMap::new();
        first.insert("step".to_string(), serde_json::json!(1));
        let mut second = HashMap::new();
        second.insert("step".to_string(), serde_json::json!(2));

        state.insert(tracker_at(7, MessageContext::Temp, 5).with_metadata(first));
        let replaced = state.insert(tracker_at(7, MessageContext::Temp, 0).with_metadata(second));

        assert!(replaced.is_some());
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[&7].metadata["step"], serde_json::json!(2));
    }

    #[test]
    fn test_evict_oldest_ignores_context() {
        let mut state = UserChatState::new();
        state.insert(tracker_at(1, MessageContext::Menu, 30));
        state.insert(tracker_at(2, MessageContext::System, 20));
        state.insert(tracker_at(3, MessageContext::Temp, 10));
        state.insert(tracker_at(4, MessageContext::Temp, 0));
        state.current_menu_id = Some(1);

        let evicted = state.evict_oldest(2);

        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(state.messages.len(), 2);
        assert!(state.messages.contains_key(&3));
        assert!(state.messages.contains_key(&4));
        // Eviction leaves the menu pointer dangling
        assert_eq!(state.current_menu_id, Some(1));
    }

    #[test]
    fn test_evict_under_cap_is_noop() {
        let mut state = UserChatState::new();
        state.insert(tracker_at(1, MessageContext::Temp, 0));
        assert!(state.evict_oldest(5).is_empty());
        assert_eq!(state.messages.len(), 1);
    }

    #[test]
    fn test_deletion_set_excludes_current_menu() {
        let mut state = UserChatState::new();
        state.insert(tracker_at(1, MessageContext::Menu, 3));
        state.insert(tracker_at(2, MessageContext::Command, 2));
        state.insert(tracker_at(3, MessageContext::Temp, 1));
        state.current_menu_id = Some(1);

        let filter = HashSet::from([MessageContext::Menu, MessageContext::Temp]);
        let set = state.deletion_set(Some(&filter), None, true);
        assert_eq!(set, BTreeSet::from([3]));

        let set = state.deletion_set(Some(&filter), None, false);
        assert_eq!(set, BTreeSet::from([1, 3]));
    }

    #[test]
    fn test_deletion_set_keeps_untracked_explicit_ids() {
        let state = UserChatState::new();
        let ids = HashSet::from([99, 100]);
        let set = state.deletion_set(None, Some(&ids), true);
        assert_eq!(set, BTreeSet::from([99, 100]));
    }

    #[test]
    fn test_system_messages_only_by_id() {
        let mut state = UserChatState::new();
        state.insert(tracker_at(5, MessageContext::System, 0));
        let nav = MessageContext::navigation();
        assert!(state.deletion_set(Some(&nav), None, true).is_empty());
        let ids = HashSet::from([5]);
        assert_eq!(state.deletion_set(Some(&nav), Some(&ids), true), BTreeSet::from([5]));
    }

    #[test]
    fn test_forget_clears_menu_pointer() {
        let mut state = UserChatState::new();
        state.insert(tracker_at(1, MessageContext::Menu, 0));
        state.current_menu_id = Some(1);
        assert_eq!(state.forget(&[1, 2]), 1);
        assert!(state.current_menu_id.is_none());
        assert!(state.messages.is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_menu() {
        let mut state = UserChatState::new();
        state.insert(tracker_at(1, MessageContext::Menu, 1));
        state.insert(tracker_at(2, MessageContext::Auth, 0));
        state.current_menu_id = Some(1);

        let json = serde_json::to_string(&state.snapshot()).unwrap();
        assert!(json.contains("\"MENU\""));
        assert!(json.contains("current_menu_id"));

        let restored = UserChatState::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.messages.len(), 2);
        assert_eq!(restored.current_menu_id, Some(1));
    }

    #[test]
    fn test_snapshot_accepts_legacy_menu_key() {
        let json = r#"{"messages": [], "current_menu": 12}"#;
        let snapshot: ChatSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.current_menu_id, Some(12));
    }

    #[test]
    fn test_is_inactive() {
        let mut state = UserChatState::new();
        state.last_activity = Utc::now() - Duration::hours(2);
        assert!(state.is_inactive(Utc::now(), Duration::hours(1)));
        state.last_activity = Utc::now();
        assert!(!state.is_inactive(Utc::now(), Duration::hours(1)));
    }
}
