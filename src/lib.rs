//! Message-lifecycle tracking and cleanup for chat bots.
//!
//! A bot reports every message it sends or receives to a [`ChatCleaner`]
//! together with a [`MessageContext`]. The engine decides which messages
//! are stale and deletes them through a [`TransportBridge`], keeping its
//! bookkeeping in a snapshot store so it survives restarts.

pub mod cleaner;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use cleaner::{
    ChatCleaner, CleanRequest, CleanupReport, MessageContext, MessageRef, MessageTracker,
    SweepResult, UserChatState,
};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, PersistenceBridge, SnapshotStore};
pub use transport::{DeleteOutcome, TelegramTransport, TransportBridge};
pub use utils::{CleanerError, Result};
