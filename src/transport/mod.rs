use crate::cleaner::types::{ChatId, MessageId};
use async_trait::async_trait;
use std::time::Duration;

pub mod telegram;

pub use telegram::TelegramTransport;

/// Result of one batched delete call. Applies to the whole batch it was
/// issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(Vec<MessageId>),
    /// The platform refuses to delete these, e.g. they are too old.
    Forbidden(Vec<MessageId>),
    /// These ids are already gone.
    InvalidId(Vec<MessageId>),
    /// Mandatory wait before the next call.
    RateLimited(Duration),
    TransportError(String),
}

impl DeleteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeleteOutcome::Deleted(_) => "deleted",
            DeleteOutcome::Forbidden(_) => "forbidden",
            DeleteOutcome::InvalidId(_) => "invalid_id",
            DeleteOutcome::RateLimited(_) => "rate_limited",
            DeleteOutcome::TransportError(_) => "transport_error",
        }
    }
}

/// Chat platform as seen by the cleanup engine.
///
/// Implementations classify their own failures into `DeleteOutcome`; the
/// engine never subdivides a batch to find the offending id.
#[async_trait]
pub trait TransportBridge: Send + Sync {
    async fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> DeleteOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedTransport {
        outcomes: Mutex<Vec<DeleteOutcome>>,
        calls: Mutex<Vec<(ChatId, Vec<MessageId>)>>,
    }

    #[async_trait]
    impl TransportBridge for ScriptedTransport {
        async fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> DeleteOutcome {
            self.calls.lock().unwrap().push((chat_id, ids.to_vec()));
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| DeleteOutcome::Deleted(ids.to_vec()))
        }
    }

    #[tokio::test]
    async fn test_transport_trait_object() {
        let transport: Box<dyn TransportBridge> = Box::new(ScriptedTransport {
            outcomes: Mutex::new(vec![DeleteOutcome::Forbidden(vec![1])]),
            calls: Mutex::new(Vec::new()),
        });

        let first = transport.delete_messages(5, &[1]).await;
        assert_eq!(first, DeleteOutcome::Forbidden(vec![1]));
        assert_eq!(first.label(), "forbidden");

        let second = transport.delete_messages(5, &[2, 3]).await;
        assert_eq!(second, DeleteOutcome::Deleted(vec![2, 3]));
    }
}
