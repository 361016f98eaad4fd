pub mod engine;
pub mod sweep;
pub mod types;

pub use engine::{ChatCleaner, CleanRequest, CleanupReport};
pub use sweep::SweepResult;
pub use types::{
    ChatId, ChatSnapshot, MessageContext, MessageId, MessageRef, MessageTracker, UserChatState,
    UserId,
};
