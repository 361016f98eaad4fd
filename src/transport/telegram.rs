use crate::cleaner::types::{ChatId, MessageId};
use crate::transport::{DeleteOutcome, TransportBridge};
use crate::utils::error::{CleanerError, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::{ApiError, RequestError};

/// Bot API limit for a single `deleteMessages` call.
pub const TELEGRAM_MAX_DELETE_BATCH: usize = 100;

/// Deletes messages through the Telegram Bot API via teloxide.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    /// Validates the token format before creating the bot.
    pub fn new(token: String) -> Result<Self> {
        if !is_valid_token_format(&token) {
            return Err(CleanerError::config(
                "Telegram token must be in format digits:secret (see @BotFather)",
            ));
        }
        Ok(Self {
            bot: Bot::new(token),
        })
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }
}

/// Maps a teloxide failure onto the engine's outcome taxonomy.
pub fn classify_error(err: RequestError, ids: &[MessageId]) -> DeleteOutcome {
    match err {
        RequestError::RetryAfter(wait) => DeleteOutcome::RateLimited(wait.duration()),
        RequestError::Api(ApiError::MessageCantBeDeleted) => DeleteOutcome::Forbidden(ids.to_vec()),
        RequestError::Api(ApiError::MessageToDeleteNotFound)
        | RequestError::Api(ApiError::MessageIdInvalid) => DeleteOutcome::InvalidId(ids.to_vec()),
        other => DeleteOutcome::TransportError(other.to_string()),
    }
}

#[async_trait]
impl TransportBridge for TelegramTransport {
    async fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> DeleteOutcome {
        if ids.is_empty() {
            return DeleteOutcome::Deleted(Vec::new());
        }
        let message_ids: Vec<teloxide::types::MessageId> =
            ids.iter().map(|id| teloxide::types::MessageId(*id)).collect();

        match self
            .bot
            .delete_messages(teloxide::types::ChatId(chat_id), message_ids)
            .await
        {
            Ok(_) => {
                tracing::debug!(chat_id, count = ids.len(), "Deleted Telegram messages");
                DeleteOutcome::Deleted(ids.to_vec())
            }
            Err(e) => classify_error(e, ids),
        }
    }
}

/// Rejects batch sizes `deleteMessages` would refuse outright.
pub fn check_batch_size(size: usize) -> Result<()> {
    if size > TELEGRAM_MAX_DELETE_BATCH {
        return Err(CleanerError::config(format!(
            "deletion_batch_size {size} exceeds the Telegram limit of {TELEGRAM_MAX_DELETE_BATCH}"
        )));
    }
    Ok(())
}

/// Validates Telegram bot token format: `123456789:ABCdef...`
pub fn is_valid_token_format(token: &str) -> bool {
    let Some((bot_id, secret)) = token.split_once(':') else {
        return false;
    };
    if secret.contains(':') || secret.is_empty() {
        return false;
    }
    !bot_id.is_empty() && bot_id.chars().all(|c| c.is_ascii_digit())
}
