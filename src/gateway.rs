//! Telegram bot daemon for tidygram
//!
//! Runs a teloxide dispatcher that tracks every message it sees with the
//! chat cleaner, keeps a single live menu per user, and shuts down
//! cleanly on SIGTERM/SIGINT.

use anyhow::{Context, Result};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::Update;
use teloxide::utils::command::BotCommands;
use tidygram::config::AppConfig;
use tidygram::transport::telegram::check_batch_size;
use tidygram::{
    ChatCleaner, CleanRequest, MessageContext, MessageRef, PersistenceBridge, TelegramTransport,
    TransportBridge,
};
use tracing::{debug, error, info};

const MENU_TEXT: &str = "Main menu\n\n/menu show this menu\n/login start signing in\n/clean tidy this chat\n/logout forget everything about you";

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase")]
pub enum UserCommand {
    #[command(description = "show the main menu")]
    Start,
    #[command(description = "show the main menu")]
    Menu,
    #[command(description = "start signing in")]
    Login,
    #[command(description = "delete tracked messages in this chat")]
    Clean,
    #[command(description = "forget all cleanup state")]
    Logout,
}

impl UserCommand {
    pub fn from_text(text: &str) -> Option<Self> {
        Self::parse(text, "").ok()
    }
}

/// Runs the bot until a shutdown signal arrives.
pub async fn run_gateway(config: &AppConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting tidygram gateway"
    );

    let token = config.telegram_token.clone().context(
        "No Telegram token configured. Set TELEGRAM_BOT_TOKEN or add telegram_token to config.json",
    )?;
    let telegram = TelegramTransport::new(token).context("Invalid Telegram token")?;
    check_batch_size(config.cleaner.deletion_batch_size)
        .context("Invalid cleaner configuration")?;
    let bot = telegram.bot();
    let transport: Arc<dyn TransportBridge> = Arc::new(telegram);

    let persistence = PersistenceBridge::open(&config.persistence)
        .await
        .context("Failed to open snapshot store")?;
    let cleaner = ChatCleaner::new(config.cleaner.clone(), persistence);
    cleaner.start().await;

    if config.cleaner.dry_run {
        info!("Dry run enabled, no messages will be deleted");
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    let handler = Update::filter_message().endpoint({
        let cleaner = cleaner.clone();
        let transport = Arc::clone(&transport);
        move |bot: Bot, msg: Message| {
            let cleaner = cleaner.clone();
            let transport = Arc::clone(&transport);
            async move { handle_message(bot, msg, cleaner, transport).await }
        }
    });

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .default_handler(|_upd| async move {
            debug!("Ignoring non-message update");
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in message handler",
        ))
        .build();

    info!("Gateway is running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = dispatcher.dispatch() => {
            info!("Telegram dispatcher stopped");
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, starting graceful shutdown...");
        }
    }

    cleaner.shutdown().await;
    info!("Gateway shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    }
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    cleaner: ChatCleaner,
    transport: Arc<dyn TransportBridge>,
) -> ResponseResult<()> {
    let Some(user_id) = msg.from.as_ref().map(|u| u.id.0 as i64) else {
        debug!("Message without user info, ignoring");
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    let command = msg.text().and_then(UserCommand::from_text);
    let in_auth = cleaner.is_in_auth(user_id).await;

    let context = match (&command, in_auth) {
        (Some(_), _) => MessageContext::Command,
        (None, true) => MessageContext::Auth,
        (None, false) => MessageContext::Temp,
    };
    cleaner
        .track_message(&transport, user_id, MessageRef::new(chat_id, msg.id.0), context, None)
        .await;

    match command {
        Some(UserCommand::Start) | Some(UserCommand::Menu) => {
            let chat = msg.chat.id;
            let bot = &bot;
            cleaner
                .render_menu(&transport, user_id, chat_id, move || async move {
                    let sent = bot.send_message(chat, MENU_TEXT).await?;
                    Ok::<_, teloxide::RequestError>(MessageRef::new(chat_id, sent.id.0))
                })
                .await?;
        }
        Some(UserCommand::Login) => {
            cleaner.set_auth_state(user_id, true).await;
            let sent = bot
                .send_message(msg.chat.id, "Send your access code.")
                .await?;
            cleaner
                .track_message(
                    &transport,
                    user_id,
                    MessageRef::new(chat_id, sent.id.0),
                    MessageContext::Auth,
                    None,
                )
                .await;
        }
        Some(UserCommand::Clean) => {
            let report = cleaner
                .clean_messages(
                    transport.as_ref(),
                    user_id,
                    chat_id,
                    CleanRequest::contexts(MessageContext::navigation()),
                )
                .await;
            let text = if report.skipped {
                "A cleanup is already running.".to_string()
            } else {
                format!("Removed {} messages.", report.deleted)
            };
            let sent = bot.send_message(msg.chat.id, text).await?;
            cleaner
                .track_message(
                    &transport,
                    user_id,
                    MessageRef::new(chat_id, sent.id.0),
                    MessageContext::System,
                    None,
                )
                .await;
        }
        Some(UserCommand::Logout) => {
            cleaner
                .clean_messages(
                    transport.as_ref(),
                    user_id,
                    chat_id,
                    logout_request(),
                )
                .await;
            cleaner.clear_user_data(user_id).await;
            bot.send_message(msg.chat.id, "Signed out.").await?;
        }
        None if in_auth => {
            cleaner.set_auth_state(user_id, false).await;
            cleaner
                .clean_messages(
                    transport.as_ref(),
                    user_id,
                    chat_id,
                    CleanRequest::contexts([MessageContext::Auth]),
                )
                .await;
            let sent = bot.send_message(msg.chat.id, "Signed in.").await?;
            cleaner
                .track_message(
                    &transport,
                    user_id,
                    MessageRef::new(chat_id, sent.id.0),
                    MessageContext::System,
                    None,
                )
                .await;
        }
        None => {
            debug!(user_id, chat_id, "Tracked free text");
        }
    }

    Ok(())
}

/// Everything except SYSTEM, current menu included.
fn logout_request() -> CleanRequest {
    CleanRequest::contexts(
        MessageContext::ALL
            .into_iter()
            .filter(|context| *context != MessageContext::System),
    )
    .include_current_menu()
}
