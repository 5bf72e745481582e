//! Telegram gateway for scripthost using teloxide.
//!
//! Runs in-process: `serve` registers the gateway with the gateway manager and
//! hands it a pair of channels. Incoming messages, uploaded documents, and
//! button presses become [`GatewayEvent`]s; [`GatewayCommand`]s become Bot API
//! calls.

use std::time::{Duration, Instant};

use scripthost_gateway_protocol::{
    CallbackQueryData, GatewayCommand, GatewayEvent, InlineKeyboard, MessageContent,
    MessageReceivedData, ReplyKeyboard, Sender, capabilities,
};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{MediaKind, MessageKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Telegram rejects callback data longer than this.
const MAX_CALLBACK_DATA_BYTES: usize = 64;

/// Bot API download limit for `getFile`.
const DEFAULT_MAX_DOWNLOAD_BYTES: u32 = 20 * 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the Telegram gateway.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Telegram bot token from BotFather.
    pub bot_token: String,
    /// Documents larger than this are not downloaded.
    pub max_download_bytes: u32,
}

impl TelegramConfig {
    /// Create a new config with the given bot token.
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }

    /// Override the document download limit.
    pub fn with_max_download_bytes(mut self, limit: u32) -> Self {
        self.max_download_bytes = limit.min(DEFAULT_MAX_DOWNLOAD_BYTES);
        self
    }
}

// ============================================================================
// Telegram Gateway
// ============================================================================

/// Telegram gateway that bridges the Telegram Bot API with scripthost.
pub struct TelegramGateway {
    config: TelegramConfig,
    started_at: Instant,
}

impl TelegramGateway {
    /// Create a new Telegram gateway.
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
        }
    }

    /// Start the gateway and communicate via the provided channels.
    ///
    /// This method blocks until shutdown is requested.
    pub async fn start(
        self,
        event_tx: mpsc::Sender<GatewayEvent>,
        mut command_rx: mpsc::Receiver<GatewayCommand>,
    ) {
        // Timeout must outlast the long-polling timeout
        let client = match teloxide::net::default_reqwest_settings()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "Failed to build HTTP client");
                let _ = event_tx
                    .send(GatewayEvent::Error {
                        code: "client_init_failed".to_string(),
                        message: e.to_string(),
                        fatal: true,
                    })
                    .await;
                return;
            }
        };

        let bot = Bot::with_client(&self.config.bot_token, client);

        let ready_event = GatewayEvent::Ready {
            gateway: "telegram".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![
                capabilities::EDIT.to_string(),
                capabilities::TYPING.to_string(),
                capabilities::REPLY.to_string(),
                capabilities::INLINE_KEYBOARD.to_string(),
                capabilities::REPLY_KEYBOARD.to_string(),
                capabilities::DOCUMENTS.to_string(),
            ],
        };
        if event_tx.send(ready_event).await.is_err() {
            error!("Failed to send ready event");
            return;
        }

        info!("Telegram gateway starting");

        let max_download_bytes = self.config.max_download_bytes;
        let message_handler = Update::filter_message().endpoint({
            let event_tx = event_tx.clone();
            move |bot: Bot, msg: Message| {
                let event_tx = event_tx.clone();
                async move {
                    if let Err(e) = handle_message(&bot, &msg, &event_tx, max_download_bytes).await
                    {
                        warn!(error = %e, "Failed to handle message");
                    }
                    respond(())
                }
            }
        });

        let callback_handler = Update::filter_callback_query().endpoint({
            let event_tx = event_tx.clone();
            move |query: teloxide::types::CallbackQuery| {
                let event_tx = event_tx.clone();
                async move {
                    if let Err(e) = handle_callback_query(&query, &event_tx).await {
                        warn!(error = %e, "Failed to handle callback query");
                    }
                    respond(())
                }
            }
        });

        let handler = dptree::entry()
            .branch(message_handler)
            .branch(callback_handler);

        let mut dispatcher = Dispatcher::builder(bot.clone(), handler).build();
        let shutdown_token = dispatcher.shutdown_token();

        let bot_for_commands = bot.clone();
        let event_tx_for_commands = event_tx.clone();
        let started_at = self.started_at;

        let command_handle = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let event = match command {
                    GatewayCommand::SendMessage {
                        request_id,
                        chat_id,
                        content,
                        reply_to,
                        inline_keyboard,
                        reply_keyboard,
                    } => {
                        let result = send_message(
                            &bot_for_commands,
                            &chat_id,
                            &content,
                            reply_to.as_deref(),
                            inline_keyboard.as_ref(),
                            reply_keyboard.as_ref(),
                        )
                        .await;

                        match result {
                            Ok(msg_id) => GatewayEvent::CommandOk {
                                request_id,
                                message_id: Some(msg_id),
                            },
                            Err(e) => GatewayEvent::CommandError {
                                request_id,
                                code: "send_failed".to_string(),
                                message: e,
                            },
                        }
                    }

                    GatewayCommand::SendTyping { chat_id, .. } => {
                        let Ok(chat_id) = chat_id.parse::<i64>() else {
                            continue;
                        };
                        let _ = bot_for_commands
                            .send_chat_action(ChatId(chat_id), teloxide::types::ChatAction::Typing)
                            .await;
                        continue;
                    }

                    GatewayCommand::EditMessage {
                        request_id,
                        chat_id,
                        message_id,
                        content,
                        inline_keyboard,
                    } => {
                        let result = edit_message(
                            &bot_for_commands,
                            &chat_id,
                            &message_id,
                            &content,
                            inline_keyboard.as_ref(),
                        )
                        .await;

                        match result {
                            Ok(()) => GatewayEvent::CommandOk {
                                request_id,
                                message_id: Some(message_id),
                            },
                            Err(e) => GatewayEvent::CommandError {
                                request_id,
                                code: "edit_failed".to_string(),
                                message: e,
                            },
                        }
                    }

                    GatewayCommand::Ping { request_id } => GatewayEvent::Pong {
                        request_id,
                        uptime_seconds: started_at.elapsed().as_secs(),
                        connected: true,
                    },

                    GatewayCommand::AnswerCallbackQuery {
                        request_id,
                        callback_query_id,
                        text,
                        show_alert,
                    } => {
                        let result = answer_callback_query(
                            &bot_for_commands,
                            &callback_query_id,
                            text,
                            show_alert,
                        )
                        .await;

                        match result {
                            Ok(()) => GatewayEvent::CommandOk {
                                request_id,
                                message_id: None,
                            },
                            Err(e) => GatewayEvent::CommandError {
                                request_id,
                                code: "answer_callback_failed".to_string(),
                                message: e,
                            },
                        }
                    }

                    GatewayCommand::Shutdown => {
                        info!("Telegram gateway received shutdown command");
                        match shutdown_token.shutdown() {
                            Ok(done) => drop(done),
                            Err(e) => warn!(error = %e, "Dispatcher was not running"),
                        }
                        let _ = event_tx_for_commands
                            .send(GatewayEvent::Shutdown {
                                reason: "shutdown requested".to_string(),
                            })
                            .await;
                        break;
                    }
                };

                if event_tx_for_commands.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Command handler stopped");
        });

        let polling = teloxide::update_listeners::Polling::builder(bot)
            .timeout(Duration::from_secs(30))
            .build();

        dispatcher
            .dispatch_with_listener(
                polling,
                teloxide::error_handlers::LoggingErrorHandler::with_custom_text(
                    "Telegram polling error (will retry)",
                ),
            )
            .await;

        command_handle.abort();
        info!("Telegram gateway stopped");
    }
}

// ============================================================================
// Message Handling
// ============================================================================

async fn handle_message(
    bot: &Bot,
    msg: &Message,
    event_tx: &mpsc::Sender<GatewayEvent>,
    max_download_bytes: u32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(content) = extract_content(bot, msg, max_download_bytes).await else {
        debug!("Ignoring message without extractable content");
        return Ok(());
    };

    let event = GatewayEvent::MessageReceived(Box::new(MessageReceivedData {
        message_id: msg.id.0.to_string(),
        chat_id: msg.chat.id.0.to_string(),
        sender: extract_sender(msg),
        content,
        timestamp: Some(msg.date),
    }));

    event_tx.send(event).await?;
    Ok(())
}

async fn handle_callback_query(
    query: &teloxide::types::CallbackQuery,
    event_tx: &mpsc::Sender<GatewayEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(data) = &query.data else {
        debug!("Ignoring callback query without data");
        return Ok(());
    };

    let Some(message) = &query.message else {
        debug!("Ignoring callback query without message");
        return Ok(());
    };

    let sender = Sender {
        id: query.from.id.0.to_string(),
        username: query.from.username.clone(),
        display_name: Some(display_name(
            &query.from.first_name,
            query.from.last_name.as_deref(),
        )),
    };

    let event = GatewayEvent::CallbackQuery(Box::new(CallbackQueryData {
        callback_query_id: query.id.to_string(),
        chat_id: message.chat().id.0.to_string(),
        sender,
        message_id: message.id().0.to_string(),
        data: data.clone(),
    }));

    event_tx.send(event).await?;
    Ok(())
}

async fn extract_content(
    bot: &Bot,
    msg: &Message,
    max_download_bytes: u32,
) -> Option<MessageContent> {
    let MessageKind::Common(common) = &msg.kind else {
        return None;
    };
    match &common.media_kind {
        MediaKind::Text(text) => Some(MessageContent::Text {
            text: text.text.clone(),
        }),
        MediaKind::Document(doc) => {
            let file_name = doc.document.file_name.clone().unwrap_or_default();
            let mime_type = doc.document.mime_type.as_ref().map(|m| m.to_string());

            if doc.document.file.size > max_download_bytes {
                warn!(
                    file = %file_name,
                    size = doc.document.file.size,
                    limit = max_download_bytes,
                    "Document too large to download"
                );
                return Some(download_failure(&file_name, "file is too large"));
            }

            match download_document(bot, &doc.document.file.id).await {
                Ok(bytes) => Some(MessageContent::document(file_name, mime_type, &bytes)),
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Failed to download document");
                    Some(download_failure(&file_name, &e))
                }
            }
        }
        _ => None,
    }
}

async fn download_document(
    bot: &Bot,
    file_id: &teloxide::types::FileId,
) -> Result<Vec<u8>, String> {
    let file = bot
        .get_file(file_id.clone())
        .await
        .map_err(|e| e.to_string())?;
    let mut buf = Vec::with_capacity(file.size as usize);
    bot.download_file(&file.path, &mut buf)
        .await
        .map_err(|e| e.to_string())?;
    Ok(buf)
}

fn download_failure(file_name: &str, reason: &str) -> MessageContent {
    MessageContent::Unknown {
        raw: serde_json::json!({
            "error": scripthost_gateway_protocol::error_codes::DOWNLOAD_FAILED,
            "file_name": file_name,
            "reason": reason,
        }),
    }
}

fn extract_sender(msg: &Message) -> Sender {
    msg.from
        .as_ref()
        .map(|user| Sender {
            id: user.id.0.to_string(),
            username: user.username.clone(),
            display_name: Some(display_name(&user.first_name, user.last_name.as_deref())),
        })
        .unwrap_or_else(|| Sender {
            id: "unknown".to_string(),
            username: None,
            display_name: None,
        })
}

fn display_name(first: &str, last: Option<&str>) -> String {
    format!("{} {}", first, last.unwrap_or("")).trim().to_string()
}

// ============================================================================
// Command Execution
// ============================================================================

async fn send_message(
    bot: &Bot,
    chat_id: &str,
    content: &str,
    reply_to: Option<&str>,
    inline_keyboard: Option<&InlineKeyboard>,
    reply_keyboard: Option<&ReplyKeyboard>,
) -> Result<String, String> {
    let chat_id: i64 = chat_id.parse().map_err(|_| "invalid chat_id".to_string())?;

    let mut request = bot.send_message(ChatId(chat_id), content);

    if let Some(reply_to) = reply_to
        && let Ok(msg_id) = reply_to.parse::<i32>()
    {
        request = request.reply_parameters(teloxide::types::ReplyParameters::new(
            teloxide::types::MessageId(msg_id),
        ));
    }

    // Telegram accepts a single markup per message; inline buttons win
    if let Some(keyboard) = inline_keyboard {
        request = request.reply_markup(convert_inline_keyboard(keyboard));
    } else if let Some(keyboard) = reply_keyboard {
        request = request.reply_markup(convert_reply_keyboard(keyboard));
    }

    let msg = request.await.map_err(|e| e.to_string())?;
    Ok(msg.id.0.to_string())
}

/// Convert protocol InlineKeyboard to teloxide InlineKeyboardMarkup.
fn convert_inline_keyboard(keyboard: &InlineKeyboard) -> teloxide::types::InlineKeyboardMarkup {
    let buttons: Vec<Vec<teloxide::types::InlineKeyboardButton>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|btn| {
                    if btn.callback_data.len() > MAX_CALLBACK_DATA_BYTES {
                        warn!(
                            data = %btn.callback_data,
                            "Callback data exceeds Telegram's 64-byte limit"
                        );
                    }
                    teloxide::types::InlineKeyboardButton::callback(&btn.text, &btn.callback_data)
                })
                .collect()
        })
        .collect();

    teloxide::types::InlineKeyboardMarkup::new(buttons)
}

fn convert_reply_keyboard(keyboard: &ReplyKeyboard) -> teloxide::types::KeyboardMarkup {
    let rows: Vec<Vec<teloxide::types::KeyboardButton>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(teloxide::types::KeyboardButton::new)
                .collect()
        })
        .collect();

    let markup = teloxide::types::KeyboardMarkup::new(rows);
    if keyboard.resize {
        markup.resize_keyboard()
    } else {
        markup
    }
}

async fn answer_callback_query(
    bot: &Bot,
    callback_query_id: &str,
    text: Option<String>,
    show_alert: bool,
) -> Result<(), String> {
    let query_id = teloxide::types::CallbackQueryId(callback_query_id.to_string());
    let mut request = bot.answer_callback_query(query_id);

    if let Some(text) = text {
        request = request.text(text);
    }
    if show_alert {
        request = request.show_alert(true);
    }

    request.await.map_err(|e| e.to_string())?;
    Ok(())
}

async fn edit_message(
    bot: &Bot,
    chat_id: &str,
    message_id: &str,
    content: &str,
    inline_keyboard: Option<&InlineKeyboard>,
) -> Result<(), String> {
    let chat_id: i64 = chat_id.parse().map_err(|_| "invalid chat_id".to_string())?;
    let message_id: i32 = message_id
        .parse()
        .map_err(|_| "invalid message_id".to_string())?;

    let mut request = bot.edit_message_text(
        ChatId(chat_id),
        teloxide::types::MessageId(message_id),
        content,
    );
    if let Some(keyboard) = inline_keyboard {
        request = request.reply_markup(convert_inline_keyboard(keyboard));
    }

    request.await.map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scripthost_gateway_protocol::InlineButton;

    #[test]
    fn config_caps_download_limit() {
        let config = TelegramConfig::new("token").with_max_download_bytes(u32::MAX);
        assert_eq!(config.max_download_bytes, DEFAULT_MAX_DOWNLOAD_BYTES);

        let config = TelegramConfig::new("token").with_max_download_bytes(1024);
        assert_eq!(config.max_download_bytes, 1024);
    }

    #[test]
    fn display_name_trims_missing_last_name() {
        assert_eq!(display_name("Ada", None), "Ada");
        assert_eq!(display_name("Ada", Some("Lovelace")), "Ada Lovelace");
    }

    #[test]
    fn inline_keyboard_keeps_row_layout() {
        let keyboard = InlineKeyboard {
            rows: vec![
                vec![InlineButton::new("Stop job.sh", "1::stop::3")],
                vec![
                    InlineButton::new("Run a.py", "1::run::a.py"),
                    InlineButton::new("Delete", "1::deleteFile::a.py"),
                ],
            ],
        };
        let markup = convert_inline_keyboard(&keyboard);
        assert_eq!(markup.inline_keyboard.len(), 2);
        assert_eq!(markup.inline_keyboard[1].len(), 2);
    }

    #[test]
    fn download_failure_is_unknown_content() {
        let content = download_failure("big.zip", "file is too large");
        match content {
            MessageContent::Unknown { raw } => {
                assert_eq!(raw["file_name"], "big.zip");
                assert_eq!(raw["error"], "download_failed");
            }
            _ => panic!("expected unknown content"),
        }
    }
}
