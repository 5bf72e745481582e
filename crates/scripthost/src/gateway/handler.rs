//! Gateway message handler that routes chat events to the command adapter.
//!
//! The sender id reported by the gateway is the user identity: it selects the
//! workspace directory and owns every instance started from it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use scripthost_gateway_protocol::{
    CallbackQueryData, MessageContent, MessageReceivedData, error_codes,
};

use super::adapter::{CommandAdapter, MenuItem};
use super::manager::{CallbackResponse, MessageHandler, Reply};

/// Handler that maps messages and button presses to adapter operations.
pub struct GatewayMessageHandler {
    adapter: Arc<CommandAdapter>,
}

impl GatewayMessageHandler {
    pub fn new(adapter: Arc<CommandAdapter>) -> Self {
        Self { adapter }
    }

    async fn handle_text(&self, user: &str, text: &str) -> Option<Reply> {
        let text = text.trim();
        if let Some(command) = text.strip_prefix('/') {
            // Telegram appends "@botname" to commands in groups.
            let command = command.split(['@', ' ']).next().unwrap_or_default();
            return match command {
                "start" | "help" => Some(self.adapter.on_start(user)),
                _ => None,
            };
        }

        let item = MenuItem::from_label(text)?;
        let reply = match item {
            MenuItem::UploadFile => self.adapter.upload_prompt(),
            MenuItem::MyScripts => self.adapter.control_panel(user, "📂 Control Panel:").await,
            MenuItem::Statistics => self.adapter.on_stats(user).to_reply(),
            MenuItem::ResourceMonitor => self.adapter.on_monitor(user).await,
            MenuItem::ContactOwner => self.adapter.on_contact(),
        };
        Some(reply)
    }
}

#[async_trait]
impl MessageHandler for GatewayMessageHandler {
    async fn handle_message(&self, gateway: &str, data: &MessageReceivedData) -> Option<Reply> {
        let user = data.sender.id.as_str();

        match &data.content {
            MessageContent::Text { text } => self.handle_text(user, text).await,

            MessageContent::Document { file_name, .. } => {
                match data.content.document_bytes()? {
                    Ok(bytes) => Some(self.adapter.on_upload(user, file_name, &bytes).await),
                    Err(e) => {
                        warn!(
                            gateway,
                            user,
                            file = %file_name,
                            error = %e,
                            "Undecodable document payload"
                        );
                        Some(Reply::text("❌ Upload could not be read."))
                    }
                }
            }

            MessageContent::Unknown { raw } => {
                if raw.get("error").and_then(|v| v.as_str()) != Some(error_codes::DOWNLOAD_FAILED) {
                    debug!(gateway, user, "Ignoring unsupported message content");
                    return None;
                }
                let file_name = raw.get("file_name").and_then(|v| v.as_str()).unwrap_or("file");
                let reason = raw
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("download failed");
                Some(Reply::text(format!(
                    "❌ Could not download {file_name}: {reason}"
                )))
            }
        }
    }

    async fn handle_callback_query(
        &self,
        _gateway: &str,
        data: &CallbackQueryData,
    ) -> CallbackResponse {
        self.adapter.on_action(&data.sender.id, &data.data).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::process::{Interpreters, Supervisor};
    use crate::workspace::Workspace;
    use scripthost_gateway_protocol::Sender;
    use tempfile::TempDir;

    fn handler(tmp: &TempDir) -> GatewayMessageHandler {
        let supervisor = Supervisor::new(
            Workspace::new(tmp.path().join("uploads")),
            tmp.path().join("logs"),
            Interpreters::default(),
        );
        let adapter = CommandAdapter::new(Arc::new(supervisor), BotConfig::default());
        GatewayMessageHandler::new(Arc::new(adapter))
    }

    fn message(content: MessageContent) -> MessageReceivedData {
        MessageReceivedData {
            message_id: "1".to_string(),
            chat_id: "42".to_string(),
            sender: Sender {
                id: "42".to_string(),
                username: None,
                display_name: None,
            },
            content,
            timestamp: None,
        }
    }

    fn text(t: &str) -> MessageContent {
        MessageContent::Text {
            text: t.to_string(),
        }
    }

    #[tokio::test]
    async fn start_command_returns_menu() {
        let tmp = TempDir::new().unwrap();
        let reply = handler(&tmp)
            .handle_message("telegram", &message(text("/start")))
            .await
            .unwrap();
        assert!(reply.reply_keyboard.is_some());

        let reply = handler(&tmp)
            .handle_message("telegram", &message(text("/start@scripthost_bot")))
            .await
            .unwrap();
        assert!(reply.reply_keyboard.is_some());
    }

    #[tokio::test]
    async fn menu_labels_are_routed() {
        let tmp = TempDir::new().unwrap();
        let handler = handler(&tmp);

        let reply = handler
            .handle_message("telegram", &message(text(MenuItem::MyScripts.label())))
            .await
            .unwrap();
        assert!(reply.inline_keyboard.is_some());

        let reply = handler
            .handle_message("telegram", &message(text(MenuItem::UploadFile.label())))
            .await
            .unwrap();
        assert!(reply.text.contains(".zip"));
    }

    #[tokio::test]
    async fn free_text_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let reply = handler(&tmp)
            .handle_message("telegram", &message(text("hello there")))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn document_is_saved_to_sender_workspace() {
        let tmp = TempDir::new().unwrap();
        let reply = handler(&tmp)
            .handle_message(
                "telegram",
                &message(MessageContent::document("job.sh", None, b"echo hi\n")),
            )
            .await
            .unwrap();
        assert!(reply.text.contains("job.sh uploaded"));
        assert!(tmp.path().join("uploads/42/job.sh").is_file());
    }

    #[tokio::test]
    async fn download_failure_is_reported() {
        let tmp = TempDir::new().unwrap();
        let content = MessageContent::Unknown {
            raw: serde_json::json!({
                "error": error_codes::DOWNLOAD_FAILED,
                "file_name": "big.zip",
                "reason": "file is too large",
            }),
        };
        let reply = handler(&tmp)
            .handle_message("telegram", &message(content))
            .await
            .unwrap();
        assert_eq!(reply.text, "❌ Could not download big.zip: file is too large");
    }

    #[tokio::test]
    async fn callback_uses_sender_identity() {
        let tmp = TempDir::new().unwrap();
        let response = handler(&tmp)
            .handle_callback_query(
                "telegram",
                &CallbackQueryData {
                    callback_query_id: "q".to_string(),
                    chat_id: "7".to_string(),
                    sender: Sender {
                        id: "7".to_string(),
                        username: None,
                        display_name: None,
                    },
                    message_id: "3".to_string(),
                    data: "42::stop::1".to_string(),
                },
            )
            .await;
        assert!(response.show_alert);
        assert!(response.edit.is_none());
    }
}
