//! Gateway Manager for built-in gateway plugins.
//!
//! The Gateway Manager provides a unified interface for:
//! - Registering and starting gateways
//! - Routing events from gateways to the message handler
//! - Sending replies, message edits and callback answers back through gateways

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use scripthost_gateway_protocol::{
    CallbackQueryData, GatewayCommand, GatewayEvent, InlineKeyboard, MessageContent,
    MessageReceivedData, ReplyKeyboard,
};

/// Default timeout for message handler execution.
const DEFAULT_MESSAGE_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Replies
// ============================================================================

/// A message to send back to a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub inline_keyboard: Option<InlineKeyboard>,
    pub reply_keyboard: Option<ReplyKeyboard>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            inline_keyboard: None,
            reply_keyboard: None,
        }
    }

    pub fn with_inline_keyboard(mut self, keyboard: InlineKeyboard) -> Self {
        self.inline_keyboard = Some(keyboard);
        self
    }

    pub fn with_reply_keyboard(mut self, keyboard: ReplyKeyboard) -> Self {
        self.reply_keyboard = Some(keyboard);
        self
    }
}

/// How to answer a button press.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallbackResponse {
    /// Notification shown to the user.
    pub text: Option<String>,
    /// Show `text` as a modal alert instead of a toast.
    pub show_alert: bool,
    /// Replacement for the message that carried the button.
    pub edit: Option<Reply>,
}

// ============================================================================
// Gateway Manager
// ============================================================================

/// Manager for all gateway plugins.
///
/// Handles registration, lifecycle, and event routing.
#[derive(Clone)]
pub struct GatewayManager {
    inner: Arc<RwLock<GatewayManagerInner>>,
}

struct GatewayManagerInner {
    /// Registered gateways by name.
    gateways: HashMap<String, GatewayHandle>,

    /// Message handler for incoming events.
    handler: Option<Arc<dyn MessageHandler>>,

    /// Timeout for a single handler call.
    message_handler_timeout: Duration,

    /// JoinHandles for event handler tasks, awaited at shutdown.
    event_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl GatewayManager {
    /// Create a new gateway manager with the specified message handler timeout.
    ///
    /// Events are handled concurrently, one task per event, so a slow upload
    /// from one chat never holds up button presses from another.
    pub fn new(message_handler_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(GatewayManagerInner {
                gateways: HashMap::new(),
                handler: None,
                message_handler_timeout,
                event_handles: Vec::new(),
            })),
        }
    }

    /// Set the message handler for incoming gateway events.
    pub async fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        let mut inner = self.inner.write().await;
        inner.handler = Some(handler);
    }

    /// Register a gateway and get channels for communication.
    ///
    /// Returns:
    /// - `Receiver<GatewayCommand>`: Gateway receives commands from scripthost
    /// - `Sender<GatewayEvent>`: Gateway sends events to scripthost
    pub async fn register(
        &self,
        name: impl Into<String>,
        capabilities: Vec<String>,
    ) -> (mpsc::Receiver<GatewayCommand>, mpsc::Sender<GatewayEvent>) {
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (evt_tx, evt_rx) = mpsc::channel(100);

        let handle = GatewayHandle {
            name: name.clone(),
            command_tx: cmd_tx,
            capabilities,
        };

        {
            let mut inner = self.inner.write().await;
            inner.gateways.insert(name.clone(), handle);
        }

        let manager = self.clone();
        let gateway_name = name.clone();
        let join_handle = tokio::spawn(async move {
            manager.handle_events(gateway_name, evt_rx).await;
        });

        {
            let mut inner = self.inner.write().await;
            inner.event_handles.push(join_handle);
        }

        info!(gateway = %name, "Gateway registered");
        (cmd_rx, evt_tx)
    }

    /// Unregister a gateway.
    pub async fn unregister(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if inner.gateways.remove(name).is_some() {
            info!(gateway = %name, "Gateway unregistered");
        }
    }

    /// Get a gateway handle by name.
    pub async fn get(&self, name: &str) -> Option<GatewayHandle> {
        let inner = self.inner.read().await;
        inner.gateways.get(name).cloned()
    }

    /// List all registered gateways.
    pub async fn list(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.gateways.keys().cloned().collect()
    }

    async fn command_tx(&self, gateway: &str) -> Result<mpsc::Sender<GatewayCommand>, SendError> {
        let inner = self.inner.read().await;
        match inner.gateways.get(gateway) {
            Some(handle) => Ok(handle.command_tx.clone()),
            None => {
                warn!(gateway = %gateway, "Gateway not found");
                Err(SendError::ChannelClosed)
            }
        }
    }

    /// Send a reply (with its keyboards) through a gateway.
    pub async fn send_reply(
        &self,
        gateway: &str,
        chat_id: &str,
        reply: Reply,
        reply_to: Option<String>,
    ) -> Result<(), SendError> {
        let tx = self.command_tx(gateway).await?;
        let command = GatewayCommand::SendMessage {
            request_id: ulid::Ulid::new().to_string(),
            chat_id: chat_id.to_string(),
            content: reply.text,
            reply_to,
            inline_keyboard: reply.inline_keyboard,
            reply_keyboard: reply.reply_keyboard,
        };
        tx.send(command).await.map_err(|_| SendError::ChannelClosed)
    }

    /// Replace the text and inline keyboard of an existing message.
    pub async fn edit_message(
        &self,
        gateway: &str,
        chat_id: &str,
        message_id: &str,
        reply: Reply,
    ) -> Result<(), SendError> {
        let tx = self.command_tx(gateway).await?;
        let command = GatewayCommand::EditMessage {
            request_id: ulid::Ulid::new().to_string(),
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            content: reply.text,
            inline_keyboard: reply.inline_keyboard,
        };
        tx.send(command).await.map_err(|_| SendError::ChannelClosed)
    }

    /// Send typing indicator through a gateway.
    pub async fn send_typing(&self, gateway: &str, chat_id: &str) -> Result<(), SendError> {
        let tx = self.command_tx(gateway).await?;
        let command = GatewayCommand::SendTyping {
            chat_id: chat_id.to_string(),
            duration: 5,
        };
        tx.send(command).await.map_err(|_| SendError::ChannelClosed)
    }

    /// Answer a callback query with an optional notification text.
    ///
    /// This dismisses the loading indicator on the button.
    pub async fn answer_callback_query(
        &self,
        gateway: &str,
        callback_query_id: &str,
        text: Option<String>,
        show_alert: bool,
    ) -> Result<(), SendError> {
        let tx = self.command_tx(gateway).await?;
        let command = GatewayCommand::AnswerCallbackQuery {
            request_id: ulid::Ulid::new().to_string(),
            callback_query_id: callback_query_id.to_string(),
            text,
            show_alert,
        };
        tx.send(command).await.map_err(|_| SendError::ChannelClosed)
    }

    /// Shutdown all gateways gracefully.
    pub async fn shutdown(&self) {
        let gateways = {
            let inner = self.inner.read().await;
            inner
                .gateways
                .iter()
                .map(|(k, v)| (k.clone(), v.command_tx.clone()))
                .collect::<Vec<_>>()
        };

        for (name, tx) in gateways {
            debug!(gateway = %name, "Sending shutdown to gateway");
            let _ = tx.send(GatewayCommand::Shutdown).await;
        }

        let handles = {
            let mut inner = self.inner.write().await;
            std::mem::take(&mut inner.event_handles)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Handle events from a gateway.
    async fn handle_events(&self, gateway: String, mut rx: mpsc::Receiver<GatewayEvent>) {
        let mut inflight = tokio::task::JoinSet::new();

        while let Some(event) = rx.recv().await {
            // Reap completed handler tasks
            while inflight.try_join_next().is_some() {}

            match event {
                GatewayEvent::Ready {
                    gateway: gw_name,
                    version,
                    capabilities,
                } => {
                    info!(
                        gateway = %gateway,
                        reported_name = %gw_name,
                        version = %version,
                        capabilities = ?capabilities,
                        "Gateway ready"
                    );
                }

                GatewayEvent::MessageReceived(data) => {
                    debug!(
                        gateway = %gateway,
                        message_id = %data.message_id,
                        chat_id = %data.chat_id,
                        sender_id = %data.sender.id,
                        "Message received from gateway"
                    );

                    let Some((handler, handler_timeout)) = self.handler().await else {
                        warn!(gateway = %gateway, "No message handler registered");
                        continue;
                    };
                    let manager = self.clone();
                    let gateway = gateway.clone();

                    inflight.spawn(async move {
                        if matches!(data.content, MessageContent::Document { .. }) {
                            let _ = manager.send_typing(&gateway, &data.chat_id).await;
                        }

                        let reply = match tokio::time::timeout(
                            handler_timeout,
                            handler.handle_message(&gateway, &data),
                        )
                        .await
                        {
                            Ok(reply) => reply,
                            Err(_elapsed) => {
                                warn!(
                                    gateway = %gateway,
                                    chat_id = %data.chat_id,
                                    timeout_secs = handler_timeout.as_secs(),
                                    "Message handler timed out"
                                );
                                Some(Reply::text(
                                    "Sorry, the request timed out. Please try again.",
                                ))
                            }
                        };

                        if let Some(reply) = reply
                            && let Err(e) = manager
                                .send_reply(
                                    &gateway,
                                    &data.chat_id,
                                    reply,
                                    Some(data.message_id.clone()),
                                )
                                .await
                        {
                            error!(
                                gateway = %gateway,
                                chat_id = %data.chat_id,
                                error = %e,
                                "Failed to send response"
                            );
                        }
                    });
                }

                GatewayEvent::CallbackQuery(data) => {
                    debug!(
                        gateway = %gateway,
                        callback_query_id = %data.callback_query_id,
                        chat_id = %data.chat_id,
                        data = %data.data,
                        "Callback query received"
                    );

                    let Some((handler, handler_timeout)) = self.handler().await else {
                        warn!(gateway = %gateway, "No message handler registered");
                        continue;
                    };
                    let manager = self.clone();
                    let gateway = gateway.clone();

                    inflight.spawn(async move {
                        let response = match tokio::time::timeout(
                            handler_timeout,
                            handler.handle_callback_query(&gateway, &data),
                        )
                        .await
                        {
                            Ok(response) => response,
                            Err(_elapsed) => {
                                warn!(
                                    gateway = %gateway,
                                    callback_query_id = %data.callback_query_id,
                                    timeout_secs = handler_timeout.as_secs(),
                                    "Callback query handler timed out"
                                );
                                CallbackResponse {
                                    text: Some("Request timed out".to_string()),
                                    show_alert: true,
                                    edit: None,
                                }
                            }
                        };

                        if let Err(e) = manager
                            .answer_callback_query(
                                &gateway,
                                &data.callback_query_id,
                                response.text,
                                response.show_alert,
                            )
                            .await
                        {
                            warn!(
                                gateway = %gateway,
                                callback_query_id = %data.callback_query_id,
                                error = %e,
                                "Failed to answer callback query"
                            );
                        }

                        if let Some(edit) = response.edit
                            && let Err(e) = manager
                                .edit_message(&gateway, &data.chat_id, &data.message_id, edit)
                                .await
                        {
                            warn!(
                                gateway = %gateway,
                                chat_id = %data.chat_id,
                                error = %e,
                                "Failed to refresh control panel"
                            );
                        }
                    });
                }

                GatewayEvent::CommandOk {
                    request_id,
                    message_id,
                } => {
                    debug!(
                        gateway = %gateway,
                        request_id = %request_id,
                        message_id = ?message_id,
                        "Command completed"
                    );
                }

                GatewayEvent::CommandError {
                    request_id,
                    code,
                    message,
                } => {
                    error!(
                        gateway = %gateway,
                        request_id = %request_id,
                        code = %code,
                        message = %message,
                        "Command failed"
                    );
                }

                GatewayEvent::Pong {
                    request_id,
                    uptime_seconds,
                    connected,
                } => {
                    debug!(
                        gateway = %gateway,
                        request_id = %request_id,
                        uptime_seconds = %uptime_seconds,
                        connected = %connected,
                        "Gateway pong"
                    );
                }

                GatewayEvent::Error {
                    code,
                    message,
                    fatal,
                } => {
                    if fatal {
                        error!(
                            gateway = %gateway,
                            code = %code,
                            message = %message,
                            "Fatal gateway error"
                        );
                        self.unregister(&gateway).await;
                    } else {
                        warn!(
                            gateway = %gateway,
                            code = %code,
                            message = %message,
                            "Gateway error"
                        );
                    }
                }

                GatewayEvent::Shutdown { reason } => {
                    info!(gateway = %gateway, reason = %reason, "Gateway shutdown");
                    self.unregister(&gateway).await;
                    break;
                }
            }
        }

        // Wait for in-flight handlers to complete
        while inflight.join_next().await.is_some() {}

        debug!(gateway = %gateway, "Gateway event handler stopped");
    }

    async fn handler(&self) -> Option<(Arc<dyn MessageHandler>, Duration)> {
        let inner = self.inner.read().await;
        inner
            .handler
            .clone()
            .map(|handler| (handler, inner.message_handler_timeout))
    }
}

impl Default for GatewayManager {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_HANDLER_TIMEOUT)
    }
}

// ============================================================================
// Message Handler
// ============================================================================

/// Handler for incoming gateway events.
///
/// The Gateway Manager calls this when a message or button press arrives.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle an incoming message. Returns the reply to send, if any.
    async fn handle_message(&self, gateway: &str, data: &MessageReceivedData) -> Option<Reply>;

    /// Handle a callback query from an inline keyboard button press.
    async fn handle_callback_query(
        &self,
        _gateway: &str,
        _data: &CallbackQueryData,
    ) -> CallbackResponse {
        CallbackResponse::default()
    }
}

// ============================================================================
// Gateway Handle
// ============================================================================

/// Handle for communicating with a gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    /// Gateway name (e.g., "telegram").
    pub name: String,

    /// Channel to send commands to the gateway.
    pub command_tx: mpsc::Sender<GatewayCommand>,

    /// Capabilities reported by the gateway.
    pub capabilities: Vec<String>,
}

/// Error sending a command to a gateway.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("gateway channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use scripthost_gateway_protocol::{InlineButton, Sender};

    struct EchoHandler;

    #[async_trait::async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle_message(
            &self,
            _gateway: &str,
            data: &MessageReceivedData,
        ) -> Option<Reply> {
            data.content.as_text().map(|t| Reply::text(format!("echo: {t}")))
        }

        async fn handle_callback_query(
            &self,
            _gateway: &str,
            data: &CallbackQueryData,
        ) -> CallbackResponse {
            CallbackResponse {
                text: Some(format!("pressed {}", data.data)),
                show_alert: false,
                edit: Some(Reply::text("refreshed").with_inline_keyboard(
                    InlineKeyboard::single_row(vec![InlineButton::new("x", "noop")]),
                )),
            }
        }
    }

    fn sender() -> Sender {
        Sender {
            id: "42".to_string(),
            username: None,
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let manager = GatewayManager::default();

        let (_cmd_rx, _evt_tx) = manager
            .register("telegram", vec!["documents".to_string()])
            .await;

        let gateways = manager.list().await;
        assert_eq!(gateways, vec!["telegram".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let manager = GatewayManager::default();

        let (_cmd_rx, _evt_tx) = manager.register("telegram", vec![]).await;
        assert_eq!(manager.list().await.len(), 1);

        manager.unregister("telegram").await;
        assert_eq!(manager.list().await.len(), 0);
    }

    #[tokio::test]
    async fn test_get_gateway() {
        let manager = GatewayManager::default();

        let (_cmd_rx, _evt_tx) = manager
            .register("telegram", vec!["inline_keyboard".to_string(), "edit".to_string()])
            .await;

        let handle = manager.get("telegram").await.unwrap();
        assert_eq!(handle.name, "telegram");
        assert!(handle.capabilities.iter().any(|c| c == "edit"));
        assert!(!handle.capabilities.iter().any(|c| c == "delete"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_gateway_fails() {
        let manager = GatewayManager::default();
        let result = manager
            .send_reply("missing", "1", Reply::text("hi"), None)
            .await;
        assert!(matches!(result, Err(SendError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_message_reply_is_sent_back() {
        let manager = GatewayManager::default();
        manager.set_handler(Arc::new(EchoHandler)).await;
        let (mut cmd_rx, evt_tx) = manager.register("test", vec![]).await;

        evt_tx
            .send(GatewayEvent::MessageReceived(Box::new(MessageReceivedData {
                message_id: "5".to_string(),
                chat_id: "100".to_string(),
                sender: sender(),
                content: MessageContent::Text {
                    text: "hello".to_string(),
                },
                timestamp: None,
            })))
            .await
            .unwrap();

        match cmd_rx.recv().await.unwrap() {
            GatewayCommand::SendMessage {
                chat_id,
                content,
                reply_to,
                ..
            } => {
                assert_eq!(chat_id, "100");
                assert_eq!(content, "echo: hello");
                assert_eq!(reply_to.as_deref(), Some("5"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_callback_is_answered_then_message_edited() {
        let manager = GatewayManager::default();
        manager.set_handler(Arc::new(EchoHandler)).await;
        let (mut cmd_rx, evt_tx) = manager.register("test", vec![]).await;

        evt_tx
            .send(GatewayEvent::CallbackQuery(Box::new(CallbackQueryData {
                callback_query_id: "cq1".to_string(),
                chat_id: "100".to_string(),
                sender: sender(),
                message_id: "9".to_string(),
                data: "42::stop::1".to_string(),
            })))
            .await
            .unwrap();

        match cmd_rx.recv().await.unwrap() {
            GatewayCommand::AnswerCallbackQuery {
                callback_query_id,
                text,
                ..
            } => {
                assert_eq!(callback_query_id, "cq1");
                assert_eq!(text.as_deref(), Some("pressed 42::stop::1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        match cmd_rx.recv().await.unwrap() {
            GatewayCommand::EditMessage {
                message_id,
                content,
                inline_keyboard,
                ..
            } => {
                assert_eq!(message_id, "9");
                assert_eq!(content, "refreshed");
                assert!(inline_keyboard.is_some());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
