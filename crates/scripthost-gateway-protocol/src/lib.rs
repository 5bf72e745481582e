//! Gateway protocol types for communication between scripthost and chat gateways.
//!
//! A gateway bridges one chat platform (Telegram today) to the scripthost core.
//! The two sides exchange tagged serde enums over channels:
//!
//! - **Commands** (scripthost → gateway): send or edit messages, answer button presses
//! - **Events** (gateway → scripthost): incoming messages, uploads, button presses
//!
//! The enums serialize as JSON with a `type` tag so that a gateway can also run
//! out of process and speak JSON Lines over stdio.
//!
//! # Example
//!
//! ```ignore
//! use scripthost_gateway_protocol::{GatewayCommand, GatewayEvent};
//!
//! let event = GatewayEvent::Ready {
//!     gateway: "my-gateway".to_string(),
//!     version: "1.0.0".to_string(),
//!     capabilities: vec![],
//! };
//! println!("{}", serde_json::to_string(&event)?);
//! ```

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (scripthost → Gateway)
// ============================================================================

/// Commands sent from scripthost to a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Send a text message to a chat.
    SendMessage {
        request_id: String,
        chat_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        /// Buttons attached to the message (control panel).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inline_keyboard: Option<InlineKeyboard>,
        /// Persistent keyboard replacing the user's text input (main menu).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_keyboard: Option<ReplyKeyboard>,
    },

    /// Show typing indicator in a chat.
    SendTyping {
        chat_id: String,
        /// Duration in seconds (0 = stop typing indicator).
        #[serde(default)]
        duration: u32,
    },

    /// Edit a previously sent message, optionally replacing its buttons.
    EditMessage {
        request_id: String,
        chat_id: String,
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inline_keyboard: Option<InlineKeyboard>,
    },

    /// Health check / ping.
    Ping { request_id: String },

    /// Answer a callback query (dismiss loading indicator on button press).
    AnswerCallbackQuery {
        request_id: String,
        callback_query_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Show the text as a modal alert instead of a toast.
        #[serde(default)]
        show_alert: bool,
    },

    /// Request graceful shutdown.
    Shutdown,
}

/// Inline keyboard for interactive buttons in messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboard {
    /// Rows of buttons (each row is a Vec of buttons).
    pub rows: Vec<Vec<InlineButton>>,
}

/// A button in an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    /// Button text displayed to user.
    pub text: String,
    /// Callback data sent when button is pressed.
    pub callback_data: String,
}

impl InlineKeyboard {
    /// Create a single-row keyboard with the given buttons.
    pub fn single_row(buttons: Vec<InlineButton>) -> Self {
        Self {
            rows: vec![buttons],
        }
    }

    /// Iterate over every button, row by row.
    pub fn buttons(&self) -> impl Iterator<Item = &InlineButton> {
        self.rows.iter().flatten()
    }
}

impl InlineButton {
    /// Create a new button.
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Persistent reply keyboard. Pressing a button sends its label as a text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyKeyboard {
    pub rows: Vec<Vec<String>>,
    /// Ask the client to shrink the keyboard to fit its buttons.
    #[serde(default)]
    pub resize: bool,
}

// ============================================================================
// Events (Gateway → scripthost)
// ============================================================================

/// Events sent from a gateway to scripthost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Gateway is ready to receive commands.
    Ready {
        gateway: String,
        version: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    /// Incoming message from a user.
    MessageReceived(Box<MessageReceivedData>),

    /// Callback query from inline keyboard button press.
    CallbackQuery(Box<CallbackQueryData>),

    /// Command completed successfully.
    CommandOk {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Command failed.
    CommandError {
        request_id: String,
        code: String,
        message: String,
    },

    /// Response to Ping command.
    Pong {
        request_id: String,
        uptime_seconds: u64,
        connected: bool,
    },

    /// Gateway-level error (not tied to a specific command).
    Error {
        code: String,
        message: String,
        /// Whether this error is fatal (gateway will shut down).
        #[serde(default)]
        fatal: bool,
    },

    /// Gateway is shutting down.
    Shutdown { reason: String },
}

/// Data for a callback query event (inline keyboard button press).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQueryData {
    /// Unique identifier for this callback query.
    pub callback_query_id: String,
    /// Chat where the callback originated.
    pub chat_id: String,
    /// User who pressed the button.
    pub sender: Sender,
    /// Message ID that contained the inline keyboard.
    pub message_id: String,
    /// Data from the pressed button.
    pub data: String,
}

/// Data for an incoming message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReceivedData {
    pub message_id: String,
    pub chat_id: String,
    pub sender: Sender,
    pub content: MessageContent,
    /// Timestamp when the message was sent (from the platform).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Sender information for incoming messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Content of an incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text message.
    Text { text: String },

    /// Uploaded file. The gateway downloads it before emitting the event.
    Document {
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Base64-encoded file content.
        data: String,
    },

    /// Unknown/unsupported content type.
    Unknown {
        #[serde(default)]
        raw: serde_json::Value,
    },
}

impl MessageContent {
    /// Build a document payload from raw bytes.
    pub fn document(
        file_name: impl Into<String>,
        mime_type: Option<String>,
        bytes: &[u8],
    ) -> Self {
        MessageContent::Document {
            file_name: file_name.into(),
            mime_type,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Extract text content if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Decode the bytes of a document message.
    ///
    /// Returns `None` for non-document content.
    pub fn document_bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            MessageContent::Document { data, .. } => {
                Some(base64::engine::general_purpose::STANDARD.decode(data))
            }
            _ => None,
        }
    }
}

// ============================================================================
// Gateway Capabilities
// ============================================================================

/// Well-known gateway capabilities.
pub mod capabilities {
    /// Gateway supports editing messages.
    pub const EDIT: &str = "edit";
    /// Gateway supports typing indicators.
    pub const TYPING: &str = "typing";
    /// Gateway supports reply-to (threading).
    pub const REPLY: &str = "reply";
    /// Gateway supports inline keyboards for interactive buttons.
    pub const INLINE_KEYBOARD: &str = "inline_keyboard";
    /// Gateway supports persistent reply keyboards.
    pub const REPLY_KEYBOARD: &str = "reply_keyboard";
    /// Gateway forwards uploaded documents.
    pub const DOCUMENTS: &str = "documents";
}

// ============================================================================
// Error Codes
// ============================================================================

/// Well-known error codes for CommandError and Error events.
pub mod error_codes {
    /// Platform API error.
    pub const PLATFORM_ERROR: &str = "platform_error";
    /// Invalid request from scripthost.
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// Uploaded file could not be downloaded.
    pub const DOWNLOAD_FAILED: &str = "download_failed";
}
