//! Gateway system for chat platform integrations.
//!
//! A gateway bridges one chat platform to scripthost. Built-in gateways are
//! compiled in behind feature flags and talk to the core over Rust channels
//! using the Gateway Protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       scripthost core                        │
//! │                                                              │
//! │  Supervisor ◄── CommandAdapter ◄── GatewayMessageHandler     │
//! │                                           ▲                  │
//! │  ┌────────────────────────────────────────┴───────────────┐  │
//! │  │                    Gateway Manager                     │  │
//! │  │   Routes events to the handler, replies back           │  │
//! │  └────────────────────────┬───────────────────────────────┘  │
//! │                           │ mpsc channels                    │
//! │                ┌──────────┴──────────┐                       │
//! │                │ Telegram (teloxide) │                       │
//! │                └─────────────────────┘                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! - [`GatewayCommand`]: scripthost to gateway (send, edit, answer button presses)
//! - [`GatewayEvent`]: gateway to scripthost (messages, uploads, button presses)

pub mod adapter;
pub mod handler;
pub mod manager;
pub mod token;

// Re-export protocol types from the protocol crate
pub use scripthost_gateway_protocol::{
    CallbackQueryData, GatewayCommand, GatewayEvent, InlineButton, InlineKeyboard,
    MessageContent, MessageReceivedData, ReplyKeyboard, Sender, capabilities, error_codes,
};

pub use adapter::{ActionOutcome, BotStats, CommandAdapter, MenuItem, ScriptListView};
pub use handler::GatewayMessageHandler;
pub use manager::{
    CallbackResponse, GatewayHandle, GatewayManager, MessageHandler, Reply, SendError,
};
pub use token::{Action, ActionToken, TokenError};

// Re-export Telegram gateway from the telegram crate
#[cfg(feature = "gateway-telegram")]
pub use scripthost_gateway_telegram::{TelegramConfig, TelegramGateway};
