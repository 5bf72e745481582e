//! scripthost - run users' uploaded scripts as supervised background processes,
//! driven from a chat bot.

// ============================================================================
// Core Infrastructure
// ============================================================================

pub mod config;
pub mod error;

// ============================================================================
// Domain
// ============================================================================

pub mod host;
pub mod process;
pub mod workspace;

// ============================================================================
// Chat Front End
// ============================================================================

pub mod gateway;

pub use error::{SupervisorError, SupervisorResult};
