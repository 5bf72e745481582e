//! Action tokens carried in inline button callback data.
//!
//! Format: `<user>::<action>::<parameter>`. The parameter is a file name for
//! `run` and `deleteFile`, and a decimal instance id for `stop`.

use std::fmt;

use thiserror::Error;

pub const DELIMITER: &str = "::";

/// Callback data of the placeholder button shown for an empty list.
pub const NOOP: &str = "noop";

/// Telegram rejects callback data longer than this many bytes.
pub const MAX_CALLBACK_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run { file_name: String },
    Stop { id: u64 },
    DeleteFile { file_name: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Run { .. } => "run",
            Action::Stop { .. } => "stop",
            Action::DeleteFile { .. } => "deleteFile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionToken {
    pub user: String,
    pub action: Action,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("expected 3 fields, found {0}")]
    FieldCount(usize),

    #[error("empty user")]
    EmptyUser,

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("invalid instance id '{0}'")]
    InvalidId(String),

    #[error("empty file name")]
    EmptyFileName,
}

impl ActionToken {
    pub fn run(user: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            action: Action::Run {
                file_name: file_name.into(),
            },
        }
    }

    pub fn stop(user: impl Into<String>, id: u64) -> Self {
        Self {
            user: user.into(),
            action: Action::Stop { id },
        }
    }

    pub fn delete_file(user: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            action: Action::DeleteFile {
                file_name: file_name.into(),
            },
        }
    }

    pub fn parse(data: &str) -> Result<Self, TokenError> {
        let fields: Vec<&str> = data.split(DELIMITER).collect();
        let [user, action, param] = fields[..] else {
            return Err(TokenError::FieldCount(fields.len()));
        };
        if user.is_empty() {
            return Err(TokenError::EmptyUser);
        }

        let action = match action {
            "run" | "deleteFile" if param.is_empty() => return Err(TokenError::EmptyFileName),
            "run" => Action::Run {
                file_name: param.to_string(),
            },
            "deleteFile" => Action::DeleteFile {
                file_name: param.to_string(),
            },
            "stop" => Action::Stop {
                id: param
                    .parse()
                    .map_err(|_| TokenError::InvalidId(param.to_string()))?,
            },
            other => return Err(TokenError::UnknownAction(other.to_string())),
        };

        Ok(Self {
            user: user.to_string(),
            action,
        })
    }
}

impl fmt::Display for ActionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.action.name();
        match &self.action {
            Action::Run { file_name } | Action::DeleteFile { file_name } => {
                write!(f, "{}{DELIMITER}{name}{DELIMITER}{file_name}", self.user)
            }
            Action::Stop { id } => write!(f, "{}{DELIMITER}{name}{DELIMITER}{id}", self.user),
        }
    }
}
