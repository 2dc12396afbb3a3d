//! Synchronization error types

use thiserror::Error;

/// Result alias used across the crate
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Unauthorized: server closed the channel with code {code}")]
    Auth { code: u16 },

    #[error("Reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Fetch failed for {key}: {message}")]
    Fetch { key: String, message: String },

    #[error("Invalid endpoint URL: {details}")]
    InvalidUrl { details: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried automatically, never interrupts the caller
    Transient,
    /// Needs the caller to act (re-login, manual reconnect)
    Terminal,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } | Self::ReconnectExhausted { .. } => ErrorKind::Terminal,
            _ => ErrorKind::Transient,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Terminal)
    }

    pub(crate) fn fetch(key: &str, err: &anyhow::Error) -> Self {
        Self::Fetch {
            key: key.to_string(),
            message: format!("{:#}", err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl {
            details: err.to_string(),
        }
    }
}
