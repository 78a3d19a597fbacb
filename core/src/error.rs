/// Error types for feed synchronization
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure or server-side (5xx) error; retried only on explicit user action
    #[error("Transport error: {0}")]
    Transport(String),

    /// Missing or rejected identity; the caller should ask the user to sign in again
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An incoming item could not be matched or ordered
    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Push channel closed")]
    ChannelClosed,
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
