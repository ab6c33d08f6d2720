//! Error types for the core module

use mailsync_imap::{ImapError, SpecialUse};
use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Secret could not be decrypted, or the server rejected the login
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Network failure while connecting or talking to the server
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Folder not found
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// The watch manager was stopped
    #[error("Watch manager has been stopped")]
    ManagerStopped,

    /// Used before `connect`, or after `close`
    #[error("No connection established")]
    NoConnectionEstablished,

    /// Message not found
    #[error("Message not found: UID {0}")]
    MessageNotFound(u32),

    /// Content of an expunged message was requested
    #[error("Message UID {0} has been deleted")]
    MessageDeleted(u32),

    /// The server did not supply a UID for the message
    #[error("Message UID is unavailable")]
    UidUnavailable,

    /// A message could not be turned into an envelope
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Special-use map rejected an entry
    #[error("Invalid special-use mapping for {role:?}: {reason}")]
    InvalidSpecialUse { role: SpecialUse, reason: String },

    /// IMAP error
    #[error("IMAP error: {0}")]
    ImapError(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ImapError> for CoreError {
    fn from(e: ImapError) -> Self {
        match e {
            ImapError::AuthenticationFailed(msg) => CoreError::InvalidCredentials(msg),
            ImapError::ConnectionFailed(msg) | ImapError::TlsError(msg) => {
                CoreError::ConnectionFailed(msg)
            }
            ImapError::IoError(io) => CoreError::ConnectionFailed(io.to_string()),
            ImapError::FolderNotFound(path) => CoreError::FolderNotFound(path),
            ImapError::MessageNotFound(uid) => CoreError::MessageNotFound(uid),
            other => CoreError::ImapError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imap_error_mapping() {
        assert!(matches!(
            CoreError::from(ImapError::AuthenticationFailed("no".into())),
            CoreError::InvalidCredentials(_)
        ));
        assert!(matches!(
            CoreError::from(ImapError::TlsError("handshake".into())),
            CoreError::ConnectionFailed(_)
        ));
        assert!(matches!(
            CoreError::from(ImapError::FolderNotFound("Trash".into())),
            CoreError::FolderNotFound(p) if p == "Trash"
        ));
        assert!(matches!(
            CoreError::from(ImapError::ReadOnly("INBOX".into())),
            CoreError::ImapError(_)
        ));
    }
}
