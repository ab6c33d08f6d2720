//! Error types for IMAP operations

use thiserror::Error;

/// Result type for IMAP operations
pub type ImapResult<T> = Result<T, ImapError>;

/// Errors that can occur during IMAP operations
#[derive(Debug, Error)]
pub enum ImapError {
    /// Connection failed
    #[error("Failed to connect to IMAP server: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("IMAP authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server returned an error
    #[error("IMAP server error: {0}")]
    ServerError(String),

    /// Folder not found
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// Message not found
    #[error("Message not found: UID {0}")]
    MessageNotFound(u32),

    /// Parse error
    #[error("Failed to parse IMAP response: {0}")]
    ParseError(String),

    /// TLS error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Mailbox is not open, or the session is gone
    #[error("IMAP session is not connected")]
    NotConnected,

    /// A write was attempted on a mailbox opened read-only
    #[error("Mailbox {0} is open read-only")]
    ReadOnly(String),

    /// The server does not advertise IDLE
    #[error("IDLE is not supported by the server")]
    IdleNotSupported,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl ImapError {
    /// Whether the underlying connection should be considered lost
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ImapError::ConnectionFailed(_) | ImapError::IoError(_) | ImapError::TlsError(_)
        )
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(e: async_imap::error::Error) -> Self {
        match e {
            async_imap::error::Error::Io(io) => ImapError::IoError(io),
            async_imap::error::Error::ConnectionLost => {
                ImapError::ConnectionFailed("connection lost".to_string())
            }
            async_imap::error::Error::Parse(p) => ImapError::ParseError(p.to_string()),
            other => ImapError::ServerError(other.to_string()),
        }
    }
}
