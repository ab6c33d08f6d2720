//! IMAP transport for mailsync
//!
//! Defines the seam the sync engine talks to ([`Connector`], [`MailStore`],
//! [`MailboxHandle`]) and two backends: [`ImapConnector`] over async-imap,
//! and [`MemoryServer`], an in-process server.

mod client;
mod error;
mod folder;
mod memory;
mod message;
mod snapshot;
mod transport;

pub use client::{ImapConnector, ImapStream};
pub use error::{ImapError, ImapResult};
pub use folder::{FolderInfo, MessageCountKind, OpenMode, SpecialUse};
pub use memory::{MemoryConnector, MemoryServer};
pub use message::{EmailAddress, HeaderSummary, MessageData, MessageFlags};
pub use snapshot::{MailboxSnapshot, SnapshotDiff};
pub use transport::{
    ConnectionState, Connector, EventBus, FolderEvent, IdleOutcome, MailStore, MailboxHandle,
    Security, ServerEndpoint,
};
