//! Mailbox synchronization engine for mailsync
//!
//! Opens authenticated IMAP sessions, caches folders per account, reads
//! messages and pushes change notifications to subscribers, using IDLE where
//! the server supports it and polling otherwise.

mod account;
mod config;
pub mod content;
mod envelope;
mod error;
mod folder;
mod mail_account;
mod message;
mod notifier;
mod scheduler;
mod session;
mod special_use;
mod watch;

pub use account::{Account, INBOX};
pub use config::{AccountConfig, ConnectionProperties, Protocol, SyncConfig};
pub use envelope::Envelope;
pub use error::{CoreError, CoreResult};
pub use folder::{Folder, HandleState, Transition};
pub use mail_account::MailAccount;
pub use message::{Message, PREVIEW_BYTES};
pub use notifier::{FolderChangeNotifier, FolderListener};
pub use scheduler::{PeriodicTask, Scheduler, TaskHandle, TokioScheduler};
pub use session::{AccountContext, DecryptError, SecretDecryptor, SessionEstablisher};
pub use special_use::{provider_defaults, SpecialUseMap};
pub use watch::{WatchManager, WatchMode};

/// Re-export transport types for convenience
pub use mailsync_imap::{MessageCountKind, OpenMode, SpecialUse};
