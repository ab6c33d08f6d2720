//! Transport seam between the sync engine and an IMAP backend
//!
//! A [`Connector`] authenticates and yields a [`MailStore`], the long-lived
//! account session. Each [`MailboxHandle`] obtained from the store owns its
//! own connection to one mailbox, so a handle parked in IDLE never blocks
//! the others.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::error::ImapResult;
use crate::folder::{FolderInfo, MessageCountKind, OpenMode};
use crate::message::MessageData;

/// How the connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// Implicit TLS (imaps, usually port 993)
    Tls,
    /// Plain connection upgraded with STARTTLS when the server offers it
    StartTls,
    /// No encryption
    Plain,
}

/// Where and how to reach the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub security: Security,
    /// Skip certificate verification
    pub accept_invalid_certs: bool,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, security: Security) -> Self {
        Self {
            host: host.into(),
            port,
            security,
            accept_invalid_certs: false,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle of a mailbox handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opened,
    Closed,
    /// The connection dropped without a close
    Disconnected,
}

/// Change observed on a mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEvent {
    MessagesAdded(Vec<MessageData>),
    /// Removed messages, as [`MessageData::expunged`] values
    MessagesRemoved(Vec<MessageData>),
    MessageChanged(MessageData),
    Connection(ConnectionState),
}

/// Fan-out of a handle's events to every subscriber
///
/// Each subscriber gets its own unbounded queue, so a burst of changes from
/// one refresh is never dropped while a slow listener catches up.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<FolderEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FolderEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    /// Deliver `event` to every live subscriber, forgetting dropped ones
    pub fn send(&self, event: FolderEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Result of one IDLE wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server pushed something; call [`MailboxHandle::refresh`]
    NewData,
    /// The wait ran for the full keepalive period
    Timeout,
    /// The stop signal fired
    Interrupted,
}

/// Opens authenticated sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        login: &str,
        password: &str,
    ) -> ImapResult<Arc<dyn MailStore>>;
}

/// An authenticated account session
#[async_trait]
pub trait MailStore: Send + Sync {
    /// A new, unopened handle on `path`; no network traffic
    fn mailbox(&self, path: &str) -> Arc<dyn MailboxHandle>;

    /// All folders of the default namespace
    async fn list_folders(&self) -> ImapResult<Vec<FolderInfo>>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> ImapResult<()>;
}

/// One mailbox on its own connection
#[async_trait]
pub trait MailboxHandle: Send + Sync {
    fn path(&self) -> &str;

    /// Subscribe to changes detected by [`refresh`](Self::refresh) and by
    /// writes made through this handle
    fn events(&self) -> mpsc::UnboundedReceiver<FolderEvent>;

    /// SELECT (read-write) or EXAMINE (read-only). Reopens when the mode
    /// differs from the current one.
    async fn open(&self, mode: OpenMode) -> ImapResult<()>;

    /// Close the mailbox and its connection. With `expunge`, messages
    /// flagged deleted are removed (CLOSE); otherwise UNSELECT semantics.
    async fn close(&self, expunge: bool) -> ImapResult<()>;

    /// Leave the selected mailbox but keep the connection for the next
    /// [`open`](Self::open). With `expunge`, a read-write mailbox drops its
    /// messages flagged deleted.
    async fn unselect(&self, expunge: bool) -> ImapResult<()>;

    /// Refresh and count
    async fn message_count(&self, kind: MessageCountKind) -> ImapResult<u32>;

    /// Metadata of every message
    async fn messages(&self) -> ImapResult<Vec<MessageData>>;

    async fn message(&self, uid: u32) -> ImapResult<Option<MessageData>>;

    /// Full RFC 822 source. `peek` never sets `\Seen`.
    async fn fetch_body(&self, uid: u32, peek: bool) -> ImapResult<Vec<u8>>;

    /// Header plus at most `max_bytes` of the body, never setting `\Seen`
    async fn fetch_preview(&self, uid: u32, max_bytes: usize) -> ImapResult<Vec<u8>>;

    async fn copy_messages(&self, uids: &[u32], destination: &str) -> ImapResult<()>;

    async fn mark_deleted(&self, uid: u32) -> ImapResult<()>;

    async fn expunge(&self) -> ImapResult<()>;

    /// Check that the mailbox can be pushed to; fails with
    /// [`ImapError::IdleNotSupported`](crate::ImapError::IdleNotSupported)
    async fn begin_idle(&self) -> ImapResult<()>;

    /// Block in IDLE until the server pushes, `timeout` elapses, or `stop`
    /// is notified
    async fn wait_idle(&self, timeout: Duration, stop: Arc<Notify>) -> ImapResult<IdleOutcome>;

    /// NOOP and diff against the last known state, emitting events
    async fn refresh(&self) -> ImapResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus_keeps_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        for _ in 0..500 {
            bus.send(FolderEvent::Connection(ConnectionState::Opened));
        }

        let mut received = 0;
        while first.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 500);
        assert!(second.try_recv().is_ok());
    }

    #[test]
    fn test_event_bus_forgets_dropped_subscribers() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.send(FolderEvent::Connection(ConnectionState::Closed));
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
        bus.send(FolderEvent::Connection(ConnectionState::Closed));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
