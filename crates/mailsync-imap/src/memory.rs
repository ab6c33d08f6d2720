//! In-process IMAP server
//!
//! Speaks the [`Connector`]/[`MailStore`]/[`MailboxHandle`] seam directly, with
//! the same observable behaviour as a network server: per-handle sessions,
//! SELECT/EXAMINE modes, `\Seen` on non-peek fetches, IDLE wakeups and
//! dropped connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{ImapError, ImapResult};
use crate::folder::{FolderInfo, MessageCountKind, OpenMode};
use crate::message::{HeaderSummary, MessageData, MessageFlags};
use crate::snapshot::MailboxSnapshot;
use crate::transport::{
    ConnectionState, Connector, EventBus, FolderEvent, IdleOutcome, MailStore, MailboxHandle,
    ServerEndpoint,
};

const DELIMITER: char = '/';

struct StoredMessage {
    raw: Vec<u8>,
    flags: MessageFlags,
    received_at: DateTime<Utc>,
}

struct Mailbox {
    attributes: Vec<String>,
    uid_next: u32,
    messages: BTreeMap<u32, StoredMessage>,
    version: watch::Sender<u64>,
}

impl Mailbox {
    fn new(attributes: Vec<String>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            attributes,
            uid_next: 1,
            messages: BTreeMap::new(),
            version,
        }
    }

    fn touch(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn append(&mut self, raw: Vec<u8>, flags: MessageFlags) -> u32 {
        let uid = self.uid_next;
        self.uid_next += 1;
        self.messages.insert(
            uid,
            StoredMessage {
                raw,
                flags,
                received_at: Utc::now(),
            },
        );
        self.touch();
        uid
    }

    fn snapshot(&self) -> MailboxSnapshot {
        let mut snapshot = MailboxSnapshot::new();
        for (uid, message) in &self.messages {
            snapshot.insert(*uid, message.flags.clone(), None);
        }
        snapshot
    }

    fn expunge(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, m| !m.flags.deleted);
        let removed = before - self.messages.len();
        if removed > 0 {
            self.touch();
        }
        removed
    }
}

fn message_data(path: &str, uid: u32, message: &StoredMessage) -> MessageData {
    MessageData::new(
        uid,
        path,
        message.flags.clone(),
        Some(message.received_at),
        HeaderSummary::parse(&message.raw),
    )
}

/// Offset of the first body byte, just past the blank line ending the header
fn header_end(raw: &[u8]) -> usize {
    [&b"\r\n\r\n"[..], &b"\n\n"[..]]
        .iter()
        .filter_map(|separator| {
            raw.windows(separator.len())
                .position(|w| w == *separator)
                .map(|at| at + separator.len())
        })
        .min()
        .unwrap_or(raw.len())
}

struct ServerState {
    users: HashMap<String, String>,
    mailboxes: BTreeMap<String, Mailbox>,
    idle_supported: bool,
    online: bool,
    /// Bumped to drop every open connection
    generation: u64,
}

struct ServerInner {
    state: Mutex<ServerState>,
    connection_attempts: AtomicUsize,
}

/// An IMAP server living in this process
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// A server with IDLE support and an empty INBOX
    pub fn new() -> Self {
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert("INBOX".to_string(), Mailbox::new(Vec::new()));

        Self {
            inner: Arc::new(ServerInner {
                state: Mutex::new(ServerState {
                    users: HashMap::new(),
                    mailboxes,
                    idle_supported: true,
                    online: true,
                    generation: 0,
                }),
                connection_attempts: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, login: &str, password: &str) {
        self.state()
            .users
            .insert(login.to_string(), password.to_string());
    }

    pub fn set_idle_supported(&self, supported: bool) {
        self.state().idle_supported = supported;
    }

    /// Refuse (or accept again) new connections
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Create a mailbox with LIST attributes such as `\Trash`
    pub fn create_mailbox(&self, path: &str, attributes: &[&str]) {
        let attributes = attributes.iter().map(|a| a.to_string()).collect();
        self.state()
            .mailboxes
            .entry(path.to_string())
            .or_insert_with(|| Mailbox::new(attributes));
    }

    /// Store a message with the given flags, returning its UID
    pub fn append(&self, path: &str, raw: impl Into<Vec<u8>>, flags: MessageFlags) -> ImapResult<u32> {
        let mut state = self.state();
        let mailbox = state
            .mailboxes
            .get_mut(path)
            .ok_or_else(|| ImapError::FolderNotFound(path.to_string()))?;
        Ok(mailbox.append(raw.into(), flags))
    }

    /// New mail arriving: stored with `\Recent`
    pub fn deliver(&self, path: &str, raw: impl Into<Vec<u8>>) -> ImapResult<u32> {
        let flags = MessageFlags {
            recent: true,
            ..MessageFlags::default()
        };
        self.append(path, raw, flags)
    }

    /// Replace the flags of a message, as another client would
    pub fn set_flags(&self, path: &str, uid: u32, flags: MessageFlags) -> ImapResult<()> {
        let mut state = self.state();
        let mailbox = state
            .mailboxes
            .get_mut(path)
            .ok_or_else(|| ImapError::FolderNotFound(path.to_string()))?;
        let message = mailbox
            .messages
            .get_mut(&uid)
            .ok_or(ImapError::MessageNotFound(uid))?;
        message.flags = flags;
        mailbox.touch();
        Ok(())
    }

    /// Remove a message outright, as another client's expunge would
    pub fn remove(&self, path: &str, uid: u32) -> ImapResult<()> {
        let mut state = self.state();
        let mailbox = state
            .mailboxes
            .get_mut(path)
            .ok_or_else(|| ImapError::FolderNotFound(path.to_string()))?;
        mailbox
            .messages
            .remove(&uid)
            .ok_or(ImapError::MessageNotFound(uid))?;
        mailbox.touch();
        Ok(())
    }

    pub fn flags(&self, path: &str, uid: u32) -> Option<MessageFlags> {
        let state = self.state();
        Some(state.mailboxes.get(path)?.messages.get(&uid)?.flags.clone())
    }

    /// Messages currently stored in `path`
    pub fn message_count(&self, path: &str) -> usize {
        self.state()
            .mailboxes
            .get(path)
            .map(|m| m.messages.len())
            .unwrap_or(0)
    }

    pub fn uids(&self, path: &str) -> Vec<u32> {
        self.state()
            .mailboxes
            .get(path)
            .map(|m| m.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections opened, logins included
    pub fn connection_attempts(&self) -> usize {
        self.inner.connection_attempts.load(Ordering::SeqCst)
    }

    /// Sever every open connection. Handles notice on their next command
    /// and IDLE waits wake up.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        state.generation += 1;
        for mailbox in state.mailboxes.values() {
            mailbox.touch();
        }
        info!("Dropped all connections (generation {})", state.generation);
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// Log in, returning the connection generation
    fn login(&self, login: &str, password: &str) -> ImapResult<u64> {
        self.inner.connection_attempts.fetch_add(1, Ordering::SeqCst);

        let state = self.state();
        if !state.online {
            return Err(ImapError::ConnectionFailed("server unreachable".to_string()));
        }
        match state.users.get(login) {
            Some(expected) if expected == password => Ok(state.generation),
            _ => Err(ImapError::AuthenticationFailed(format!(
                "LOGIN rejected for {}",
                login
            ))),
        }
    }
}

/// [`Connector`] for a [`MemoryServer`]; the endpoint is ignored
#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        login: &str,
        password: &str,
    ) -> ImapResult<Arc<dyn MailStore>> {
        debug!("Connecting to in-process server as {}", endpoint.host);
        self.server.login(login, password)?;

        Ok(Arc::new(MemoryStore {
            server: self.server.clone(),
            login: login.to_string(),
            password: password.to_string(),
            connected: AtomicBool::new(true),
        }))
    }
}

struct MemoryStore {
    server: MemoryServer,
    login: String,
    password: String,
    connected: AtomicBool,
}

#[async_trait]
impl MailStore for MemoryStore {
    fn mailbox(&self, path: &str) -> Arc<dyn MailboxHandle> {
        Arc::new(MemoryMailbox {
            server: self.server.clone(),
            path: path.to_string(),
            login: self.login.clone(),
            password: self.password.clone(),
            events: EventBus::new(),
            session: tokio::sync::Mutex::new(Session::default()),
        })
    }

    async fn list_folders(&self) -> ImapResult<Vec<FolderInfo>> {
        if !self.is_connected() {
            return Err(ImapError::NotConnected);
        }
        let state = self.server.state();
        Ok(state
            .mailboxes
            .iter()
            .map(|(path, mailbox)| {
                FolderInfo::new(path.as_str(), Some(DELIMITER), mailbox.attributes.clone())
            })
            .collect())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> ImapResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Session {
    mode: Option<OpenMode>,
    generation: Option<u64>,
    snapshot: MailboxSnapshot,
    version: Option<watch::Receiver<u64>>,
    seen_version: u64,
}

struct MemoryMailbox {
    server: MemoryServer,
    path: String,
    login: String,
    password: String,
    events: EventBus,
    session: tokio::sync::Mutex<Session>,
}

impl MemoryMailbox {
    fn emit(&self, event: FolderEvent) {
        self.events.send(event);
    }

    /// Select, logging in first unless the session's connection is live
    fn select(&self, session: &mut Session, mode: OpenMode) -> ImapResult<()> {
        let current = self.server.state().generation;
        if session.generation != Some(current) {
            session.generation = Some(self.server.login(&self.login, &self.password)?);
        }

        let state = self.server.state();
        let mailbox = state
            .mailboxes
            .get(&self.path)
            .ok_or_else(|| ImapError::FolderNotFound(self.path.clone()))?;

        let version = mailbox.version.subscribe();
        session.seen_version = *version.borrow();
        session.version = Some(version);
        session.snapshot = mailbox.snapshot();
        session.mode = Some(mode);

        debug!(
            "Opened {} ({:?}) with {} messages",
            self.path,
            mode,
            mailbox.messages.len()
        );
        Ok(())
    }

    /// Detect a dropped connection and reconnect when a mode is remembered
    fn ensure_connected(&self, session: &mut Session) -> ImapResult<()> {
        let current = self.server.state().generation;
        match session.generation {
            Some(generation) if generation == current => return Ok(()),
            Some(_) => {
                warn!("Connection for {} lost", self.path);
                session.generation = None;
                self.emit(FolderEvent::Connection(ConnectionState::Disconnected));
            }
            None => {}
        }

        let mode = session.mode.ok_or(ImapError::NotConnected)?;
        info!("Reconnecting {} ({:?})", self.path, mode);

        let previous = std::mem::take(&mut session.snapshot);
        self.select(session, mode)?;
        self.emit(FolderEvent::Connection(ConnectionState::Opened));

        // Catch up with what happened while disconnected
        let mut next = std::mem::replace(&mut session.snapshot, previous);
        self.apply_diff(session, &mut next);
        Ok(())
    }

    fn require_writable(&self, session: &Session) -> ImapResult<()> {
        match session.mode {
            Some(OpenMode::ReadWrite) => Ok(()),
            Some(OpenMode::ReadOnly) => Err(ImapError::ReadOnly(self.path.clone())),
            None => Err(ImapError::NotConnected),
        }
    }

    fn refresh_locked(&self, session: &mut Session) {
        if let Some(version) = &session.version {
            session.seen_version = *version.borrow();
        }
        let mut next = {
            let state = self.server.state();
            match state.mailboxes.get(&self.path) {
                Some(mailbox) => mailbox.snapshot(),
                None => MailboxSnapshot::new(),
            }
        };
        self.apply_diff(session, &mut next);
    }

    /// Replace the session snapshot with `next`, emitting the difference
    fn apply_diff(&self, session: &mut Session, next: &mut MailboxSnapshot) {
        let diff = session.snapshot.diff(next);

        let (added, changed) = {
            let state = self.server.state();
            let stored = state.mailboxes.get(&self.path);
            let lookup = |uid: &u32| {
                stored
                    .and_then(|m| m.messages.get(uid))
                    .map(|m| message_data(&self.path, *uid, m))
            };
            let added: Vec<MessageData> = diff.added.iter().filter_map(lookup).collect();
            let changed: Vec<MessageData> = diff.changed.iter().filter_map(lookup).collect();
            (added, changed)
        };

        for message in added.iter().chain(changed.iter()) {
            if let Some(uid) = message.uid {
                next.set_message_id(uid, message.message_id.clone());
            }
        }
        session.snapshot = std::mem::take(next);

        if !diff.removed.is_empty() {
            let removed = diff
                .removed
                .into_iter()
                .map(|(uid, message_id)| MessageData::expunged(uid, message_id, self.path.as_str()))
                .collect();
            self.emit(FolderEvent::MessagesRemoved(removed));
        }
        if !added.is_empty() {
            self.emit(FolderEvent::MessagesAdded(added));
        }
        for message in changed {
            self.emit(FolderEvent::MessageChanged(message));
        }
    }
}

#[async_trait]
impl MailboxHandle for MemoryMailbox {
    fn path(&self) -> &str {
        &self.path
    }

    fn events(&self) -> mpsc::UnboundedReceiver<FolderEvent> {
        self.events.subscribe()
    }

    async fn open(&self, mode: OpenMode) -> ImapResult<()> {
        let mut session = self.session.lock().await;

        let current = self.server.state().generation;
        let connected = session.generation == Some(current);
        if connected && session.mode == Some(mode) {
            return Ok(());
        }

        self.select(&mut session, mode)?;
        if !connected {
            self.emit(FolderEvent::Connection(ConnectionState::Opened));
        }
        Ok(())
    }

    async fn close(&self, expunge: bool) -> ImapResult<()> {
        let mut session = self.session.lock().await;

        let mode = session.mode;
        let was_open = session.generation.is_some();
        *session = Session::default();
        if !was_open {
            return Ok(());
        }

        if expunge && mode == Some(OpenMode::ReadWrite) {
            let mut state = self.server.state();
            if let Some(mailbox) = state.mailboxes.get_mut(&self.path) {
                let removed = mailbox.expunge();
                debug!("CLOSE on {} expunged {} messages", self.path, removed);
            }
        }

        debug!("Closed {}", self.path);
        self.emit(FolderEvent::Connection(ConnectionState::Closed));
        Ok(())
    }

    async fn unselect(&self, expunge: bool) -> ImapResult<()> {
        let mut session = self.session.lock().await;

        let mode = session.mode.take();
        session.version = None;
        session.snapshot = MailboxSnapshot::new();
        let current = self.server.state().generation;
        if session.generation != Some(current) {
            return Ok(());
        }

        if expunge && mode == Some(OpenMode::ReadWrite) {
            let mut state = self.server.state();
            if let Some(mailbox) = state.mailboxes.get_mut(&self.path) {
                let removed = mailbox.expunge();
                debug!("CLOSE on {} expunged {} messages", self.path, removed);
            }
        }

        debug!("Unselected {}", self.path);
        Ok(())
    }

    async fn message_count(&self, kind: MessageCountKind) -> ImapResult<u32> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;
        self.refresh_locked(&mut session);
        Ok(session.snapshot.count(kind))
    }

    async fn messages(&self) -> ImapResult<Vec<MessageData>> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;

        let state = self.server.state();
        let mailbox = state
            .mailboxes
            .get(&self.path)
            .ok_or_else(|| ImapError::FolderNotFound(self.path.clone()))?;
        Ok(mailbox
            .messages
            .iter()
            .map(|(uid, m)| message_data(&self.path, *uid, m))
            .collect())
    }

    async fn message(&self, uid: u32) -> ImapResult<Option<MessageData>> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;

        let state = self.server.state();
        Ok(state
            .mailboxes
            .get(&self.path)
            .and_then(|m| m.messages.get(&uid))
            .map(|m| message_data(&self.path, uid, m)))
    }

    async fn fetch_body(&self, uid: u32, peek: bool) -> ImapResult<Vec<u8>> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;
        let writable = session.mode == Some(OpenMode::ReadWrite);

        let mut state = self.server.state();
        let mailbox = state
            .mailboxes
            .get_mut(&self.path)
            .ok_or_else(|| ImapError::FolderNotFound(self.path.clone()))?;
        let message = mailbox
            .messages
            .get_mut(&uid)
            .ok_or(ImapError::MessageNotFound(uid))?;

        let raw = message.raw.clone();
        if !peek && writable && !message.flags.seen {
            message.flags.seen = true;
            mailbox.touch();
        }
        Ok(raw)
    }

    async fn fetch_preview(&self, uid: u32, max_bytes: usize) -> ImapResult<Vec<u8>> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;

        let state = self.server.state();
        let raw = &state
            .mailboxes
            .get(&self.path)
            .ok_or_else(|| ImapError::FolderNotFound(self.path.clone()))?
            .messages
            .get(&uid)
            .ok_or(ImapError::MessageNotFound(uid))?
            .raw;

        let body_start = header_end(raw);
        let end = raw.len().min(body_start.saturating_add(max_bytes));
        Ok(raw[..end].to_vec())
    }

    async fn copy_messages(&self, uids: &[u32], destination: &str) -> ImapResult<()> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;

        let mut state = self.server.state();
        let copies: Vec<(Vec<u8>, MessageFlags)> = {
            let source = state
                .mailboxes
                .get(&self.path)
                .ok_or_else(|| ImapError::FolderNotFound(self.path.clone()))?;
            uids.iter()
                .filter_map(|uid| source.messages.get(uid))
                .map(|m| {
                    let mut flags = m.flags.clone();
                    flags.recent = true;
                    (m.raw.clone(), flags)
                })
                .collect()
        };

        let target = state
            .mailboxes
            .get_mut(destination)
            .ok_or_else(|| ImapError::FolderNotFound(destination.to_string()))?;
        let count = copies.len();
        for (raw, flags) in copies {
            target.append(raw, flags);
        }

        debug!("Copied {} messages from {} to {}", count, self.path, destination);
        Ok(())
    }

    async fn mark_deleted(&self, uid: u32) -> ImapResult<()> {
        let mut session = self.session.lock().await;
        self.require_writable(&session)?;
        self.ensure_connected(&mut session)?;

        let mut state = self.server.state();
        let mailbox = state
            .mailboxes
            .get_mut(&self.path)
            .ok_or_else(|| ImapError::FolderNotFound(self.path.clone()))?;
        let message = mailbox
            .messages
            .get_mut(&uid)
            .ok_or(ImapError::MessageNotFound(uid))?;
        message.flags.deleted = true;
        mailbox.touch();
        Ok(())
    }

    async fn expunge(&self) -> ImapResult<()> {
        let mut session = self.session.lock().await;
        self.require_writable(&session)?;
        self.ensure_connected(&mut session)?;

        {
            let mut state = self.server.state();
            if let Some(mailbox) = state.mailboxes.get_mut(&self.path) {
                let removed = mailbox.expunge();
                debug!("Expunged {} messages from {}", removed, self.path);
            }
        }

        self.refresh_locked(&mut session);
        Ok(())
    }

    async fn begin_idle(&self) -> ImapResult<()> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;

        let idle_supported = self.server.state().idle_supported;
        if idle_supported {
            Ok(())
        } else {
            Err(ImapError::IdleNotSupported)
        }
    }

    async fn wait_idle(&self, timeout: Duration, stop: Arc<Notify>) -> ImapResult<IdleOutcome> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;
        let idle_supported = self.server.state().idle_supported;
        if !idle_supported {
            return Err(ImapError::IdleNotSupported);
        }

        let mut version = session.version.clone().ok_or(ImapError::NotConnected)?;
        if *version.borrow_and_update() != session.seen_version {
            return Ok(IdleOutcome::NewData);
        }

        let outcome = tokio::select! {
            changed = version.changed() => match changed {
                Ok(()) => IdleOutcome::NewData,
                Err(_) => return Err(ImapError::ConnectionFailed("mailbox went away".to_string())),
            },
            _ = tokio::time::sleep(timeout) => IdleOutcome::Timeout,
            _ = stop.notified() => IdleOutcome::Interrupted,
        };

        debug!("IDLE on {} ended: {:?}", self.path, outcome);
        Ok(outcome)
    }

    async fn refresh(&self) -> ImapResult<()> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session)?;
        self.refresh_locked(&mut session);
        Ok(())
    }
}
