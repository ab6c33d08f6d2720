//! IMAP client implementation on top of async-imap

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::{Client, Session};
use async_native_tls::TlsStream;
use async_std::net::TcpStream;
use async_trait::async_trait;
use chrono::Utc;
use futures::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use futures::TryStreamExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{ImapError, ImapResult};
use crate::folder::{FolderInfo, MessageCountKind, OpenMode};
use crate::message::{HeaderSummary, MessageData, MessageFlags};
use crate::snapshot::MailboxSnapshot;
use crate::transport::{
    ConnectionState, Connector, EventBus, FolderEvent, IdleOutcome, MailStore, MailboxHandle,
    Security, ServerEndpoint,
};

/// Items fetched for every message the engine reports
const METADATA_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER])";

/// Longest UID set sent in one command; servers cap command lines at 8 KB
/// and up
const MAX_UID_SET_LEN: usize = 4000;

/// Socket under an IMAP session, with or without TLS
pub enum ImapStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_close(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImapStream::Plain(_) => write!(f, "ImapStream::Plain"),
            ImapStream::Tls(_) => write!(f, "ImapStream::Tls"),
        }
    }
}

type ImapSession = Session<ImapStream>;

#[derive(Clone)]
struct Credentials {
    login: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

async fn tls_wrap(endpoint: &ServerEndpoint, tcp: TcpStream) -> ImapResult<TlsStream<TcpStream>> {
    let tls_stream = async_native_tls::TlsConnector::new()
        .danger_accept_invalid_certs(endpoint.accept_invalid_certs)
        .connect(&endpoint.host, tcp)
        .await
        .map_err(|e| ImapError::TlsError(e.to_string()))?;

    debug!("TLS connection established");
    Ok(tls_stream)
}

/// Read lines until the tagged completion for `tag`
async fn read_tagged<R: AsyncBufRead + Unpin>(reader: &mut R, tag: &str) -> ImapResult<String> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ImapError::ConnectionFailed(
                "connection closed during STARTTLS".to_string(),
            ));
        }
        if line.starts_with(tag) {
            return Ok(line);
        }
    }
}

/// Upgrade a fresh connection with STARTTLS. A server that refuses keeps the
/// plaintext connection.
async fn starttls(endpoint: &ServerEndpoint, mut tcp: TcpStream) -> ImapResult<ImapStream> {
    let accepted = {
        let mut reader = BufReader::new(&mut tcp);

        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        if !greeting.starts_with("* OK") {
            return Err(ImapError::ConnectionFailed(format!(
                "Unexpected server greeting: {}",
                greeting.trim_end()
            )));
        }

        reader.get_mut().write_all(b"s1 STARTTLS\r\n").await?;
        let response = read_tagged(&mut reader, "s1 ").await?;
        response.starts_with("s1 OK")
    };

    if accepted {
        Ok(ImapStream::Tls(tls_wrap(endpoint, tcp).await?))
    } else {
        warn!(
            "{} refused STARTTLS, continuing without encryption",
            endpoint.host
        );
        Ok(ImapStream::Plain(tcp))
    }
}

async fn open_session(endpoint: &ServerEndpoint, credentials: &Credentials) -> ImapResult<ImapSession> {
    info!("Connecting to {}:{}", endpoint.host, endpoint.port);

    let tcp_stream = TcpStream::connect(endpoint.address())
        .await
        .map_err(|e| ImapError::ConnectionFailed(e.to_string()))?;

    let stream = match endpoint.security {
        Security::Tls => ImapStream::Tls(tls_wrap(endpoint, tcp_stream).await?),
        Security::StartTls => starttls(endpoint, tcp_stream).await?,
        Security::Plain => ImapStream::Plain(tcp_stream),
    };

    let client = Client::new(stream);

    info!("Authenticating with LOGIN for {}", credentials.login);

    let session = client
        .login(&credentials.login, &credentials.password)
        .await
        .map_err(|(e, _)| match ImapError::from(e) {
            err if err.is_disconnect() => err,
            err => ImapError::AuthenticationFailed(err.to_string()),
        })?;

    info!("LOGIN authentication successful");
    Ok(session)
}

/// async-imap prints `Extension("\\HasNoChildren")` for attributes it has
/// no variant for
fn attribute_name(debug: String) -> String {
    match debug
        .strip_prefix("Extension(\"")
        .and_then(|s| s.strip_suffix("\")"))
    {
        Some(inner) => inner.replace("\\\\", "\\"),
        None => debug,
    }
}

/// UID sets covering `uids`, runs compressed to ranges (`1:5,9`) and split
/// so no set is longer than [`MAX_UID_SET_LEN`]
fn uid_sets(uids: &[u32]) -> Vec<String> {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for uid in sorted {
        match ranges.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(uid) => *end = uid,
            _ => ranges.push((uid, uid)),
        }
    }

    let mut sets = Vec::new();
    let mut current = String::new();
    for (start, end) in ranges {
        let range = if start == end {
            start.to_string()
        } else {
            format!("{}:{}", start, end)
        };
        if !current.is_empty() && current.len() + 1 + range.len() > MAX_UID_SET_LEN {
            sets.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(&range);
    }
    if !current.is_empty() {
        sets.push(current);
    }
    sets
}

async fn load_snapshot(session: &mut ImapSession) -> ImapResult<MailboxSnapshot> {
    let mut snapshot = MailboxSnapshot::new();

    let uids = session.uid_search("ALL").await?;
    if uids.is_empty() {
        return Ok(snapshot);
    }

    let mut stream = session.uid_fetch("1:*", "(UID FLAGS)").await?;
    while let Some(fetch) = stream.try_next().await? {
        if let Some(uid) = fetch.uid {
            snapshot.insert(uid, MessageFlags::from_fetch(fetch.flags()), None);
        }
    }

    Ok(snapshot)
}

async fn fetch_metadata_set(
    session: &mut ImapSession,
    path: &str,
    set: &str,
    messages: &mut Vec<MessageData>,
) -> ImapResult<()> {
    let mut stream = session.uid_fetch(set, METADATA_QUERY).await?;
    while let Some(fetch) = stream.try_next().await? {
        let Some(uid) = fetch.uid else {
            warn!("FETCH response in {} without UID, skipping", path);
            continue;
        };

        let flags = MessageFlags::from_fetch(fetch.flags());
        let received_at = fetch.internal_date().map(|d| d.with_timezone(&Utc));
        let headers = fetch.header().and_then(HeaderSummary::parse);
        messages.push(MessageData::new(uid, path, flags, received_at, headers));
    }
    Ok(())
}

async fn fetch_metadata(
    session: &mut ImapSession,
    path: &str,
    uids: &[u32],
) -> ImapResult<Vec<MessageData>> {
    let mut messages = Vec::new();
    for set in uid_sets(uids) {
        fetch_metadata_set(session, path, &set, &mut messages).await?;
    }

    debug!("Fetched metadata for {} messages in {}", messages.len(), path);
    Ok(messages)
}

/// Metadata of the whole mailbox in one `1:*` fetch
async fn fetch_all_metadata(session: &mut ImapSession, path: &str) -> ImapResult<Vec<MessageData>> {
    let mut messages = Vec::new();
    if session.uid_search("ALL").await?.is_empty() {
        return Ok(messages);
    }

    fetch_metadata_set(session, path, "1:*", &mut messages).await?;
    messages.sort_by_key(|m| m.uid);

    debug!("Fetched metadata for {} messages in {}", messages.len(), path);
    Ok(messages)
}

async fn fetch_raw(session: &mut ImapSession, uid: u32, peek: bool) -> ImapResult<Vec<u8>> {
    let query = if peek { "BODY.PEEK[]" } else { "BODY[]" };

    let mut stream = session.uid_fetch(uid.to_string(), query).await?;
    while let Some(fetch) = stream.try_next().await? {
        if let Some(body) = fetch.body() {
            return Ok(body.to_vec());
        }
    }

    Err(ImapError::MessageNotFound(uid))
}

/// Header and the first `max_bytes` of the body text, as one buffer
async fn fetch_partial(
    session: &mut ImapSession,
    uid: u32,
    max_bytes: usize,
) -> ImapResult<Vec<u8>> {
    let query = format!("(BODY.PEEK[HEADER] BODY.PEEK[TEXT]<0.{}>)", max_bytes);

    let mut stream = session.uid_fetch(uid.to_string(), &query).await?;
    while let Some(fetch) = stream.try_next().await? {
        if let Some(header) = fetch.header() {
            let mut raw = header.to_vec();
            if let Some(text) = fetch.text() {
                raw.extend_from_slice(&text[..text.len().min(max_bytes)]);
            }
            return Ok(raw);
        }
    }

    Err(ImapError::MessageNotFound(uid))
}

async fn copy_sets(session: &mut ImapSession, uids: &[u32], destination: &str) -> ImapResult<()> {
    for set in uid_sets(uids) {
        session
            .uid_copy(&set, destination)
            .await
            .map_err(|e| match ImapError::from(e) {
                err if err.is_disconnect() => err,
                err => ImapError::ServerError(format!("COPY to {}: {}", destination, err)),
            })?;
    }
    Ok(())
}

async fn store_deleted(session: &mut ImapSession, uid: u32) -> ImapResult<()> {
    session
        .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
        .await?
        .try_collect::<Vec<_>>()
        .await?;
    Ok(())
}

async fn expunge_deleted(session: &mut ImapSession) -> ImapResult<()> {
    let expunged = session.expunge().await?.try_collect::<Vec<_>>().await?;
    debug!("Expunged {} messages", expunged.len());
    Ok(())
}

/// Opens network IMAP sessions
#[derive(Debug, Default, Clone)]
pub struct ImapConnector;

impl ImapConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        login: &str,
        password: &str,
    ) -> ImapResult<Arc<dyn MailStore>> {
        let credentials = Credentials {
            login: login.to_string(),
            password: password.to_string(),
        };
        let session = open_session(endpoint, &credentials).await?;

        Ok(Arc::new(ImapStore {
            endpoint: endpoint.clone(),
            credentials,
            session: Mutex::new(Some(session)),
            connected: AtomicBool::new(true),
        }))
    }
}

/// Account-level session: LIST and the connection the account is held by
pub struct ImapStore {
    endpoint: ServerEndpoint,
    credentials: Credentials,
    session: Mutex<Option<ImapSession>>,
    connected: AtomicBool,
}

#[async_trait]
impl MailStore for ImapStore {
    fn mailbox(&self, path: &str) -> Arc<dyn MailboxHandle> {
        Arc::new(ImapMailbox::new(
            path,
            self.endpoint.clone(),
            self.credentials.clone(),
        ))
    }

    async fn list_folders(&self) -> ImapResult<Vec<FolderInfo>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ImapError::NotConnected)?;

        let mut folders = Vec::new();
        let mut stream = session.list(Some(""), Some("*")).await?;
        while let Some(mailbox) = stream.try_next().await? {
            let delimiter = mailbox.delimiter().and_then(|d| d.chars().next());
            let attributes = mailbox
                .attributes()
                .iter()
                .map(|a| attribute_name(format!("{:?}", a)))
                .collect();
            folders.push(FolderInfo::new(mailbox.name(), delimiter, attributes));
        }

        debug!("Found {} folders", folders.len());
        Ok(folders)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> ImapResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut session) = self.session.lock().await.take() {
            session.logout().await?;
            info!("Logged out of {}", self.endpoint.host);
        }
        Ok(())
    }
}

struct MailboxState {
    session: Option<ImapSession>,
    mode: Option<OpenMode>,
    snapshot: MailboxSnapshot,
    idle_capable: bool,
}

/// One mailbox on a dedicated connection
pub struct ImapMailbox {
    path: String,
    endpoint: ServerEndpoint,
    credentials: Credentials,
    events: EventBus,
    state: Mutex<MailboxState>,
}

impl ImapMailbox {
    fn new(path: &str, endpoint: ServerEndpoint, credentials: Credentials) -> Self {
        Self {
            path: path.to_string(),
            endpoint,
            credentials,
            events: EventBus::new(),
            state: Mutex::new(MailboxState {
                session: None,
                mode: None,
                snapshot: MailboxSnapshot::new(),
                idle_capable: false,
            }),
        }
    }

    fn emit(&self, event: FolderEvent) {
        self.events.send(event);
    }

    async fn select(&self, session: &mut ImapSession, mode: OpenMode) -> ImapResult<()> {
        let result = match mode {
            OpenMode::ReadWrite => session.select(&self.path).await,
            OpenMode::ReadOnly => session.examine(&self.path).await,
        };
        let mailbox = result.map_err(|e| match ImapError::from(e) {
            err if err.is_disconnect() => err,
            err => ImapError::FolderNotFound(format!("{}: {}", self.path, err)),
        })?;

        debug!(
            "Opened {} ({:?}) with {} messages",
            self.path, mode, mailbox.exists
        );
        Ok(())
    }

    /// Make sure a selected session exists, reconnecting after a drop
    async fn ensure_connected(&self, state: &mut MailboxState) -> ImapResult<()> {
        if state.session.is_some() {
            return Ok(());
        }
        let mode = state.mode.ok_or(ImapError::NotConnected)?;

        info!("Reconnecting {} ({:?})", self.path, mode);
        let mut session = open_session(&self.endpoint, &self.credentials).await?;
        state.idle_capable = session.capabilities().await?.has_str("IDLE");
        self.select(&mut session, mode).await?;
        state.session = Some(session);
        self.emit(FolderEvent::Connection(ConnectionState::Opened));

        // Catch up with what happened while disconnected
        self.refresh_locked(state).await
    }

    /// Drop the session if `result` says the connection is gone
    fn track<T>(&self, state: &mut MailboxState, result: ImapResult<T>) -> ImapResult<T> {
        if let Err(e) = &result {
            if e.is_disconnect() && state.session.take().is_some() {
                warn!("Connection for {} lost: {}", self.path, e);
                self.emit(FolderEvent::Connection(ConnectionState::Disconnected));
            }
        }
        result
    }

    fn require_writable(&self, state: &MailboxState) -> ImapResult<()> {
        match state.mode {
            Some(OpenMode::ReadWrite) => Ok(()),
            Some(OpenMode::ReadOnly) => Err(ImapError::ReadOnly(self.path.clone())),
            None => Err(ImapError::NotConnected),
        }
    }

    async fn refresh_locked(&self, state: &mut MailboxState) -> ImapResult<()> {
        let session = state.session.as_mut().ok_or(ImapError::NotConnected)?;

        session.noop().await?;
        while session.unsolicited_responses.try_recv().is_ok() {}

        let mut next = load_snapshot(session).await?;
        let diff = state.snapshot.diff(&mut next);
        if diff.is_empty() {
            state.snapshot = next;
            return Ok(());
        }

        let mut wanted = diff.added.clone();
        wanted.extend_from_slice(&diff.changed);
        let fetched = fetch_metadata(session, &self.path, &wanted).await?;
        for message in &fetched {
            if let Some(uid) = message.uid {
                next.set_message_id(uid, message.message_id.clone());
            }
        }
        state.snapshot = next;

        debug!(
            "{}: {} added, {} removed, {} changed",
            self.path,
            diff.added.len(),
            diff.removed.len(),
            diff.changed.len()
        );

        if !diff.removed.is_empty() {
            let removed = diff
                .removed
                .into_iter()
                .map(|(uid, message_id)| MessageData::expunged(uid, message_id, self.path.as_str()))
                .collect();
            self.emit(FolderEvent::MessagesRemoved(removed));
        }

        let (added, changed): (Vec<_>, Vec<_>) = fetched
            .into_iter()
            .partition(|m| m.uid.is_some_and(|uid| diff.added.contains(&uid)));
        if !added.is_empty() {
            self.emit(FolderEvent::MessagesAdded(added));
        }
        for message in changed {
            self.emit(FolderEvent::MessageChanged(message));
        }

        Ok(())
    }
}

#[async_trait]
impl MailboxHandle for ImapMailbox {
    fn path(&self) -> &str {
        &self.path
    }

    fn events(&self) -> mpsc::UnboundedReceiver<FolderEvent> {
        self.events.subscribe()
    }

    async fn open(&self, mode: OpenMode) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.mode == Some(mode) && state.session.is_some() {
            return Ok(());
        }

        let newly_connected = state.session.is_none();
        if newly_connected {
            let mut session = open_session(&self.endpoint, &self.credentials).await?;
            state.idle_capable = session.capabilities().await?.has_str("IDLE");
            state.session = Some(session);
        }

        let session = state.session.as_mut().ok_or(ImapError::NotConnected)?;
        let result = self.select(session, mode).await;
        self.track(state, result)?;
        state.mode = Some(mode);

        let result = match state.session.as_mut() {
            Some(session) => load_snapshot(session).await,
            None => Err(ImapError::NotConnected),
        };
        state.snapshot = self.track(state, result)?;

        if newly_connected {
            self.emit(FolderEvent::Connection(ConnectionState::Opened));
        }
        Ok(())
    }

    async fn close(&self, expunge: bool) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mode = state.mode.take();
        state.snapshot = MailboxSnapshot::new();
        let Some(mut session) = state.session.take() else {
            return Ok(());
        };

        if expunge && mode == Some(OpenMode::ReadWrite) {
            if let Err(e) = session.close().await {
                warn!("CLOSE on {} failed: {}", self.path, e);
            }
        }
        if let Err(e) = session.logout().await {
            debug!("LOGOUT on {} failed: {}", self.path, e);
        }

        debug!("Closed {}", self.path);
        self.emit(FolderEvent::Connection(ConnectionState::Closed));
        Ok(())
    }

    async fn unselect(&self, expunge: bool) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mode = state.mode.take();
        state.snapshot = MailboxSnapshot::new();

        // The next SELECT/EXAMINE leaves the mailbox without expunging
        if expunge && mode == Some(OpenMode::ReadWrite) {
            let result = match state.session.as_mut() {
                Some(session) => session.close().await.map_err(ImapError::from),
                None => Ok(()),
            };
            self.track(state, result)?;
        }

        debug!("Unselected {}", self.path);
        Ok(())
    }

    async fn message_count(&self, kind: MessageCountKind) -> ImapResult<u32> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;
        let result = self.refresh_locked(state).await;
        self.track(state, result)?;

        Ok(state.snapshot.count(kind))
    }

    async fn messages(&self) -> ImapResult<Vec<MessageData>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        let result = match state.session.as_mut() {
            Some(session) => fetch_all_metadata(session, &self.path).await,
            None => Err(ImapError::NotConnected),
        };
        self.track(state, result)
    }

    async fn message(&self, uid: u32) -> ImapResult<Option<MessageData>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        let result = match state.session.as_mut() {
            Some(session) => fetch_metadata(session, &self.path, &[uid]).await,
            None => Err(ImapError::NotConnected),
        };
        Ok(self.track(state, result)?.into_iter().next())
    }

    async fn fetch_body(&self, uid: u32, peek: bool) -> ImapResult<Vec<u8>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        let result = match state.session.as_mut() {
            Some(session) => fetch_raw(session, uid, peek).await,
            None => Err(ImapError::NotConnected),
        };
        self.track(state, result)
    }

    async fn fetch_preview(&self, uid: u32, max_bytes: usize) -> ImapResult<Vec<u8>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        let result = match state.session.as_mut() {
            Some(session) => fetch_partial(session, uid, max_bytes).await,
            None => Err(ImapError::NotConnected),
        };
        self.track(state, result)
    }

    async fn copy_messages(&self, uids: &[u32], destination: &str) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        let result = match state.session.as_mut() {
            Some(session) => copy_sets(session, uids, destination).await,
            None => Err(ImapError::NotConnected),
        };
        self.track(state, result)?;

        debug!("Copied {} messages from {} to {}", uids.len(), self.path, destination);
        Ok(())
    }

    async fn mark_deleted(&self, uid: u32) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        self.require_writable(state)?;
        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        let result = match state.session.as_mut() {
            Some(session) => store_deleted(session, uid).await,
            None => Err(ImapError::NotConnected),
        };
        self.track(state, result)
    }

    async fn expunge(&self) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        self.require_writable(state)?;
        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        let result = match state.session.as_mut() {
            Some(session) => expunge_deleted(session).await,
            None => Err(ImapError::NotConnected),
        };
        self.track(state, result)?;

        let result = self.refresh_locked(state).await;
        self.track(state, result)
    }

    async fn begin_idle(&self) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;

        if state.idle_capable {
            Ok(())
        } else {
            Err(ImapError::IdleNotSupported)
        }
    }

    async fn wait_idle(&self, timeout: Duration, stop: Arc<Notify>) -> ImapResult<IdleOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;
        if !state.idle_capable {
            return Err(ImapError::IdleNotSupported);
        }

        let session = state.session.take().ok_or(ImapError::NotConnected)?;
        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            warn!("Failed to init IDLE on {}: {}", self.path, e);
            self.emit(FolderEvent::Connection(ConnectionState::Disconnected));
            return Err(e.into());
        }

        debug!("IDLE started on {}", self.path);
        let (idle_wait, interrupt) = idle.wait();

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, idle_wait) => match result {
                Ok(Ok(IdleResponse::NewData(_))) => Ok(IdleOutcome::NewData),
                Ok(Ok(IdleResponse::Timeout)) | Err(_) => Ok(IdleOutcome::Timeout),
                Ok(Ok(IdleResponse::ManualInterrupt)) => Ok(IdleOutcome::Interrupted),
                Ok(Err(e)) => Err(ImapError::from(e)),
            },
            _ = stop.notified() => Ok(IdleOutcome::Interrupted),
        };
        drop(interrupt);

        match idle.done().await {
            Ok(session) => state.session = Some(session),
            Err(e) => {
                warn!("Failed to end IDLE on {}: {}", self.path, e);
                self.emit(FolderEvent::Connection(ConnectionState::Disconnected));
                return Err(e.into());
            }
        }

        debug!("IDLE on {} ended: {:?}", self.path, outcome);
        outcome
    }

    async fn refresh(&self) -> ImapResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let result = self.ensure_connected(state).await;
        self.track(state, result)?;
        let result = self.refresh_locked(state).await;
        self.track(state, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_name() {
        assert_eq!(attribute_name("NoSelect".to_string()), "NoSelect");
        assert_eq!(
            attribute_name("Extension(\"\\\\HasNoChildren\")".to_string()),
            "\\HasNoChildren"
        );
    }

    #[test]
    fn test_uid_sets_compress_runs() {
        assert_eq!(uid_sets(&[3, 9, 12]), vec!["3,9,12"]);
        assert_eq!(uid_sets(&[5, 1, 2, 3, 4, 9, 10, 3]), vec!["1:5,9:10"]);
        assert!(uid_sets(&[]).is_empty());
    }

    #[test]
    fn test_uid_sets_bounded_length() {
        let contiguous: Vec<u32> = (1..=50_000).collect();
        assert_eq!(uid_sets(&contiguous), vec!["1:50000"]);

        let sparse: Vec<u32> = (1..=50_000).map(|n| n * 2).collect();
        let sets = uid_sets(&sparse);
        assert!(sets.len() > 1);
        assert!(sets.iter().all(|set| set.len() <= MAX_UID_SET_LEN));

        let covered: usize = sets.iter().map(|set| set.split(',').count()).sum();
        assert_eq!(covered, sparse.len());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            login: "user@example.com".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("user@example.com"));
        assert!(!printed.contains("hunter2"));
    }
}
