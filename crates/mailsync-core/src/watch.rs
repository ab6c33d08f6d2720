//! Change-watch manager: IDLE where the server supports it, polling otherwise
//!
//! Each watched folder has at most one registration. A push registration
//! keeps one task parked in IDLE on the folder's handle and refreshes the
//! handle whenever the server reports news; a poll registration runs a
//! message-count query at a fixed period, which makes the handle notice and
//! report changes.
//!
//! Checking a handle for IDLE may reconnect it, so the registration lock is
//! never held across that check; the folder is marked pending meanwhile.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use mailsync_imap::{IdleOutcome, MailboxHandle, MessageCountKind};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::scheduler::{Scheduler, TaskHandle};

/// How a folder is being watched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Server push via IDLE
    Push,
    /// Fixed-period polling
    Poll,
}

enum Registration {
    /// Checking for IDLE; resolves to the chosen mode
    Pending {
        id: u64,
        settled: watch::Receiver<Option<WatchMode>>,
    },
    Push {
        id: u64,
        stop: Arc<Notify>,
        task: TaskHandle,
    },
    Poll {
        id: u64,
        task: TaskHandle,
    },
}

impl Registration {
    fn id(&self) -> u64 {
        match self {
            Registration::Pending { id, .. }
            | Registration::Push { id, .. }
            | Registration::Poll { id, .. } => *id,
        }
    }

    fn mode(&self) -> Option<WatchMode> {
        match self {
            Registration::Pending { .. } => None,
            Registration::Push { .. } => Some(WatchMode::Push),
            Registration::Poll { .. } => Some(WatchMode::Poll),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Registration::Pending { .. } => false,
            Registration::Push { task, .. } | Registration::Poll { task, .. } => task.is_finished(),
        }
    }

    fn end(self) {
        match self {
            // The registering call notices its id is gone
            Registration::Pending { .. } => {}
            Registration::Push { stop, .. } => stop.notify_one(),
            Registration::Poll { task, .. } => task.cancel(),
        }
    }
}

/// Watches folders for changes on behalf of one account
pub struct WatchManager {
    scheduler: Arc<dyn Scheduler>,
    poll_interval: Duration,
    idle_keepalive: Duration,
    registrations: Mutex<HashMap<String, Registration>>,
    stopped: AtomicBool,
    next_id: AtomicU64,
    this: Weak<WatchManager>,
}

impl WatchManager {
    /// Create a manager polling every `poll_interval` for folders that
    /// cannot IDLE, and re-issuing IDLE every `idle_keepalive`
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        poll_interval: Duration,
        idle_keepalive: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            scheduler,
            poll_interval,
            idle_keepalive,
            registrations: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Start watching `handle`, preferring IDLE. Does nothing if the folder
    /// is already watched; waits for a registration already in progress.
    pub async fn watch(&self, handle: Arc<dyn MailboxHandle>) -> CoreResult<WatchMode> {
        let path = handle.path().to_string();

        let (id, resolved) = loop {
            if !self.is_running() {
                return Err(CoreError::ManagerStopped);
            }
            let mut registrations = self.registrations.lock().await;
            if !self.is_running() {
                return Err(CoreError::ManagerStopped);
            }

            // Check if already watched
            let in_progress = match registrations.get(&path) {
                Some(Registration::Pending { settled, .. }) => Some(settled.clone()),
                Some(existing) if !existing.is_finished() => {
                    if let Some(mode) = existing.mode() {
                        debug!("{} is already watched ({:?})", path, mode);
                        return Ok(mode);
                    }
                    None
                }
                _ => None,
            };

            if let Some(mut settled) = in_progress {
                drop(registrations);
                debug!("{} is being registered, waiting", path);
                let settled_mode = settled.wait_for(Option::is_some).await.ok().and_then(|m| *m);
                if let Some(mode) = settled_mode {
                    return Ok(mode);
                }
                // Abandoned; look again
                continue;
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let (resolved, settled) = watch::channel(None);
            registrations.insert(path.clone(), Registration::Pending { id, settled });
            break (id, resolved);
        };

        let idle = handle.begin_idle().await;

        let mut registrations = self.registrations.lock().await;
        if !self.is_running() {
            return Err(CoreError::ManagerStopped);
        }
        let mode = if idle.is_ok() {
            WatchMode::Push
        } else {
            WatchMode::Poll
        };
        if registrations.get(&path).map(Registration::id) != Some(id) {
            debug!("Registration of {} ended before it started", path);
            return Ok(mode);
        }

        let registration = match idle {
            Ok(()) => {
                info!("Watching {} with IDLE", path);
                self.start_push(id, handle)
            }
            Err(e) => {
                info!(
                    "IDLE unavailable for {} ({}), polling every {:?}",
                    path, e, self.poll_interval
                );
                self.start_poll(id, handle)
            }
        };
        registrations.insert(path, registration);
        let _ = resolved.send(Some(mode));
        Ok(mode)
    }

    /// Cancel the poll task of `path`, if it is polled
    pub async fn unwatch(&self, path: &str) {
        let mut registrations = self.registrations.lock().await;
        if matches!(registrations.get(path), Some(Registration::Poll { .. })) {
            if let Some(registration) = registrations.remove(path) {
                debug!("Stopped polling {}", path);
                registration.end();
            }
        }
    }

    /// End any registration for `path`, push included
    pub async fn stop_watching(&self, path: &str) {
        if let Some(registration) = self.registrations.lock().await.remove(path) {
            debug!("Stopped watching {} ({:?})", path, registration.mode());
            registration.end();
        }
    }

    /// Stop every registration; later `watch` calls fail. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut registrations = self.registrations.lock().await;
        let count = registrations.len();
        for (_, registration) in registrations.drain() {
            registration.end();
        }
        info!("Watch manager stopped ({} registrations ended)", count);
    }

    pub async fn watch_mode(&self, path: &str) -> Option<WatchMode> {
        self.registrations
            .lock()
            .await
            .get(path)
            .filter(|r| !r.is_finished())
            .and_then(Registration::mode)
    }

    pub async fn active_watches(&self) -> usize {
        self.registrations
            .lock()
            .await
            .values()
            .filter(|r| !r.is_finished())
            .count()
    }

    fn start_push(&self, id: u64, handle: Arc<dyn MailboxHandle>) -> Registration {
        let stop = Arc::new(Notify::new());
        let task = self.scheduler.spawn(
            push_loop(
                self.this.clone(),
                id,
                handle,
                stop.clone(),
                self.idle_keepalive,
            )
            .boxed(),
        );
        Registration::Push { id, stop, task }
    }

    fn start_poll(&self, id: u64, handle: Arc<dyn MailboxHandle>) -> Registration {
        let task = self.scheduler.schedule_periodic(
            Box::new(move || {
                let handle = handle.clone();
                async move {
                    match handle.message_count(MessageCountKind::All).await {
                        Ok(count) => debug!("Polled {}: {} messages", handle.path(), count),
                        Err(e) => warn!("Polling {} failed: {}", handle.path(), e),
                    }
                }
                .boxed()
            }),
            Duration::ZERO,
            self.poll_interval,
        );
        Registration::Poll { id, task }
    }

    /// Swap a failed push registration for polling, unless it was ended meanwhile
    async fn fall_back_to_poll(&self, id: u64, handle: Arc<dyn MailboxHandle>) {
        let path = handle.path().to_string();
        let mut registrations = self.registrations.lock().await;
        if !self.is_running() || registrations.get(&path).map(Registration::id) != Some(id) {
            return;
        }

        info!("Falling back to polling {} every {:?}", path, self.poll_interval);
        let new_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registration = self.start_poll(new_id, handle);
        registrations.insert(path, registration);
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        for (_, registration) in self.registrations.get_mut().drain() {
            registration.end();
        }
    }
}

async fn push_loop(
    manager: Weak<WatchManager>,
    id: u64,
    handle: Arc<dyn MailboxHandle>,
    stop: Arc<Notify>,
    keepalive: Duration,
) {
    let path = handle.path().to_string();

    let failure = loop {
        match handle.wait_idle(keepalive, stop.clone()).await {
            Ok(IdleOutcome::NewData) => {
                debug!("IDLE on {} reported new data", path);
                if let Err(e) = handle.refresh().await {
                    break e;
                }
            }
            Ok(IdleOutcome::Timeout) => {
                debug!("Re-issuing IDLE on {}", path);
                if let Err(e) = handle.begin_idle().await {
                    break e;
                }
            }
            Ok(IdleOutcome::Interrupted) => {
                debug!("IDLE on {} interrupted", path);
                return;
            }
            Err(e) => break e,
        }
    };

    warn!("IDLE on {} failed: {}", path, failure);
    if let Some(manager) = manager.upgrade() {
        manager.fall_back_to_poll(id, handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use async_trait::async_trait;
    use mailsync_imap::{
        Connector, FolderEvent, ImapResult, MailStore, MemoryServer, MessageData, OpenMode,
        Security, ServerEndpoint,
    };
    use tokio::sync::mpsc;

    const MESSAGE: &str = "From: a@example.com\r\nSubject: ping\r\n\r\nbody\r\n";

    async fn setup(idle: bool) -> (MemoryServer, Arc<dyn MailStore>) {
        let server = MemoryServer::new();
        server.add_user("user", "pw");
        server.set_idle_supported(idle);
        let store = server
            .connector()
            .connect(
                &ServerEndpoint::new("localhost", 143, Security::Plain),
                "user",
                "pw",
            )
            .await
            .unwrap();
        (server, store)
    }

    fn manager(poll: Duration) -> Arc<WatchManager> {
        WatchManager::new(
            Arc::new(TokioScheduler::new()),
            poll,
            Duration::from_secs(28 * 60),
        )
    }

    /// Handle whose IDLE check hangs until `release` is notified
    struct StalledHandle {
        inner: Arc<dyn MailboxHandle>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl MailboxHandle for StalledHandle {
        fn path(&self) -> &str {
            self.inner.path()
        }

        fn events(&self) -> mpsc::UnboundedReceiver<FolderEvent> {
            self.inner.events()
        }

        async fn open(&self, mode: OpenMode) -> ImapResult<()> {
            self.inner.open(mode).await
        }

        async fn close(&self, expunge: bool) -> ImapResult<()> {
            self.inner.close(expunge).await
        }

        async fn unselect(&self, expunge: bool) -> ImapResult<()> {
            self.inner.unselect(expunge).await
        }

        async fn message_count(&self, kind: MessageCountKind) -> ImapResult<u32> {
            self.inner.message_count(kind).await
        }

        async fn messages(&self) -> ImapResult<Vec<MessageData>> {
            self.inner.messages().await
        }

        async fn message(&self, uid: u32) -> ImapResult<Option<MessageData>> {
            self.inner.message(uid).await
        }

        async fn fetch_body(&self, uid: u32, peek: bool) -> ImapResult<Vec<u8>> {
            self.inner.fetch_body(uid, peek).await
        }

        async fn fetch_preview(&self, uid: u32, max_bytes: usize) -> ImapResult<Vec<u8>> {
            self.inner.fetch_preview(uid, max_bytes).await
        }

        async fn copy_messages(&self, uids: &[u32], destination: &str) -> ImapResult<()> {
            self.inner.copy_messages(uids, destination).await
        }

        async fn mark_deleted(&self, uid: u32) -> ImapResult<()> {
            self.inner.mark_deleted(uid).await
        }

        async fn expunge(&self) -> ImapResult<()> {
            self.inner.expunge().await
        }

        async fn begin_idle(&self) -> ImapResult<()> {
            self.release.notified().await;
            self.inner.begin_idle().await
        }

        async fn wait_idle(&self, timeout: Duration, stop: Arc<Notify>) -> ImapResult<IdleOutcome> {
            self.inner.wait_idle(timeout, stop).await
        }

        async fn refresh(&self) -> ImapResult<()> {
            self.inner.refresh().await
        }
    }

    async fn next_added(events: &mut mpsc::UnboundedReceiver<FolderEvent>) -> usize {
        loop {
            match events.recv().await.unwrap() {
                FolderEvent::MessagesAdded(added) => return added.len(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_watch_twice_registers_once() {
        let (_server, store) = setup(true).await;
        let handle = store.mailbox("INBOX");
        handle.open(OpenMode::ReadOnly).await.unwrap();

        let manager = manager(Duration::from_secs(15));
        assert_eq!(manager.watch(handle.clone()).await.unwrap(), WatchMode::Push);
        assert_eq!(manager.watch(handle.clone()).await.unwrap(), WatchMode::Push);
        assert_eq!(manager.active_watches().await, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_push_refreshes_on_delivery() {
        let (server, store) = setup(true).await;
        let handle = store.mailbox("INBOX");
        handle.open(OpenMode::ReadOnly).await.unwrap();
        let mut events = handle.events();

        let manager = manager(Duration::from_secs(15));
        manager.watch(handle.clone()).await.unwrap();
        server.deliver("INBOX", MESSAGE).unwrap();

        let added = tokio::time::timeout(Duration::from_secs(5), next_added(&mut events))
            .await
            .expect("push delivered an event");
        assert_eq!(added, 1);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_fallback_when_idle_unsupported() {
        let (server, store) = setup(false).await;
        let handle = store.mailbox("INBOX");
        handle.open(OpenMode::ReadOnly).await.unwrap();
        let mut events = handle.events();

        let manager = manager(Duration::from_secs(15));
        assert_eq!(manager.watch(handle.clone()).await.unwrap(), WatchMode::Poll);

        server.deliver("INBOX", MESSAGE).unwrap();
        let added = tokio::time::timeout(Duration::from_secs(20), next_added(&mut events))
            .await
            .expect("poll noticed the delivery");
        assert_eq!(added, 1);

        manager.unwatch("INBOX").await;
        assert_eq!(manager.watch_mode("INBOX").await, None);
    }

    #[tokio::test]
    async fn test_push_failure_falls_back_to_poll() {
        let (server, store) = setup(true).await;
        let handle = store.mailbox("INBOX");
        handle.open(OpenMode::ReadOnly).await.unwrap();

        let manager = manager(Duration::from_millis(50));
        assert_eq!(manager.watch(handle.clone()).await.unwrap(), WatchMode::Push);

        server.set_idle_supported(false);
        server.deliver("INBOX", MESSAGE).unwrap();

        let switched = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if manager.watch_mode("INBOX").await == Some(WatchMode::Poll) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(switched.is_ok());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_terminal_and_idempotent() {
        let (_server, store) = setup(true).await;
        let handle = store.mailbox("INBOX");
        handle.open(OpenMode::ReadOnly).await.unwrap();

        let manager = manager(Duration::from_secs(15));
        manager.watch(handle.clone()).await.unwrap();
        manager.stop().await;
        manager.stop().await;

        assert!(!manager.is_running());
        assert_eq!(manager.active_watches().await, 0);
        assert!(matches!(
            manager.watch(handle).await,
            Err(CoreError::ManagerStopped)
        ));
    }

    #[tokio::test]
    async fn test_unwatch_leaves_push_running() {
        let (_server, store) = setup(true).await;
        let handle = store.mailbox("INBOX");
        handle.open(OpenMode::ReadOnly).await.unwrap();

        let manager = manager(Duration::from_secs(15));
        manager.watch(handle.clone()).await.unwrap();
        manager.unwatch("INBOX").await;
        assert_eq!(manager.watch_mode("INBOX").await, Some(WatchMode::Push));

        manager.stop_watching("INBOX").await;
        assert_eq!(manager.watch_mode("INBOX").await, None);
    }

    #[tokio::test]
    async fn test_stalled_registration_does_not_block_other_folders() {
        let (server, store) = setup(true).await;
        server.create_mailbox("Archive", &[]);

        let stalled_inner = store.mailbox("Archive");
        stalled_inner.open(OpenMode::ReadOnly).await.unwrap();
        let release = Arc::new(Notify::new());
        let stalled: Arc<dyn MailboxHandle> = Arc::new(StalledHandle {
            inner: stalled_inner,
            release: release.clone(),
        });

        let inbox = store.mailbox("INBOX");
        inbox.open(OpenMode::ReadOnly).await.unwrap();
        let mut events = inbox.events();

        let manager = manager(Duration::from_secs(15));
        let first = tokio::spawn({
            let manager = manager.clone();
            let stalled = stalled.clone();
            async move { manager.watch(stalled).await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            let stalled = stalled.clone();
            async move { manager.watch(stalled).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.watch_mode("Archive").await, None);

        let registered = tokio::time::timeout(Duration::from_secs(1), manager.watch(inbox.clone()))
            .await
            .expect("INBOX registered while Archive is stalled")
            .unwrap();
        assert_eq!(registered, WatchMode::Push);

        server.deliver("INBOX", MESSAGE).unwrap();
        let added = tokio::time::timeout(Duration::from_secs(5), next_added(&mut events))
            .await
            .expect("INBOX dispatched while Archive is stalled");
        assert_eq!(added, 1);

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), WatchMode::Push);
        assert_eq!(second.await.unwrap().unwrap(), WatchMode::Push);
        assert_eq!(manager.watch_mode("Archive").await, Some(WatchMode::Push));
        assert_eq!(manager.active_watches().await, 2);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_registration() {
        let (_server, store) = setup(true).await;
        let inner = store.mailbox("INBOX");
        inner.open(OpenMode::ReadOnly).await.unwrap();
        let release = Arc::new(Notify::new());
        let stalled: Arc<dyn MailboxHandle> = Arc::new(StalledHandle {
            inner,
            release: release.clone(),
        });

        let manager = manager(Duration::from_secs(15));
        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.watch(stalled).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), manager.stop())
            .await
            .expect("stop does not wait for the IDLE check");
        release.notify_one();

        assert!(matches!(
            pending.await.unwrap(),
            Err(CoreError::ManagerStopped)
        ));
        assert_eq!(manager.active_watches().await, 0);
    }
}
