//! Per-folder change notifier
//!
//! Binds to one mailbox handle's event stream, turns transport events into
//! envelopes and fans them out to registered listeners. Every message event
//! re-arms the account's watch manager before listeners are called.

use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

use futures::FutureExt;
use mailsync_imap::{FolderEvent, MailboxHandle, MessageData, OpenMode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::CoreResult;
use crate::scheduler::TaskHandle;
use crate::session::AccountContext;

/// Receives change events for a folder
///
/// Callbacks run synchronously on the notifier's dispatch task, in the
/// order the transport reported the changes.
pub trait FolderListener: Send + Sync {
    fn messages_added(&self, _messages: &[Envelope]) {}

    fn messages_removed(&self, _messages: &[Envelope]) {}

    fn message_changed(&self, _message: &Envelope) {}
}

fn same_listener(a: &Arc<dyn FolderListener>, b: &Arc<dyn FolderListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Listener set and dispatch task for one folder
pub struct FolderChangeNotifier {
    path: String,
    handle: Arc<dyn MailboxHandle>,
    context: Arc<AccountContext>,
    listeners: RwLock<Vec<Arc<dyn FolderListener>>>,
    dispatcher: OnceLock<TaskHandle>,
}

impl FolderChangeNotifier {
    /// Open `handle` read-only and start dispatching its events
    pub async fn start(
        context: Arc<AccountContext>,
        handle: Arc<dyn MailboxHandle>,
    ) -> CoreResult<Arc<Self>> {
        // Subscribe before opening so nothing is missed
        let events = handle.events();
        handle.open(OpenMode::ReadOnly).await?;

        let notifier = Arc::new(Self {
            path: handle.path().to_string(),
            handle,
            context,
            listeners: RwLock::new(Vec::new()),
            dispatcher: OnceLock::new(),
        });

        let task = notifier
            .context
            .scheduler()
            .spawn(dispatch_loop(Arc::downgrade(&notifier), events).boxed());
        let _ = notifier.dispatcher.set(task);

        info!("Change notifier started for {}", notifier.path);
        Ok(notifier)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register `listener` and make sure the folder is watched
    pub async fn add_listener(&self, listener: Arc<dyn FolderListener>) -> CoreResult<()> {
        {
            let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
            if !listeners.iter().any(|l| same_listener(l, &listener)) {
                listeners.push(listener);
            }
        }

        let mode = self
            .context
            .watch_manager()
            .watch(self.handle.clone())
            .await?;
        debug!("{} watched via {:?}", self.path, mode);
        Ok(())
    }

    /// Returns whether `listener` was registered. Never unwatches.
    pub fn remove_listener(&self, listener: &Arc<dyn FolderListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop dispatching and close the notifier's handle
    pub async fn close(&self) -> CoreResult<()> {
        if let Some(task) = self.dispatcher.get() {
            task.cancel();
        }
        self.handle.close(false).await?;
        debug!("Change notifier for {} closed", self.path);
        Ok(())
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn FolderListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn rearm(&self) {
        if self.listener_count() == 0 {
            return;
        }
        if let Err(e) = self
            .context
            .watch_manager()
            .watch(self.handle.clone())
            .await
        {
            warn!("Could not re-arm watch on {}: {}", self.path, e);
        }
    }

    fn envelopes(&self, messages: &[MessageData]) -> Vec<Envelope> {
        messages
            .iter()
            .filter_map(|message| {
                Envelope::from_message(message, self.context.account_identity())
                    .map_err(|e| warn!("Skipping message in {}: {}", self.path, e))
                    .ok()
            })
            .collect()
    }

    async fn handle_event(&self, event: FolderEvent) {
        match event {
            FolderEvent::MessagesAdded(messages) => {
                self.rearm().await;
                let envelopes = self.envelopes(&messages);
                debug!("{}: {} messages added", self.path, envelopes.len());
                for listener in self.snapshot_listeners() {
                    listener.messages_added(&envelopes);
                }
            }
            FolderEvent::MessagesRemoved(messages) => {
                self.rearm().await;
                let envelopes = self.envelopes(&messages);
                debug!("{}: {} messages removed", self.path, envelopes.len());
                for listener in self.snapshot_listeners() {
                    listener.messages_removed(&envelopes);
                }
            }
            FolderEvent::MessageChanged(message) => {
                self.rearm().await;
                let Some(envelope) = self.envelopes(std::slice::from_ref(&message)).pop() else {
                    return;
                };
                for listener in self.snapshot_listeners() {
                    listener.message_changed(&envelope);
                }
            }
            FolderEvent::Connection(state) => {
                debug!("{}: connection {:?}", self.path, state);
            }
        }
    }
}

impl Drop for FolderChangeNotifier {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get() {
            task.cancel();
        }
    }
}

async fn dispatch_loop(
    notifier: Weak<FolderChangeNotifier>,
    mut events: mpsc::UnboundedReceiver<FolderEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(notifier) = notifier.upgrade() else {
            break;
        };
        notifier.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::scheduler::{Scheduler, TokioScheduler};
    use crate::watch::{WatchManager, WatchMode};
    use mailsync_imap::{Connector, MemoryServer, MessageFlags, Security, ServerEndpoint};

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<String>>,
        removed: Mutex<usize>,
        changed: Mutex<usize>,
    }

    impl FolderListener for Recorder {
        fn messages_added(&self, messages: &[Envelope]) {
            let mut added = self.added.lock().unwrap();
            added.extend(messages.iter().filter_map(|m| m.subject.clone()));
        }

        fn messages_removed(&self, messages: &[Envelope]) {
            *self.removed.lock().unwrap() += messages.len();
        }

        fn message_changed(&self, _message: &Envelope) {
            *self.changed.lock().unwrap() += 1;
        }
    }

    async fn context(server: &MemoryServer) -> Arc<AccountContext> {
        server.add_user("user", "pw");
        let store = server
            .connector()
            .connect(
                &ServerEndpoint::new("localhost", 143, Security::Plain),
                "user",
                "pw",
            )
            .await
            .unwrap();
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());
        let watch_manager = WatchManager::new(
            scheduler.clone(),
            Duration::from_secs(15),
            Duration::from_secs(28 * 60),
        );
        Arc::new(AccountContext::new(
            "user@example.com",
            store,
            watch_manager,
            scheduler,
        ))
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    #[tokio::test]
    async fn test_dispatches_added_removed_and_changed() {
        let server = MemoryServer::new();
        let context = context(&server).await;
        let handle = context.store().mailbox("INBOX");
        let notifier = FolderChangeNotifier::start(context.clone(), handle)
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone()).await.unwrap();
        assert_eq!(
            context.watch_manager().watch_mode("INBOX").await,
            Some(WatchMode::Push)
        );

        let uid = server
            .deliver("INBOX", "From: a@example.com\r\nSubject: hello\r\n\r\nbody\r\n")
            .unwrap();
        eventually(|| recorder.added.lock().unwrap().len() == 1).await;
        assert_eq!(recorder.added.lock().unwrap()[0], "hello");

        let mut flags = MessageFlags::default();
        flags.seen = true;
        server.set_flags("INBOX", uid, flags).unwrap();
        eventually(|| *recorder.changed.lock().unwrap() == 1).await;

        server.remove("INBOX", uid).unwrap();
        eventually(|| *recorder.removed.lock().unwrap() == 1).await;

        context.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_burst_of_flag_changes_reaches_listeners() {
        let server = MemoryServer::new();
        let context = context(&server).await;
        let uids: Vec<u32> = (0..100)
            .map(|n| {
                let raw = format!("From: a@example.com\r\nSubject: m{}\r\n\r\nbody\r\n", n);
                server.append("INBOX", raw, MessageFlags::default()).unwrap()
            })
            .collect();

        let notifier = FolderChangeNotifier::start(context.clone(), context.store().mailbox("INBOX"))
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone()).await.unwrap();

        let mut flags = MessageFlags::default();
        flags.seen = true;
        for uid in &uids {
            server.set_flags("INBOX", *uid, flags.clone()).unwrap();
        }

        eventually(|| *recorder.changed.lock().unwrap() == 100).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*recorder.changed.lock().unwrap(), 100);
        context.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_set_membership() {
        let server = MemoryServer::new();
        let context = context(&server).await;
        let notifier = FolderChangeNotifier::start(context.clone(), context.store().mailbox("INBOX"))
            .await
            .unwrap();

        let listener: Arc<dyn FolderListener> = Arc::new(Recorder::default());
        notifier.add_listener(listener.clone()).await.unwrap();
        notifier.add_listener(listener.clone()).await.unwrap();
        assert_eq!(notifier.listener_count(), 1);

        assert!(notifier.remove_listener(&listener));
        assert!(!notifier.remove_listener(&listener));
        assert_eq!(notifier.listener_count(), 0);

        // Removing the last listener does not unwatch
        assert!(context.watch_manager().watch_mode("INBOX").await.is_some());
        context.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_on_missing_folder_fails() {
        let server = MemoryServer::new();
        let context = context(&server).await;
        let result =
            FolderChangeNotifier::start(context.clone(), context.store().mailbox("Nope")).await;
        assert!(matches!(
            result,
            Err(crate::error::CoreError::FolderNotFound(_))
        ));
    }
}
