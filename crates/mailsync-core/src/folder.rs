//! Folder: counts, lookup, copy/move/delete and change subscriptions
//!
//! A folder owns two handles on its mailbox: a direct one for reads and
//! writes, opened lazily in the mode each operation needs, and one reserved
//! for its change notifier so a folder parked in IDLE stays usable.

use std::sync::{Arc, Weak};

use mailsync_imap::{MailboxHandle, MessageCountKind, OpenMode, SpecialUse};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::notifier::{FolderChangeNotifier, FolderListener};
use crate::session::AccountContext;

/// Open state of a folder's direct handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    OpenReadOnly,
    OpenReadWrite,
}

/// What [`HandleState::transition`] asks the handle to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already open in the wanted mode
    Keep,
    Open,
    /// Open in the other mode: close, then open
    Reopen,
}

impl HandleState {
    pub fn mode(self) -> Option<OpenMode> {
        match self {
            HandleState::Closed => None,
            HandleState::OpenReadOnly => Some(OpenMode::ReadOnly),
            HandleState::OpenReadWrite => Some(OpenMode::ReadWrite),
        }
    }

    pub fn transition(self, target: OpenMode) -> Transition {
        match self.mode() {
            None => Transition::Open,
            Some(mode) if mode == target => Transition::Keep,
            Some(_) => Transition::Reopen,
        }
    }
}

impl From<OpenMode> for HandleState {
    fn from(mode: OpenMode) -> Self {
        match mode {
            OpenMode::ReadOnly => HandleState::OpenReadOnly,
            OpenMode::ReadWrite => HandleState::OpenReadWrite,
        }
    }
}

/// One mailbox of an account; cached by [`Account`]
pub struct Folder {
    path: String,
    context: Arc<AccountContext>,
    account: Weak<Account>,
    handle: Arc<dyn MailboxHandle>,
    notifier_handle: Arc<dyn MailboxHandle>,
    state: Mutex<HandleState>,
    notifier: Mutex<Option<Arc<FolderChangeNotifier>>>,
}

impl std::fmt::Debug for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Folder").field("path", &self.path).finish()
    }
}

impl Folder {
    /// A closed folder; no network traffic
    pub(crate) fn new(path: &str, context: Arc<AccountContext>, account: Weak<Account>) -> Self {
        let store = context.store();
        Self {
            path: path.to_string(),
            handle: store.mailbox(path),
            notifier_handle: store.mailbox(path),
            context,
            account,
            state: Mutex::new(HandleState::Closed),
            notifier: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn account_identity(&self) -> &str {
        self.context.account_identity()
    }

    /// Role of this folder in the account's special-use map
    pub fn special_use(&self) -> SpecialUse {
        self.account
            .upgrade()
            .map(|account| account.role_of(&self.path))
            .unwrap_or(SpecialUse::None)
    }

    pub async fn state(&self) -> HandleState {
        *self.state.lock().await
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.context.is_closed() {
            return Err(CoreError::NoConnectionEstablished);
        }
        Ok(())
    }

    fn account(&self) -> CoreResult<Arc<Account>> {
        self.account
            .upgrade()
            .ok_or(CoreError::NoConnectionEstablished)
    }

    /// Bring the direct handle into `target` mode
    async fn ensure_mode(&self, state: &mut HandleState, target: OpenMode) -> CoreResult<()> {
        self.check_open()?;
        match state.transition(target) {
            Transition::Keep => return Ok(()),
            Transition::Open => {
                debug!("Opening {} ({:?})", self.path, target);
                self.handle.open(target).await?;
            }
            Transition::Reopen => {
                debug!("Switching {} to {:?}", self.path, target);
                self.handle.unselect(true).await?;
                *state = HandleState::Closed;
                self.handle.open(target).await?;
            }
        }
        *state = HandleState::from(target);
        Ok(())
    }

    /// Open read-only unless the handle is already open in some mode
    async fn ensure_any(&self, state: &mut HandleState) -> CoreResult<()> {
        match state.mode() {
            Some(_) => self.check_open(),
            None => self.ensure_mode(state, OpenMode::ReadOnly).await,
        }
    }

    pub async fn message_count(&self, kind: MessageCountKind) -> CoreResult<u32> {
        let mut state = self.state.lock().await;
        self.ensure_any(&mut state).await?;
        Ok(self.handle.message_count(kind).await?)
    }

    pub async fn total_message_count(&self) -> CoreResult<u32> {
        self.message_count(MessageCountKind::All).await
    }

    pub async fn unread_message_count(&self) -> CoreResult<u32> {
        self.message_count(MessageCountKind::Unread).await
    }

    pub async fn new_message_count(&self) -> CoreResult<u32> {
        self.message_count(MessageCountKind::New).await
    }

    /// Look up `uid` with the folder open read-write, so reading the
    /// content marks it seen
    pub async fn message(self: &Arc<Self>, uid: u32) -> CoreResult<Message> {
        self.message_in_mode(uid, OpenMode::ReadWrite).await
    }

    pub async fn message_read_only(self: &Arc<Self>, uid: u32) -> CoreResult<Message> {
        self.message_in_mode(uid, OpenMode::ReadOnly).await
    }

    async fn message_in_mode(self: &Arc<Self>, uid: u32, mode: OpenMode) -> CoreResult<Message> {
        let mut state = self.state.lock().await;
        self.ensure_mode(&mut state, mode).await?;
        let data = self
            .handle
            .message(uid)
            .await?
            .ok_or(CoreError::MessageNotFound(uid))?;
        Ok(Message::new(self.clone(), data))
    }

    /// Every message with its envelope and flags
    pub async fn messages(self: &Arc<Self>) -> CoreResult<Vec<Message>> {
        let mut state = self.state.lock().await;
        self.ensure_mode(&mut state, OpenMode::ReadOnly).await?;
        let messages = self.handle.messages().await?;
        debug!("Fetched {} messages from {}", messages.len(), self.path);
        Ok(messages
            .into_iter()
            .map(|data| Message::new(self.clone(), data))
            .collect())
    }

    pub(crate) async fn read_body(&self, uid: u32) -> CoreResult<Vec<u8>> {
        let mut state = self.state.lock().await;
        self.ensure_any(&mut state).await?;
        Ok(self.handle.fetch_body(uid, false).await?)
    }

    pub(crate) async fn read_preview(&self, uid: u32, max_bytes: usize) -> CoreResult<Vec<u8>> {
        let mut state = self.state.lock().await;
        self.ensure_any(&mut state).await?;
        Ok(self.handle.fetch_preview(uid, max_bytes).await?)
    }

    /// Copy `message` into `destination`; the source keeps it
    pub async fn copy(&self, message: &Message, destination: &Arc<Folder>) -> CoreResult<()> {
        let uid = message.uid().ok_or(CoreError::UidUnavailable)?;

        {
            let mut target = destination.state.lock().await;
            destination
                .ensure_mode(&mut target, OpenMode::ReadWrite)
                .await?;
        }

        let copied = {
            let mut state = self.state.lock().await;
            match self.ensure_any(&mut state).await {
                Ok(()) => self
                    .handle
                    .copy_messages(&[uid], destination.path())
                    .await
                    .map_err(CoreError::from),
                Err(e) => Err(e),
            }
        };

        destination.release().await;
        copied?;
        info!("Copied UID {} from {} to {}", uid, self.path, destination.path);
        Ok(())
    }

    /// Copy `message` into the folder mapped to `role`
    pub async fn copy_to_special(&self, message: &Message, role: SpecialUse) -> CoreResult<()> {
        let destination = self.account()?.special_folder(role)?;
        self.copy(message, &destination).await
    }

    /// Remove `uid`, keeping a copy in Trash unless this is Trash
    ///
    /// Returns `false` when the server refused or the message is gone.
    pub async fn delete(self: &Arc<Self>, uid: u32) -> CoreResult<bool> {
        match self.delete_message(uid).await {
            Ok(()) => Ok(true),
            Err(CoreError::NoConnectionEstablished) => Err(CoreError::NoConnectionEstablished),
            Err(e) => {
                warn!("Deleting UID {} from {} failed: {}", uid, self.path, e);
                Ok(false)
            }
        }
    }

    async fn delete_message(self: &Arc<Self>, uid: u32) -> CoreResult<()> {
        let message = self.message(uid).await?;

        match self.account()?.special_folder(SpecialUse::Trash) {
            Ok(trash) if Arc::ptr_eq(&trash, self) => {}
            Ok(trash) => self.copy(&message, &trash).await?,
            Err(CoreError::FolderNotFound(e)) => {
                warn!("No Trash for {}, deleting without a copy: {}", self.path, e);
            }
            Err(e) => return Err(e),
        }

        self.expunge_message(uid).await
    }

    /// Mark `uid` deleted and expunge
    async fn expunge_message(&self, uid: u32) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_mode(&mut state, OpenMode::ReadWrite).await?;
        self.handle.mark_deleted(uid).await?;
        self.handle.expunge().await?;
        info!("Deleted UID {} from {}", uid, self.path);
        Ok(())
    }

    /// Copy into `destination`, then remove here without a Trash copy
    ///
    /// Returns `false` when the copy landed but the removal failed.
    pub async fn move_message(&self, message: &Message, destination: &Arc<Folder>) -> CoreResult<bool> {
        let uid = message.uid().ok_or(CoreError::UidUnavailable)?;
        self.copy(message, destination).await?;
        match self.expunge_message(uid).await {
            Ok(()) => Ok(true),
            Err(CoreError::NoConnectionEstablished) => Err(CoreError::NoConnectionEstablished),
            Err(e) => {
                warn!("Removing moved UID {} from {} failed: {}", uid, self.path, e);
                Ok(false)
            }
        }
    }

    /// Register `listener` for change events, starting the notifier on first use
    pub async fn subscribe(&self, listener: Arc<dyn FolderListener>) -> CoreResult<()> {
        self.check_open()?;
        let notifier = {
            let mut slot = self.notifier.lock().await;
            match slot.as_ref() {
                Some(notifier) => notifier.clone(),
                None => {
                    let notifier = FolderChangeNotifier::start(
                        self.context.clone(),
                        self.notifier_handle.clone(),
                    )
                    .await?;
                    *slot = Some(notifier.clone());
                    notifier
                }
            }
        };
        notifier.add_listener(listener).await
    }

    /// Returns whether `listener` was subscribed. The last one out cancels
    /// polling.
    pub async fn unsubscribe(&self, listener: &Arc<dyn FolderListener>) -> bool {
        let Some(notifier) = self.notifier.lock().await.clone() else {
            return false;
        };

        let removed = notifier.remove_listener(listener);
        if removed && notifier.listener_count() == 0 {
            self.context.watch_manager().unwatch(&self.path).await;
        }
        removed
    }

    /// Leave the direct handle's mailbox, keeping its connection
    async fn release(&self) {
        let mut state = self.state.lock().await;
        if *state == HandleState::Closed {
            return;
        }
        if let Err(e) = self.handle.unselect(true).await {
            warn!("Closing {} failed: {}", self.path, e);
        }
        *state = HandleState::Closed;
    }

    /// Stop watching, close the notifier and the direct handle
    pub async fn close(&self) -> CoreResult<()> {
        self.context.watch_manager().stop_watching(&self.path).await;

        let notifier = self.notifier.lock().await.take();
        if let Some(notifier) = notifier {
            notifier.close().await?;
        }

        let mut state = self.state.lock().await;
        if *state != HandleState::Closed {
            let result = self.handle.close(true).await;
            *state = HandleState::Closed;
            result?;
        }
        debug!("Closed folder {}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert_eq!(
            HandleState::Closed.transition(OpenMode::ReadOnly),
            Transition::Open
        );
        assert_eq!(
            HandleState::OpenReadOnly.transition(OpenMode::ReadOnly),
            Transition::Keep
        );
        assert_eq!(
            HandleState::OpenReadOnly.transition(OpenMode::ReadWrite),
            Transition::Reopen
        );
        assert_eq!(
            HandleState::OpenReadWrite.transition(OpenMode::ReadOnly),
            Transition::Reopen
        );
    }

    #[test]
    fn test_state_from_mode() {
        assert_eq!(
            HandleState::from(OpenMode::ReadWrite),
            HandleState::OpenReadWrite
        );
        assert_eq!(HandleState::OpenReadOnly.mode(), Some(OpenMode::ReadOnly));
        assert_eq!(HandleState::Closed.mode(), None);
    }
}
