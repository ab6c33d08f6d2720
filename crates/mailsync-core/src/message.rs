//! Live message wrapper

use std::sync::Arc;

use mailsync_imap::{MessageData, MessageFlags};

use crate::content;
use crate::envelope::Envelope;
use crate::error::{CoreError, CoreResult};
use crate::folder::Folder;

/// Body bytes fetched for a preview
pub const PREVIEW_BYTES: usize = 16 * 1024;

/// One message as last fetched from its folder
///
/// Holds no server state of its own; every content read goes back to the
/// folder.
#[derive(Clone)]
pub struct Message {
    folder: Arc<Folder>,
    data: MessageData,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("folder", &self.folder.path())
            .field("uid", &self.data.uid)
            .field("message_id", &self.data.message_id)
            .finish()
    }
}

impl Message {
    pub(crate) fn new(folder: Arc<Folder>, data: MessageData) -> Self {
        Self { folder, data }
    }

    pub fn uid(&self) -> Option<u32> {
        self.data.uid
    }

    pub fn message_id(&self) -> Option<&str> {
        self.data.message_id.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.data.subject()
    }

    pub fn is_expunged(&self) -> bool {
        self.data.expunged
    }

    pub fn flags(&self) -> &MessageFlags {
        &self.data.flags
    }

    pub fn folder(&self) -> &Arc<Folder> {
        &self.folder
    }

    pub fn data(&self) -> &MessageData {
        &self.data
    }

    /// Main body text; may mark the message seen
    pub async fn content(&self) -> CoreResult<String> {
        let uid = self.readable_uid()?;
        let raw = self.folder.read_body(uid).await?;
        Ok(content::extract(&raw, false))
    }

    /// First body part only, from at most [`PREVIEW_BYTES`] of the body;
    /// never marks the message seen
    pub async fn content_peek(&self) -> CoreResult<String> {
        let uid = self.readable_uid()?;
        let raw = self.folder.read_preview(uid, PREVIEW_BYTES).await?;
        Ok(content::extract(&raw, true))
    }

    fn readable_uid(&self) -> CoreResult<u32> {
        let uid = self.data.uid.ok_or(CoreError::UidUnavailable)?;
        if self.data.expunged {
            return Err(CoreError::MessageDeleted(uid));
        }
        Ok(uid)
    }

    pub fn envelope(&self) -> CoreResult<Envelope> {
        Envelope::from_message(&self.data, self.folder.account_identity())
    }

    /// Envelope with the peeked body filled in
    pub async fn envelope_with_peek(&self) -> CoreResult<Envelope> {
        let envelope = self.envelope()?;
        if self.data.expunged {
            return Ok(envelope);
        }
        Ok(envelope.with_content_peek(self.content_peek().await?))
    }

    /// Delete from the folder, keeping a copy in Trash
    pub async fn delete(&self) -> CoreResult<bool> {
        let uid = self.data.uid.ok_or(CoreError::UidUnavailable)?;
        self.folder.delete(uid).await
    }
}
