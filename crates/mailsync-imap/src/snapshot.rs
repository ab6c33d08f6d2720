//! Point-in-time view of a mailbox, used to turn NOOP/IDLE wakeups into
//! added/removed/changed events

use std::collections::BTreeMap;

use crate::folder::MessageCountKind;
use crate::message::MessageFlags;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    flags: MessageFlags,
    message_id: Option<String>,
}

/// UID → flags for every message currently in the mailbox
#[derive(Debug, Clone, Default)]
pub struct MailboxSnapshot {
    entries: BTreeMap<u32, Entry>,
}

/// Difference between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<u32>,
    /// Removed UIDs with the Message-ID last known for them
    pub removed: Vec<(u32, Option<String>)>,
    pub changed: Vec<u32>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl MailboxSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uid: u32, flags: MessageFlags, message_id: Option<String>) {
        self.entries.insert(uid, Entry { flags, message_id });
    }

    /// Keep the Message-ID learned from a metadata fetch
    pub fn set_message_id(&mut self, uid: u32, message_id: Option<String>) {
        if let Some(entry) = self.entries.get_mut(&uid) {
            entry.message_id = message_id;
        }
    }

    pub fn message_id(&self, uid: u32) -> Option<&str> {
        self.entries.get(&uid)?.message_id.as_deref()
    }

    pub fn flags(&self, uid: u32) -> Option<&MessageFlags> {
        self.entries.get(&uid).map(|e| &e.flags)
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.entries.contains_key(&uid)
    }

    pub fn uids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: MessageCountKind) -> u32 {
        let n = match kind {
            MessageCountKind::All => self.entries.len(),
            MessageCountKind::New => self.entries.values().filter(|e| e.flags.recent).count(),
            MessageCountKind::Unread => self.entries.values().filter(|e| !e.flags.seen).count(),
            MessageCountKind::Deleted => self.entries.values().filter(|e| e.flags.deleted).count(),
        };
        n as u32
    }

    /// Compare `next` against `self`. Message-IDs known in `self` are carried
    /// over into `next` for UIDs present in both.
    pub fn diff(&self, next: &mut MailboxSnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for (uid, old) in &self.entries {
            match next.entries.get_mut(uid) {
                Some(new) => {
                    if new.message_id.is_none() {
                        new.message_id = old.message_id.clone();
                    }
                    if new.flags != old.flags {
                        diff.changed.push(*uid);
                    }
                }
                None => diff.removed.push((*uid, old.message_id.clone())),
            }
        }

        diff.added = next
            .entries
            .keys()
            .filter(|uid| !self.entries.contains_key(uid))
            .copied()
            .collect();

        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(list: &[&str]) -> MessageFlags {
        MessageFlags::from_imap_flags(list)
    }

    #[test]
    fn test_diff_detects_all_kinds() {
        let mut before = MailboxSnapshot::new();
        before.insert(1, flags(&[]), Some("a@x".into()));
        before.insert(2, flags(&["\\Seen"]), Some("b@x".into()));
        before.insert(3, flags(&[]), None);

        let mut after = MailboxSnapshot::new();
        after.insert(1, flags(&["\\Seen"]), None);
        after.insert(3, flags(&[]), None);
        after.insert(4, flags(&["\\Recent"]), None);

        let diff = before.diff(&mut after);
        assert_eq!(diff.added, vec![4]);
        assert_eq!(diff.removed, vec![(2, Some("b@x".to_string()))]);
        assert_eq!(diff.changed, vec![1]);
        assert_eq!(after.message_id(1), Some("a@x"));
    }

    #[test]
    fn test_empty_diff() {
        let mut a = MailboxSnapshot::new();
        a.insert(9, flags(&["\\Seen"]), None);
        let mut b = a.clone();
        assert!(a.diff(&mut b).is_empty());
    }

    #[test]
    fn test_counts() {
        let mut snap = MailboxSnapshot::new();
        snap.insert(1, flags(&["\\Seen"]), None);
        snap.insert(2, flags(&["\\Recent"]), None);
        snap.insert(3, flags(&["\\Seen", "\\Deleted"]), None);

        assert_eq!(snap.count(MessageCountKind::All), 3);
        assert_eq!(snap.count(MessageCountKind::New), 1);
        assert_eq!(snap.count(MessageCountKind::Unread), 1);
        assert_eq!(snap.count(MessageCountKind::Deleted), 1);
    }
}
