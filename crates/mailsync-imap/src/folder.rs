//! IMAP folder types

use serde::{Deserialize, Serialize};

/// Semantic role of a folder, independent of how the server names it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpecialUse {
    /// No special type, likely user-created
    None,
    /// The inbox of the account
    Inbox,
    /// Stores email to be kept
    Archive,
    /// Email that has not been sent yet
    Drafts,
    /// Spam, malware and other unwanted email
    Junk,
    /// Email waiting to be sent
    Outbox,
    /// Email that has been sent
    Sent,
    /// Email that is to be deleted
    Trash,
    /// A view of all email in the account
    AllMail,
    /// A view of all flagged/starred email
    Flagged,
    /// A view of email the server thinks is important
    Important,
    /// A view of email matching some search criteria
    Search,
    /// A folder with an application-defined use
    Custom,
}

impl SpecialUse {
    /// Every role, in declaration order
    pub const ALL: [SpecialUse; 13] = [
        SpecialUse::None,
        SpecialUse::Inbox,
        SpecialUse::Archive,
        SpecialUse::Drafts,
        SpecialUse::Junk,
        SpecialUse::Outbox,
        SpecialUse::Sent,
        SpecialUse::Trash,
        SpecialUse::AllMail,
        SpecialUse::Flagged,
        SpecialUse::Important,
        SpecialUse::Search,
        SpecialUse::Custom,
    ];

    /// Detect the role from IMAP special-use attributes (RFC 6154)
    /// Also matches without backslash prefix (some servers send "Trash" instead of "\Trash")
    pub fn from_attributes(attributes: &[String]) -> Option<Self> {
        for attr in attributes {
            let lower = attr.to_lowercase();
            let normalized = lower.trim_start_matches('\\');
            match normalized {
                "inbox" => return Some(SpecialUse::Inbox),
                "sent" => return Some(SpecialUse::Sent),
                "drafts" => return Some(SpecialUse::Drafts),
                "trash" => return Some(SpecialUse::Trash),
                "junk" => return Some(SpecialUse::Junk),
                "archive" => return Some(SpecialUse::Archive),
                "all" => return Some(SpecialUse::AllMail),
                "flagged" => return Some(SpecialUse::Flagged),
                "important" => return Some(SpecialUse::Important),
                _ => {}
            }
        }
        None
    }

    /// Sent and outbox folders hold outgoing mail
    pub fn is_outgoing(&self) -> bool {
        matches!(self, SpecialUse::Sent | SpecialUse::Outbox)
    }
}

/// A folder as reported by LIST
#[derive(Debug, Clone)]
pub struct FolderInfo {
    /// Full path including hierarchy delimiter
    pub path: String,
    /// Hierarchy delimiter (e.g., "/" for Gmail)
    pub delimiter: Option<char>,
    /// LIST attributes, special-use ones included
    pub attributes: Vec<String>,
}

impl FolderInfo {
    pub fn new(path: impl Into<String>, delimiter: Option<char>, attributes: Vec<String>) -> Self {
        Self {
            path: path.into(),
            delimiter,
            attributes,
        }
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        match self.delimiter {
            Some(d) => self.path.rsplit(d).next().unwrap_or(&self.path),
            None => &self.path,
        }
    }

    /// Role advertised by the server, if any
    pub fn special_use(&self) -> Option<SpecialUse> {
        if self.path.eq_ignore_ascii_case("INBOX") {
            return Some(SpecialUse::Inbox);
        }
        SpecialUse::from_attributes(&self.attributes)
    }

    /// Check if this folder can be selected
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|a| {
            let lower = a.to_lowercase();
            let normalized = lower.trim_start_matches('\\');
            normalized == "noselect" || normalized == "nonexistent"
        })
    }
}

/// Access mode of an open mailbox (SELECT vs EXAMINE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Message count categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageCountKind {
    All,
    New,
    Unread,
    Deleted,
}
