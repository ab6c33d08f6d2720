//! IMAP message types

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use mail_parser::{Addr, Address, MessageParser};

/// Email message flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFlags {
    /// Message has been read
    pub seen: bool,
    /// Message has been answered
    pub answered: bool,
    /// Message is flagged/starred
    pub flagged: bool,
    /// Message is marked for deletion
    pub deleted: bool,
    /// Message is a draft
    pub draft: bool,
    /// First session to see the message
    pub recent: bool,
    /// Keywords (Gmail labels, etc.)
    pub custom: BTreeSet<String>,
}

impl MessageFlags {
    /// Parse flags from their IMAP string form
    pub fn from_imap_flags(flags: &[&str]) -> Self {
        let mut result = MessageFlags::default();

        for flag in flags {
            match flag.to_lowercase().as_str() {
                "\\seen" => result.seen = true,
                "\\answered" => result.answered = true,
                "\\flagged" => result.flagged = true,
                "\\deleted" => result.deleted = true,
                "\\draft" => result.draft = true,
                "\\recent" => result.recent = true,
                _ => {
                    result.custom.insert(flag.to_string());
                }
            }
        }

        result
    }

    /// Collect flags from an async-imap FETCH response
    pub fn from_fetch<'a>(flags: impl Iterator<Item = async_imap::types::Flag<'a>>) -> Self {
        use async_imap::types::Flag;

        let mut result = MessageFlags::default();
        for flag in flags {
            match flag {
                Flag::Seen => result.seen = true,
                Flag::Answered => result.answered = true,
                Flag::Flagged => result.flagged = true,
                Flag::Deleted => result.deleted = true,
                Flag::Draft => result.draft = true,
                Flag::Recent => result.recent = true,
                Flag::MayCreate => {}
                Flag::Custom(name) => {
                    result.custom.insert(name.to_string());
                }
            }
        }
        result
    }

    /// Convert to IMAP flag strings for STORE command
    pub fn to_imap_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();

        if self.seen {
            flags.push("\\Seen".to_string());
        }
        if self.answered {
            flags.push("\\Answered".to_string());
        }
        if self.flagged {
            flags.push("\\Flagged".to_string());
        }
        if self.deleted {
            flags.push("\\Deleted".to_string());
        }
        if self.draft {
            flags.push("\\Draft".to_string());
        }

        flags.extend(self.custom.iter().cloned());
        flags
    }
}

/// Email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub address: String,
}

impl EmailAddress {
    pub fn new(name: Option<String>, address: String) -> Self {
        Self { name, address }
    }

    /// Format as "Name <address>" or just "address"
    pub fn to_display_string(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.address),
            _ => self.address.clone(),
        }
    }

    fn from_addr(addr: &Addr<'_>) -> Option<Self> {
        let address = addr.address.as_ref()?;
        Some(Self::new(
            addr.name.as_ref().map(|n| n.to_string()),
            address.to_string(),
        ))
    }

    fn list(address: Option<&Address<'_>>) -> Vec<Self> {
        match address {
            Some(Address::List(list)) => list.iter().filter_map(Self::from_addr).collect(),
            Some(Address::Group(groups)) => groups
                .iter()
                .flat_map(|g| g.addresses.iter())
                .filter_map(Self::from_addr)
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// Header fields of one message, decoded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSummary {
    pub subject: Option<String>,
    pub from: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Vec<EmailAddress>,
    /// Newsgroups header, split on commas
    pub newsgroups: Vec<String>,
    /// Date header
    pub date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
}

impl HeaderSummary {
    /// Parse a header block (or a full message) with mail-parser
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let message = MessageParser::default().parse(raw)?;

        let newsgroups = message
            .header_raw("Newsgroups")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            subject: message.subject().map(str::to_string),
            from: EmailAddress::list(message.from()),
            to: EmailAddress::list(message.to()),
            cc: EmailAddress::list(message.cc()),
            bcc: EmailAddress::list(message.bcc()),
            reply_to: EmailAddress::list(message.reply_to()),
            newsgroups,
            date: message
                .date()
                .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
            message_id: message.message_id().map(str::to_string),
        })
    }
}

/// One message as seen by a mailbox handle
///
/// `headers` is `None` when the server did not return metadata, and always
/// for expunged messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    /// Server-assigned UID; `None` if the server could not supply one
    pub uid: Option<u32>,
    pub message_id: Option<String>,
    /// Full path of the mailbox holding the message
    pub folder: String,
    pub expunged: bool,
    pub flags: MessageFlags,
    /// INTERNALDATE
    pub received_at: Option<DateTime<Utc>>,
    pub headers: Option<HeaderSummary>,
}

impl MessageData {
    /// A live message with its metadata
    pub fn new(
        uid: u32,
        folder: impl Into<String>,
        flags: MessageFlags,
        received_at: Option<DateTime<Utc>>,
        headers: Option<HeaderSummary>,
    ) -> Self {
        Self {
            uid: Some(uid),
            message_id: headers.as_ref().and_then(|h| h.message_id.clone()),
            folder: folder.into(),
            expunged: false,
            flags,
            received_at,
            headers,
        }
    }

    /// A message that left the mailbox; only identity survives
    pub fn expunged(uid: u32, message_id: Option<String>, folder: impl Into<String>) -> Self {
        Self {
            uid: Some(uid),
            message_id,
            folder: folder.into(),
            expunged: true,
            flags: MessageFlags::default(),
            received_at: None,
            headers: None,
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.headers.as_ref()?.subject.as_deref()
    }
}
