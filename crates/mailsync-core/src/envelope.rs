//! Normalized message envelope

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use mailsync_imap::{EmailAddress, MessageData};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Stable-identity summary of one message
///
/// An expunged message yields a degraded envelope: only `uid`, `message_id`,
/// `folder_path`, `expunged` and `owning_account_identity` are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub uid: Option<u32>,
    pub message_id: Option<String>,
    pub from: Option<Vec<String>>,
    pub to: Option<Vec<String>>,
    pub cc: Option<Vec<String>>,
    pub bcc: Option<Vec<String>>,
    pub newsgroup: Option<Vec<String>>,
    pub reply_to: Option<Vec<String>>,
    /// Date header
    pub sent_at: Option<DateTime<Utc>>,
    /// Arrival time on the server
    pub received_at: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub folder_path: String,
    pub expunged: bool,
    pub answered: Option<bool>,
    pub deleted: Option<bool>,
    pub draft: Option<bool>,
    pub flagged: Option<bool>,
    pub recent: Option<bool>,
    pub seen: Option<bool>,
    pub owning_account_identity: String,
    pub content_peek: Option<String>,
}

fn addresses(list: &[EmailAddress]) -> Vec<String> {
    list.iter().map(EmailAddress::to_display_string).collect()
}

impl Envelope {
    /// Build the envelope of `message`, owned by `account_identity`
    pub fn from_message(message: &MessageData, account_identity: &str) -> CoreResult<Self> {
        if message.expunged {
            return Ok(Self::expunged(message, account_identity));
        }

        let headers = message.headers.as_ref().ok_or_else(|| {
            CoreError::Conversion(format!(
                "no headers for message {:?} in {}",
                message.uid, message.folder
            ))
        })?;
        let flags = &message.flags;

        Ok(Self {
            uid: message.uid,
            message_id: message.message_id.clone(),
            from: Some(addresses(&headers.from)),
            to: Some(addresses(&headers.to)),
            cc: Some(addresses(&headers.cc)),
            bcc: Some(addresses(&headers.bcc)),
            newsgroup: Some(headers.newsgroups.clone()),
            reply_to: Some(addresses(&headers.reply_to)),
            sent_at: headers.date,
            received_at: message.received_at,
            subject: headers.subject.clone(),
            folder_path: message.folder.clone(),
            expunged: false,
            answered: Some(flags.answered),
            deleted: Some(flags.deleted),
            draft: Some(flags.draft),
            flagged: Some(flags.flagged),
            recent: Some(flags.recent),
            seen: Some(flags.seen),
            owning_account_identity: account_identity.to_string(),
            content_peek: None,
        })
    }

    fn expunged(message: &MessageData, account_identity: &str) -> Self {
        Self {
            uid: message.uid,
            message_id: message.message_id.clone(),
            from: None,
            to: None,
            cc: None,
            bcc: None,
            newsgroup: None,
            reply_to: None,
            sent_at: None,
            received_at: None,
            subject: None,
            folder_path: message.folder.clone(),
            expunged: true,
            answered: None,
            deleted: None,
            draft: None,
            flagged: None,
            recent: None,
            seen: None,
            owning_account_identity: account_identity.to_string(),
            content_peek: None,
        }
    }

    pub fn with_content_peek(mut self, peek: impl Into<String>) -> Self {
        self.content_peek = Some(peek.into());
        self
    }

    /// Total order by arrival for `sort_by`; a missing date sorts lowest
    pub fn compare_received(&self, other: &Self) -> Ordering {
        self.received_at.cmp(&other.received_at)
    }
}

/// Envelopes compare by arrival. Distinct envelopes received at the same
/// instant are unordered.
impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare_received(other) {
            Ordering::Equal if self != other => None,
            ordering => Some(ordering),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mailsync_imap::{HeaderSummary, MessageFlags};

    const RAW: &[u8] = b"From: Jane Doe <jane@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Cc: dave@example.com\r\n\
Newsgroups: comp.lang.rust, comp.mail.imap\r\n\
Subject: Lunch\r\n\
Date: Mon, 2 Mar 2026 10:00:00 +0000\r\n\
Message-ID: <lunch@example.com>\r\n\
\r\n\
Noon?\r\n";

    fn live(received: Option<DateTime<Utc>>) -> MessageData {
        let flags = MessageFlags::from_imap_flags(&["\\Seen", "\\Flagged"]);
        MessageData::new(7, "INBOX", flags, received, HeaderSummary::parse(RAW))
    }

    #[test]
    fn test_live_envelope() {
        let envelope = Envelope::from_message(&live(None), "jane@example.com").unwrap();

        assert_eq!(envelope.uid, Some(7));
        assert_eq!(envelope.message_id.as_deref(), Some("lunch@example.com"));
        assert_eq!(envelope.from, Some(vec!["Jane Doe <jane@example.com>".to_string()]));
        assert_eq!(
            envelope.to,
            Some(vec![
                "bob@example.com".to_string(),
                "Carol <carol@example.com>".to_string()
            ])
        );
        assert_eq!(
            envelope.newsgroup,
            Some(vec!["comp.lang.rust".to_string(), "comp.mail.imap".to_string()])
        );
        assert_eq!(envelope.subject.as_deref(), Some("Lunch"));
        assert_eq!(
            envelope.sent_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap())
        );
        assert_eq!(envelope.seen, Some(true));
        assert_eq!(envelope.flagged, Some(true));
        assert_eq!(envelope.answered, Some(false));
        assert_eq!(envelope.folder_path, "INBOX");
        assert!(!envelope.expunged);
        assert_eq!(envelope.content_peek, None);
    }

    #[test]
    fn test_expunged_envelope_keeps_identity_only() {
        let message = MessageData::expunged(9, Some("gone@example.com".into()), "Archive");
        let envelope = Envelope::from_message(&message, "jane@example.com").unwrap();

        assert!(envelope.expunged);
        assert_eq!(envelope.uid, Some(9));
        assert_eq!(envelope.message_id.as_deref(), Some("gone@example.com"));
        assert_eq!(envelope.folder_path, "Archive");
        assert_eq!(envelope.owning_account_identity, "jane@example.com");
        assert!(envelope.from.is_none());
        assert!(envelope.subject.is_none());
        assert!(envelope.seen.is_none());
        assert!(envelope.received_at.is_none());
    }

    #[test]
    fn test_missing_headers_fail_conversion() {
        let message = MessageData::new(1, "INBOX", MessageFlags::default(), None, None);
        assert!(matches!(
            Envelope::from_message(&message, "jane@example.com"),
            Err(CoreError::Conversion(_))
        ));
    }

    #[test]
    fn test_compare_received() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let mut envelopes = vec![
            Envelope::from_message(&live(Some(late)), "a").unwrap(),
            Envelope::from_message(&live(None), "a").unwrap(),
            Envelope::from_message(&live(Some(early)), "a").unwrap(),
        ];

        envelopes.sort_by(Envelope::compare_received);
        let dates: Vec<_> = envelopes.iter().map(|e| e.received_at).collect();
        assert_eq!(dates, vec![None, Some(early), Some(late)]);
    }

    #[test]
    fn test_partial_order_by_received() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let first = Envelope::from_message(&live(Some(early)), "a").unwrap();
        let second = Envelope::from_message(&live(Some(late)), "a").unwrap();

        assert!(first < second);
        assert!(second > first);
        assert_eq!(first.partial_cmp(&first.clone()), Some(Ordering::Equal));

        let twin = first.clone().with_content_peek("other");
        assert_eq!(first.partial_cmp(&twin), None);
    }

    #[test]
    fn test_serializes_camel_case() {
        let envelope = Envelope::from_message(&live(None), "jane@example.com")
            .unwrap()
            .with_content_peek("Noon?");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["folderPath"], "INBOX");
        assert_eq!(json["owningAccountIdentity"], "jane@example.com");
        assert_eq!(json["contentPeek"], "Noon?");
    }
}
