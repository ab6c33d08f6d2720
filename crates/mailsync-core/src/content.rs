//! Main-body extraction from a MIME tree
//!
//! Produces one best-effort text body: `text/plain` as is, HTML preferred
//! inside `multipart/alternative`, the first child of any other multipart.

use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::warn;

/// Extracted body text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    /// The text came from a `text/html` part
    pub is_html: bool,
}

/// Body text of a raw RFC 822 message
///
/// With `peek`, a multipart message contributes only its first body part.
pub fn extract(raw: &[u8], peek: bool) -> String {
    extract_text(raw, peek).text
}

pub fn extract_text(raw: &[u8], peek: bool) -> ExtractedText {
    let Some(message) = MessageParser::default().parse(raw) else {
        warn!("Message could not be parsed, no content extracted");
        return ExtractedText::default();
    };
    Walker { message: &message }.message_text(peek)
}

fn mime_type(part: &MessagePart<'_>) -> (String, String) {
    match part.content_type() {
        Some(ct) => (
            ct.ctype().to_ascii_lowercase(),
            ct.subtype().unwrap_or_default().to_ascii_lowercase(),
        ),
        None => match part.body {
            PartType::Multipart(_) => ("multipart".to_string(), "mixed".to_string()),
            _ => ("text".to_string(), "plain".to_string()),
        },
    }
}

fn part_text(part: &MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.to_string(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        PartType::Message(_) | PartType::Multipart(_) => String::new(),
    }
}

struct Walker<'a, 'x> {
    message: &'a Message<'x>,
}

impl<'a, 'x> Walker<'a, 'x> {
    fn message_text(&self, peek: bool) -> ExtractedText {
        let Some(root) = self.message.parts.first() else {
            return ExtractedText::default();
        };

        match mime_type(root) {
            (ctype, subtype) if ctype == "text" && subtype == "plain" => ExtractedText {
                text: part_text(root),
                is_html: false,
            },
            (ctype, _) if ctype == "multipart" && peek => match self.children(root).first() {
                Some(first) => self.peek_text(first),
                None => ExtractedText::default(),
            },
            _ => self.text_of(root),
        }
    }

    fn children(&self, part: &MessagePart<'_>) -> Vec<&'a MessagePart<'x>> {
        match &part.body {
            PartType::Multipart(ids) => ids
                .iter()
                .filter_map(|id| self.message.parts.get(*id as usize))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn text_of(&self, part: &MessagePart<'_>) -> ExtractedText {
        let (ctype, subtype) = mime_type(part);
        match (ctype.as_str(), subtype.as_str()) {
            ("text", subtype) => ExtractedText {
                text: part_text(part),
                is_html: subtype == "html",
            },
            ("multipart", "alternative") => {
                let mut plain = None;
                for child in self.children(part) {
                    match mime_type(child) {
                        (c, s) if c == "text" && s == "plain" => {
                            if plain.is_none() {
                                plain = Some(self.text_of(child));
                            }
                        }
                        _ => return self.text_of(child),
                    }
                }
                plain.unwrap_or_default()
            }
            ("multipart", _) => match self.children(part).first() {
                Some(first) => self.text_of(first),
                None => ExtractedText::default(),
            },
            (ctype, subtype) => {
                warn!("{}/{} is not supported", ctype, subtype);
                ExtractedText::default()
            }
        }
    }

    /// First leaf only, no alternative selection
    fn peek_text(&self, part: &MessagePart<'_>) -> ExtractedText {
        let (ctype, subtype) = mime_type(part);
        match ctype.as_str() {
            "text" => ExtractedText {
                text: part_text(part),
                is_html: subtype == "html",
            },
            "multipart" => match self.children(part).first() {
                Some(first) => self.peek_text(first),
                None => ExtractedText::default(),
            },
            _ => {
                warn!("{}/{} is not supported", ctype, subtype);
                ExtractedText::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternative(first: (&str, &str), second: (&str, &str)) -> String {
        format!(
            "From: a@example.com\r\n\
Subject: alt\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: {}; charset=utf-8\r\n\
\r\n\
{}\r\n\
--b1\r\n\
Content-Type: {}; charset=utf-8\r\n\
\r\n\
{}\r\n\
--b1--\r\n",
            first.0, first.1, second.0, second.1
        )
    }

    #[test]
    fn test_plain_message() {
        let raw = b"From: a@example.com\r\nSubject: s\r\nContent-Type: text/plain\r\n\r\nbody\r\n";
        let extracted = extract_text(raw, false);
        assert_eq!(extracted.text.trim_end(), "body");
        assert!(!extracted.is_html);
        assert_eq!(extract(raw, true).trim_end(), "body");
    }

    #[test]
    fn test_message_without_content_type() {
        let raw = b"From: a@example.com\r\nSubject: s\r\n\r\nhello\r\n";
        assert_eq!(extract(raw, false).trim_end(), "hello");
    }

    #[test]
    fn test_alternative_prefers_html_in_any_order() {
        let plain_first = alternative(("text/plain", "plain"), ("text/html", "<p>html</p>"));
        let html_first = alternative(("text/html", "<p>html</p>"), ("text/plain", "plain"));

        for raw in [plain_first, html_first] {
            let extracted = extract_text(raw.as_bytes(), false);
            assert_eq!(extracted.text.trim_end(), "<p>html</p>");
            assert!(extracted.is_html);
        }
    }

    #[test]
    fn test_peek_takes_first_part() {
        let raw = alternative(("text/plain", "plain"), ("text/html", "<p>html</p>"));
        let extracted = extract_text(raw.as_bytes(), true);
        assert_eq!(extracted.text.trim_end(), "plain");
        assert!(!extracted.is_html);
    }

    #[test]
    fn test_mixed_uses_first_child() {
        let raw = "From: a@example.com\r\n\
Subject: mixed\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain\r\n\
--inner\r\n\
Content-Type: text/html\r\n\
\r\n\
<b>rich</b>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--outer--\r\n";

        let extracted = extract_text(raw.as_bytes(), false);
        assert_eq!(extracted.text.trim_end(), "<b>rich</b>");
        assert!(extracted.is_html);
    }

    #[test]
    fn test_html_top_level() {
        let raw = b"From: a@example.com\r\nContent-Type: text/html\r\n\r\n<i>hi</i>\r\n";
        let extracted = extract_text(raw, false);
        assert_eq!(extracted.text.trim_end(), "<i>hi</i>");
        assert!(extracted.is_html);
    }

    #[test]
    fn test_unsupported_type_is_empty() {
        let raw = b"From: a@example.com\r\n\
Content-Type: application/octet-stream\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
AAEC\r\n";
        assert_eq!(extract(raw, false), "");
    }
}
