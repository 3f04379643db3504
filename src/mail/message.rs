//! Mapping of raw RFC822 text into the canonical [`EmailMessage`] record.

use mail_parser::MessageParser;
use tracing::warn;

use crate::model::EmailMessage;

/// Map one raw message into an [`EmailMessage`].
///
/// Returns `None` when the message cannot be parsed at all; callers filter
/// those out so one malformed message never loses the rest of the batch.
/// Individual missing fields (no Message-ID, no sender, no date, no body)
/// map to `None` fields, not a mapping failure.
pub fn map_message(raw: &[u8]) -> Option<EmailMessage> {
    let parsed = match MessageParser::default().parse(raw) {
        Some(parsed) => parsed,
        None => {
            warn!("Failed to parse mail message, skipping");
            return None;
        }
    };

    let received_at = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0));

    let raw_body = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .or_else(|| parsed.body_html(0).map(|h| h.to_string()));

    Some(EmailMessage {
        message_id: parsed.message_id().map(str::to_string),
        subject: parsed.subject().map(str::to_string),
        from: parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(str::to_string),
        received_at,
        raw_body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Message-ID: <abc@example.com>\r\n\
        From: Alice <alice@example.com>\r\n\
        To: orders@example.com\r\n\
        Subject: 42\r\n\
        Date: Thu, 5 Mar 2026 10:00:00 +0000\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Order confirmed.\r\n";

    #[test]
    fn maps_all_fields() {
        let msg = map_message(SAMPLE.as_bytes()).unwrap();
        assert_eq!(msg.message_id.as_deref(), Some("abc@example.com"));
        assert_eq!(msg.subject.as_deref(), Some("42"));
        assert_eq!(msg.from.as_deref(), Some("alice@example.com"));
        assert!(msg.received_at.is_some());
        assert_eq!(msg.raw_body.as_deref().map(str::trim), Some("Order confirmed."));
    }

    #[test]
    fn missing_message_id_maps_to_none() {
        let raw = "From: bob@example.com\r\nSubject: x\r\n\r\nbody\r\n";
        let msg = map_message(raw.as_bytes()).unwrap();
        assert!(msg.message_id.is_none());
        assert_eq!(msg.subject.as_deref(), Some("x"));
    }

    #[test]
    fn missing_sender_maps_to_none() {
        let raw = "Message-ID: <x@y>\r\nSubject: s\r\n\r\nbody\r\n";
        let msg = map_message(raw.as_bytes()).unwrap();
        assert!(msg.from.is_none());
    }

    #[test]
    fn missing_date_maps_to_none() {
        let raw = "Message-ID: <x@y>\r\nSubject: s\r\n\r\nbody\r\n";
        let msg = map_message(raw.as_bytes()).unwrap();
        assert!(msg.received_at.is_none());
    }

    #[test]
    fn html_body_used_when_no_text_part() {
        let raw = "Message-ID: <h@y>\r\n\
            Subject: s\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>hello</p>\r\n";
        let msg = map_message(raw.as_bytes()).unwrap();
        assert!(msg.raw_body.is_some());
    }
}
