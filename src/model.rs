//! Core entity types shared across the store, ingestion, and scheduler.

use chrono::{DateTime, Utc};

/// Status label for a freshly created work item.
pub const STATUS_NEW: &str = "NEW";
/// Status label for a successfully processed work item.
pub const STATUS_COMPLETED: &str = "Completed";
/// Status label for a failed attempt.
pub const STATUS_ERROR: &str = "Error";

/// A unit of external work to correlate against inbound email.
///
/// Created by an external producer; this subsystem only mutates status,
/// processed flag, retry count, and failure reason through the store's
/// conditional update. Status is a free-form label owned by the producer,
/// so it stays a `String` rather than an enum.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: i64,
    pub name: String,
    pub status: String,
    /// Terminal flag: once true the item is never re-claimed.
    pub processed: bool,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted (message, work item) dedup fact.
///
/// At most one record ever exists per (message_id, work_item_id) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEmailRecord {
    pub message_id: String,
    pub work_item_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Canonical record of one inbound mail message.
///
/// Every field is optional because remote messages are not trusted to be
/// well-formed; a message without a `message_id` can never be deduplicated
/// and is skipped by ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailMessage {
    /// First Message-ID header value, if present.
    pub message_id: Option<String>,
    pub subject: Option<String>,
    /// First sender address, if the sender list is non-empty.
    pub from: Option<String>,
    /// Server-provided received timestamp, if any.
    pub received_at: Option<DateTime<Utc>>,
    /// Raw body text; no parsing beyond stringification.
    pub raw_body: Option<String>,
}
