//! Capability traits for persistence.
//!
//! The scheduler and ingestion pipeline only ever talk to these traits;
//! `LibSqlStore` is the production implementation and tests substitute
//! fakes where failure injection is needed.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{ProcessedEmailRecord, WorkItem};

/// Store of work items with claim and conditional-update operations.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Claim up to `chunk_size` eligible items, oldest first.
    ///
    /// Eligible means `processed = false`, `retry_count < max_retry`, and not
    /// currently claimed by another live claimer. This is the system's sole
    /// concurrency-control boundary: two concurrent claims must never return
    /// the same item, and a claim never blocks waiting on rows held
    /// elsewhere — it skips them. Claiming is a lock acquisition, not a
    /// state transition; items are released by `update_item`.
    async fn claim_next_batch(
        &self,
        max_retry: u32,
        chunk_size: u32,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Read the current row for an item, if it still exists.
    async fn get_item(&self, id: i64) -> Result<Option<WorkItem>, StoreError>;

    /// Atomic single-row update of status, processed flag, retry count, and
    /// failure reason. Releases any claim on the row.
    ///
    /// Performs no retry-bound validation — the caller must have checked
    /// `retry_count` against the configured maximum already. Returns the
    /// number of rows affected: 0 means the row no longer exists, 1 is
    /// success, anything else is a consistency violation the caller must
    /// surface rather than retry.
    async fn update_item(
        &self,
        id: i64,
        status: &str,
        processed: bool,
        retry_count: u32,
        failure_reason: Option<&str>,
    ) -> Result<u64, StoreError>;

    /// Insert a new item in the `NEW` state. The external producer's side of
    /// the table; used here for seeding and tests.
    async fn insert_item(&self, name: &str) -> Result<WorkItem, StoreError>;
}

/// Append-only ledger of (message, work item) pairs already ingested.
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    /// Whether the pair has already been recorded.
    async fn exists(&self, message_id: &str, work_item_id: i64) -> Result<bool, StoreError>;

    /// Record the pair. A uniqueness-constraint violation (two ingestions
    /// racing for the same pair) is treated as success — the dedup fact is
    /// already established. Any other error propagates so the caller leaves
    /// the remote message unmarked and re-checks it on the next poll.
    async fn record(&self, message_id: &str, work_item_id: i64) -> Result<(), StoreError>;

    /// All pairs recorded for one work item, oldest first.
    async fn records_for_item(
        &self,
        work_item_id: i64,
    ) -> Result<Vec<ProcessedEmailRecord>, StoreError>;
}
