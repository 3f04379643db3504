//! Per-item processing and the retry state machine.
//!
//! State machine per item:
//! `NEW → (claimed) → Completed (terminal)
//!                  | Error, retryable (re-enters the claim pool next tick)
//!                  | Error, exhausted (terminal, never claimed again)`

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{ProcessError, StoreError};
use crate::ingest::EmailIngestion;
use crate::model::{STATUS_COMPLETED, STATUS_ERROR, WorkItem};
use crate::store::WorkItemStore;

/// Orchestrates ingestion for one claimed item and reconciles its terminal
/// state back into the store.
pub struct WorkItemProcessor {
    store: Arc<dyn WorkItemStore>,
    ingestion: Arc<EmailIngestion>,
    max_retry: u32,
}

impl WorkItemProcessor {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        ingestion: Arc<EmailIngestion>,
        max_retry: u32,
    ) -> Self {
        Self {
            store,
            ingestion,
            max_retry,
        }
    }

    /// Process one claimed item end to end.
    ///
    /// An ingestion failure is absorbed into a retry transition and is not
    /// an error of this call; the returned `Err` covers conditions the
    /// batch must surface per item — retry exhaustion and store failures
    /// during the transition itself.
    pub async fn process(&self, item: &WorkItem) -> Result<(), ProcessError> {
        match self.ingestion.ingest(item).await {
            Ok(recorded) => {
                self.mark_processed(item.id).await?;
                info!(item_id = item.id, recorded, "Work item processed successfully");
                Ok(())
            }
            Err(e) => {
                error!(item_id = item.id, "Failed to process work item: {e}");
                self.mark_failed(item.id, &e.to_string()).await
            }
        }
    }

    /// Transition an item to terminal success: `Completed`, processed,
    /// retry count reset to zero, failure reason cleared.
    pub async fn mark_processed(&self, id: i64) -> Result<(), ProcessError> {
        self.transition(id, STATUS_COMPLETED, true, 0, None).await
    }

    /// Transition an item to the retry state: `Error`, unprocessed, retry
    /// count incremented by one.
    ///
    /// Raises [`ProcessError::RetryExhausted`] instead of writing a retry
    /// count past the configured maximum; the item keeps its last state.
    pub async fn mark_failed(&self, id: i64, failure_reason: &str) -> Result<(), ProcessError> {
        warn!(item_id = id, failure_reason, "Work item marked as failed");
        self.transition(id, STATUS_ERROR, false, 1, Some(failure_reason))
            .await
    }

    /// Shared conditional transition. Re-reads the current retry count
    /// before writing so the bound is enforced against the live row, not
    /// the possibly stale claimed snapshot.
    async fn transition(
        &self,
        id: i64,
        status: &str,
        processed: bool,
        increment: u32,
        failure_reason: Option<&str>,
    ) -> Result<(), ProcessError> {
        let current = self
            .store
            .get_item(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let new_retry_count = if processed {
            // Success always resets the budget.
            0
        } else {
            let incremented = current.retry_count + increment;
            if incremented > self.max_retry {
                error!(item_id = id, max_retry = self.max_retry, "Max retry count exceeded");
                return Err(ProcessError::RetryExhausted {
                    id,
                    max_retry: self.max_retry,
                });
            }
            incremented
        };

        let rows = self
            .store
            .update_item(id, status, processed, new_retry_count, failure_reason)
            .await?;

        match rows {
            1 => Ok(()),
            0 => Err(StoreError::NotFound(id).into()),
            other => Err(StoreError::Consistency { id, rows: other }.into()),
        }
    }
}
