//! Email ingestion — fetches correlated messages for one work item and
//! records them exactly once.
//!
//! Ordering invariant: a new pair is written to the ledger *before* the
//! remote message is flagged. A crash between the two leaves the message
//! unflagged remotely, which only costs a re-fetch (the ledger dedups it);
//! the reverse order could flag a message that was never recorded and
//! silently lose it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::MailError;
use crate::mail::{MailFlag, MailGateway};
use crate::model::WorkItem;
use crate::store::ProcessedLedger;

/// Fetches and persists new emails for individual work items.
pub struct EmailIngestion {
    gateway: Arc<dyn MailGateway>,
    ledger: Arc<dyn ProcessedLedger>,
}

impl EmailIngestion {
    pub fn new(gateway: Arc<dyn MailGateway>, ledger: Arc<dyn ProcessedLedger>) -> Self {
        Self { gateway, ledger }
    }

    /// Fetch messages correlated with `item` and persist the new ones.
    ///
    /// The item's id is the subject filter and its creation time the lower
    /// bound on received time. Returns the number of newly recorded
    /// messages. Transport/search failures propagate (the item will be
    /// marked failed and retried); per-message persistence failures are
    /// absorbed so one bad message never aborts its siblings.
    pub async fn ingest(&self, item: &WorkItem) -> Result<usize, MailError> {
        let subject = item.id.to_string();
        let messages = self
            .gateway
            .fetch(Some(&subject), Some(item.created_at))
            .await?;

        if messages.is_empty() {
            debug!(item_id = item.id, "No emails fetched");
            return Ok(0);
        }

        info!(
            item_id = item.id,
            count = messages.len(),
            "Fetched emails for work item"
        );

        let mut recorded = 0;
        for message in &messages {
            let Some(message_id) = message.message_id.as_deref() else {
                // Without a Message-ID the pair can never be deduplicated,
                // so it is neither persisted nor flagged.
                warn!(item_id = item.id, "Message has no Message-ID header, skipping");
                continue;
            };

            match self.ledger.exists(message_id, item.id).await {
                Ok(true) => {
                    debug!(item_id = item.id, message_id, "Email already recorded, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        item_id = item.id,
                        message_id, "Dedup check failed, leaving message for next poll: {e}"
                    );
                    continue;
                }
            }

            // Record first, then mark.
            if let Err(e) = self.ledger.record(message_id, item.id).await {
                error!(
                    item_id = item.id,
                    message_id, "Failed to record email, leaving it unflagged: {e}"
                );
                continue;
            }
            recorded += 1;

            if let Err(e) = self.gateway.set_flag(message_id, MailFlag::Seen).await {
                // Recorded but not flagged: the next poll re-fetches it and
                // the ledger absorbs the duplicate.
                warn!(
                    item_id = item.id,
                    message_id, "Recorded email but failed to flag it remotely: {e}"
                );
            }
        }

        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::EmailMessage;
    use crate::store::{LibSqlStore, WorkItemStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    /// Gateway fake: serves a fixed message list and records flag calls.
    struct FakeGateway {
        messages: Vec<EmailMessage>,
        flagged: Mutex<Vec<(String, MailFlag)>>,
        fail_fetch: bool,
    }

    impl FakeGateway {
        fn with_messages(messages: Vec<EmailMessage>) -> Self {
            Self {
                messages,
                flagged: Mutex::new(Vec::new()),
                fail_fetch: false,
            }
        }

        fn flagged_ids(&self) -> Vec<String> {
            self.flagged
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MailGateway for FakeGateway {
        async fn fetch(
            &self,
            _subject_filter: Option<&str>,
            _received_after: Option<DateTime<Utc>>,
        ) -> Result<Vec<EmailMessage>, MailError> {
            if self.fail_fetch {
                return Err(MailError::Search("mailbox unreachable".into()));
            }
            Ok(self.messages.clone())
        }

        async fn set_flag(&self, message_id: &str, flag: MailFlag) -> Result<(), MailError> {
            self.flagged
                .lock()
                .unwrap()
                .push((message_id.to_string(), flag));
            Ok(())
        }
    }

    /// Ledger fake whose writes always fail.
    struct BrokenLedger;

    #[async_trait]
    impl ProcessedLedger for BrokenLedger {
        async fn exists(&self, _message_id: &str, _work_item_id: i64) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn record(&self, _message_id: &str, _work_item_id: i64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        async fn records_for_item(
            &self,
            _work_item_id: i64,
        ) -> Result<Vec<crate::model::ProcessedEmailRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn message(id: &str) -> EmailMessage {
        EmailMessage {
            message_id: Some(id.to_string()),
            subject: Some("42".into()),
            from: Some("alice@example.com".into()),
            received_at: Some(Utc::now()),
            raw_body: Some("body".into()),
        }
    }

    #[tokio::test]
    async fn new_email_is_recorded_then_flagged() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let item = store.insert_item("order").await.unwrap();

        let gateway = Arc::new(FakeGateway::with_messages(vec![message("<m1@x>")]));
        let ingestion = EmailIngestion::new(gateway.clone(), store.clone());

        let recorded = ingestion.ingest(&item).await.unwrap();
        assert_eq!(recorded, 1);
        assert!(store.exists("<m1@x>", item.id).await.unwrap());
        assert_eq!(gateway.flagged_ids(), vec!["<m1@x>".to_string()]);
    }

    #[tokio::test]
    async fn second_ingest_is_idempotent() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let item = store.insert_item("order").await.unwrap();

        let gateway = Arc::new(FakeGateway::with_messages(vec![message("<m1@x>")]));
        let ingestion = EmailIngestion::new(gateway.clone(), store.clone());

        assert_eq!(ingestion.ingest(&item).await.unwrap(), 1);
        assert_eq!(ingestion.ingest(&item).await.unwrap(), 0);
        // The second pass saw the ledger hit and never re-flagged.
        assert_eq!(gateway.flagged_ids().len(), 1);
    }

    #[tokio::test]
    async fn message_without_id_is_never_persisted_or_flagged() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let item = store.insert_item("order").await.unwrap();

        let anonymous = EmailMessage {
            message_id: None,
            ..message("unused")
        };
        let gateway = Arc::new(FakeGateway::with_messages(vec![anonymous]));
        let ingestion = EmailIngestion::new(gateway.clone(), store.clone());

        assert_eq!(ingestion.ingest(&item).await.unwrap(), 0);
        assert!(gateway.flagged_ids().is_empty());
    }

    #[tokio::test]
    async fn record_failure_leaves_message_unflagged() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let item = store.insert_item("order").await.unwrap();

        let gateway = Arc::new(FakeGateway::with_messages(vec![
            message("<m1@x>"),
            message("<m2@x>"),
        ]));
        let ingestion = EmailIngestion::new(gateway.clone(), Arc::new(BrokenLedger));

        // Both writes fail, both messages stay unflagged, neither aborts.
        assert_eq!(ingestion.ingest(&item).await.unwrap(), 0);
        assert!(gateway.flagged_ids().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_propagates() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let item = store.insert_item("order").await.unwrap();

        let gateway = Arc::new(FakeGateway {
            messages: Vec::new(),
            flagged: Mutex::new(Vec::new()),
            fail_fetch: true,
        });
        let ingestion = EmailIngestion::new(gateway, store.clone());

        assert!(ingestion.ingest(&item).await.is_err());
    }

    #[tokio::test]
    async fn mixed_batch_processes_remaining_messages() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let item = store.insert_item("order").await.unwrap();

        let anonymous = EmailMessage {
            message_id: None,
            ..message("unused")
        };
        let gateway = Arc::new(FakeGateway::with_messages(vec![
            anonymous,
            message("<ok@x>"),
        ]));
        let ingestion = EmailIngestion::new(gateway.clone(), store.clone());

        assert_eq!(ingestion.ingest(&item).await.unwrap(), 1);
        assert!(store.exists("<ok@x>", item.id).await.unwrap());
        assert_eq!(gateway.flagged_ids(), vec!["<ok@x>".to_string()]);
    }
}
