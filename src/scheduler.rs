//! Batch scheduler — periodic tick that drains the claim pool through a
//! bounded worker pool.
//!
//! Each tick repeatedly claims a bounded batch and waits for the whole
//! batch to finish before claiming the next, until a claim comes back
//! empty. The tick body completes before the next `tick().await`, so the
//! drain loop itself is what prevents overlapping ticks — no extra lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::config::BatchJobConfig;
use crate::processor::WorkItemProcessor;
use crate::store::WorkItemStore;

/// How long outstanding work may run after a stop before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct RunningJob {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

/// Owns the periodic timer and the worker pool.
pub struct BatchScheduler {
    config: BatchJobConfig,
    store: Arc<dyn WorkItemStore>,
    processor: Arc<WorkItemProcessor>,
    /// Worker pool size, fixed at construction to hardware parallelism.
    workers: usize,
    running: Mutex<Option<RunningJob>>,
}

impl BatchScheduler {
    pub fn new(
        config: BatchJobConfig,
        store: Arc<dyn WorkItemStore>,
        processor: Arc<WorkItemProcessor>,
    ) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            config,
            store,
            processor,
            workers,
            running: Mutex::new(None),
        }
    }

    /// Start the periodic job. Returns `false` (and does nothing) if it is
    /// already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if let Some(job) = running.as_ref() {
            if !job.handle.is_finished() {
                return false;
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let store = Arc::clone(&self.store);
        let processor = Arc::clone(&self.processor);
        let config = self.config.clone();
        let workers = self.workers;
        let task_shutdown = Arc::clone(&shutdown);
        let task_notify = Arc::clone(&notify);

        let handle = tokio::spawn(async move {
            info!(
                interval_ms = config.poll_interval_ms,
                chunk_size = config.chunk_size,
                workers,
                "Batch job started"
            );

            let mut tick = tokio::time::interval(config.poll_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = task_notify.notified() => break,
                }
                if task_shutdown.load(Ordering::Relaxed) {
                    break;
                }

                run_batch_cycle(&store, &processor, &config, workers, &task_shutdown).await;
            }
            info!("Batch job loop exited");
        });

        *running = Some(RunningJob {
            handle,
            shutdown,
            notify,
        });
        true
    }

    /// Stop the periodic job. Returns `false` (and does nothing) if it is
    /// not running.
    ///
    /// In-flight work gets a bounded grace period; whatever is still
    /// running after that is aborted.
    pub async fn stop(&self) -> bool {
        let job = {
            let mut running = self.running.lock().await;
            match running.take() {
                Some(job) => job,
                None => return false,
            }
        };

        job.shutdown.store(true, Ordering::Relaxed);
        job.notify.notify_one();

        let abort = job.handle.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, job.handle).await {
            Ok(_) => info!("Batch job stopped"),
            Err(_) => {
                warn!("Batch job did not stop within grace period, aborting");
                abort.abort();
            }
        }
        true
    }

    /// The job configuration this scheduler was built with.
    pub fn config(&self) -> &BatchJobConfig {
        &self.config
    }

    /// Whether the job loop is currently running.
    pub async fn is_running(&self) -> bool {
        let running = self.running.lock().await;
        running.as_ref().is_some_and(|job| !job.handle.is_finished())
    }

    /// Run one drain cycle immediately, outside the timer.
    pub async fn drain_once(&self) {
        let shutdown = AtomicBool::new(false);
        run_batch_cycle(
            &self.store,
            &self.processor,
            &self.config,
            self.workers,
            &shutdown,
        )
        .await;
    }
}

/// One tick: claim, fan out, wait, repeat until a claim returns empty.
async fn run_batch_cycle(
    store: &Arc<dyn WorkItemStore>,
    processor: &Arc<WorkItemProcessor>,
    config: &BatchJobConfig,
    workers: usize,
    shutdown: &AtomicBool,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let batch = match store
            .claim_next_batch(config.max_retry, config.chunk_size)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                // Transient store failure ends the tick; the next tick
                // re-claims without having incremented anything.
                error!("Failed to claim batch, ending tick: {e}");
                return;
            }
        };

        if batch.is_empty() {
            info!("No work items to process, exiting batch loop");
            return;
        }

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for item in batch {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let processor = Arc::clone(processor);
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = processor.process(&item).await {
                    // Per-item failures stay per-item.
                    error!(item_id = item.id, "Work item processing error: {e}");
                }
            });
        }

        // The whole batch finishes before the next claim.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task panicked: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailError;
    use crate::ingest::EmailIngestion;
    use crate::mail::{MailFlag, MailGateway};
    use crate::model::{EmailMessage, STATUS_COMPLETED, STATUS_ERROR};
    use crate::store::{LibSqlStore, ProcessedLedger};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct EmptyMailbox;

    #[async_trait]
    impl MailGateway for EmptyMailbox {
        async fn fetch(
            &self,
            _subject_filter: Option<&str>,
            _received_after: Option<DateTime<Utc>>,
        ) -> Result<Vec<EmailMessage>, MailError> {
            Ok(Vec::new())
        }

        async fn set_flag(&self, _message_id: &str, _flag: MailFlag) -> Result<(), MailError> {
            Ok(())
        }
    }

    struct DeadMailbox;

    #[async_trait]
    impl MailGateway for DeadMailbox {
        async fn fetch(
            &self,
            _subject_filter: Option<&str>,
            _received_after: Option<DateTime<Utc>>,
        ) -> Result<Vec<EmailMessage>, MailError> {
            Err(MailError::Search("connection refused".into()))
        }

        async fn set_flag(&self, _message_id: &str, _flag: MailFlag) -> Result<(), MailError> {
            Ok(())
        }
    }

    async fn scheduler_with(
        gateway: Arc<dyn MailGateway>,
        chunk_size: u32,
        max_retry: u32,
    ) -> (Arc<LibSqlStore>, BatchScheduler) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let ledger: Arc<dyn ProcessedLedger> = store.clone();
        let ingestion = Arc::new(EmailIngestion::new(gateway, ledger));
        let processor = Arc::new(WorkItemProcessor::new(store.clone(), ingestion, max_retry));
        let config = BatchJobConfig::new(60_000, chunk_size, max_retry).unwrap();
        let scheduler = BatchScheduler::new(config, store.clone(), processor);
        (store, scheduler)
    }

    #[tokio::test]
    async fn drain_processes_backlog_across_multiple_claims() {
        let (store, scheduler) = scheduler_with(Arc::new(EmptyMailbox), 2, 3).await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.insert_item(&format!("order-{i}")).await.unwrap().id);
        }

        // chunk_size 2 forces three claim rounds in a single cycle.
        scheduler.drain_once().await;

        for id in ids {
            let item = store.get_item(id).await.unwrap().unwrap();
            assert_eq!(item.status, STATUS_COMPLETED);
            assert!(item.processed);
        }
    }

    #[tokio::test]
    async fn failing_items_are_retried_not_dropped() {
        let (store, scheduler) = scheduler_with(Arc::new(DeadMailbox), 10, 3).await;
        let id = store.insert_item("order").await.unwrap().id;

        scheduler.drain_once().await;

        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, STATUS_ERROR);
        assert!(!item.processed);
        assert_eq!(item.retry_count, 1);
    }

    #[tokio::test]
    async fn one_bad_item_does_not_stall_siblings() {
        // All items fail ingestion; every one must still be transitioned.
        let (store, scheduler) = scheduler_with(Arc::new(DeadMailbox), 3, 5).await;
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(store.insert_item(&format!("order-{i}")).await.unwrap().id);
        }

        scheduler.drain_once().await;

        for id in ids {
            let item = store.get_item(id).await.unwrap().unwrap();
            assert_eq!(item.retry_count, 1);
        }
    }

    #[tokio::test]
    async fn drain_stops_claiming_exhausted_items() {
        let (store, scheduler) = scheduler_with(Arc::new(DeadMailbox), 10, 2).await;
        let id = store.insert_item("order").await.unwrap().id;

        // Two cycles exhaust the budget; further cycles must not touch it.
        scheduler.drain_once().await;
        scheduler.drain_once().await;
        scheduler.drain_once().await;

        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.status, STATUS_ERROR);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_store, scheduler) = scheduler_with(Arc::new(EmptyMailbox), 5, 3).await;

        assert!(scheduler.start().await);
        assert!(!scheduler.start().await);
        assert!(scheduler.is_running().await);

        assert!(scheduler.stop().await);
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let (_store, scheduler) = scheduler_with(Arc::new(EmptyMailbox), 5, 3).await;
        assert!(!scheduler.stop().await);
    }

    #[tokio::test]
    async fn restart_after_stop_works() {
        let (_store, scheduler) = scheduler_with(Arc::new(EmptyMailbox), 5, 3).await;
        assert!(scheduler.start().await);
        assert!(scheduler.stop().await);
        assert!(scheduler.start().await);
        assert!(scheduler.stop().await);
    }

    #[tokio::test]
    async fn started_loop_drains_first_tick_immediately() {
        let (store, scheduler) = scheduler_with(Arc::new(EmptyMailbox), 5, 3).await;
        let id = store.insert_item("order").await.unwrap().id;

        scheduler.start().await;

        // The first interval tick fires immediately; poll briefly for the
        // item to be processed rather than waiting a full interval.
        let mut done = false;
        for _ in 0..200 {
            let item = store.get_item(id).await.unwrap().unwrap();
            if item.processed {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;
        assert!(done, "first tick did not drain the backlog");
    }
}
