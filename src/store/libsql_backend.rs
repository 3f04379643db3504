//! libSQL backend — async implementation of both persistence traits.
//!
//! Supports local file and in-memory databases. The claim operation is a
//! single atomic `UPDATE ... WHERE id IN (SELECT ...) RETURNING` statement:
//! it stamps a fresh claim token onto the oldest eligible unclaimed rows and
//! returns them, so concurrent claimers can never receive the same row and
//! never wait on each other. Rows whose claim is older than the lease
//! timeout count as abandoned and become eligible again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ProcessedEmailRecord, STATUS_NEW, WorkItem};
use crate::store::migrations;
use crate::store::traits::{ProcessedLedger, WorkItemStore};

/// How long a claim holds a row before a crashed claimer's rows become
/// reclaimable.
const CLAIM_LEASE: Duration = Duration::from_secs(600);

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::init_schema(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::init_schema(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql row to a WorkItem.
///
/// Column order matches ITEM_COLUMNS:
/// 0:id, 1:name, 2:status, 3:processed, 4:retry_count, 5:failure_reason,
/// 6:created_at, 7:updated_at
fn row_to_item(row: &libsql::Row) -> Result<WorkItem, libsql::Error> {
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    Ok(WorkItem {
        id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        processed: row.get::<i64>(3)? != 0,
        retry_count: row.get::<i64>(4)?.max(0) as u32,
        failure_reason: row.get::<Option<String>>(5)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const ITEM_COLUMNS: &str =
    "id, name, status, processed, retry_count, failure_reason, created_at, updated_at";

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl WorkItemStore for LibSqlStore {
    async fn claim_next_batch(
        &self,
        max_retry: u32,
        chunk_size: u32,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let lease_cutoff = now
            - chrono::TimeDelta::from_std(CLAIM_LEASE).unwrap_or(chrono::TimeDelta::zero());

        let sql = format!(
            "UPDATE work_items
             SET claim_token = ?1, claimed_at = ?2
             WHERE id IN (
                 SELECT id FROM work_items
                 WHERE processed = 0
                   AND retry_count < ?3
                   AND (claim_token IS NULL OR claimed_at < ?4)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?5
             )
             RETURNING {ITEM_COLUMNS}"
        );

        let mut rows = self
            .conn()
            .query(
                &sql,
                params![
                    token.clone(),
                    now.to_rfc3339(),
                    i64::from(max_retry),
                    lease_cutoff.to_rfc3339(),
                    i64::from(chunk_size)
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_next_batch: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("claim_next_batch: {e}")))?
        {
            items.push(
                row_to_item(&row)
                    .map_err(|e| StoreError::Query(format!("claim_next_batch: {e}")))?,
            );
        }

        // RETURNING does not guarantee the subquery's order.
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        debug!(claimed = items.len(), %token, "Claimed batch");
        Ok(items)
    }

    async fn get_item(&self, id: i64) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id])
            .await
            .map_err(|e| StoreError::Query(format!("get_item: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_item: {e}")))?
        {
            Some(row) => Ok(Some(
                row_to_item(&row).map_err(|e| StoreError::Query(format!("get_item: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    async fn update_item(
        &self,
        id: i64,
        status: &str,
        processed: bool,
        retry_count: u32,
        failure_reason: Option<&str>,
    ) -> Result<u64, StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = ?2,
                     processed = ?3,
                     retry_count = ?4,
                     failure_reason = ?5,
                     updated_at = ?6,
                     claim_token = NULL,
                     claimed_at = NULL
                 WHERE id = ?1",
                params![
                    id,
                    status,
                    processed as i64,
                    i64::from(retry_count),
                    opt_text(failure_reason),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_item: {e}")))?;

        Ok(affected)
    }

    async fn insert_item(&self, name: &str) -> Result<WorkItem, StoreError> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "INSERT INTO work_items (name, status, processed, retry_count, created_at, updated_at)
             VALUES (?1, ?2, 0, 0, ?3, ?3)
             RETURNING {ITEM_COLUMNS}"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![name, STATUS_NEW, now])
            .await
            .map_err(|e| StoreError::Query(format!("insert_item: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("insert_item: {e}")))?
        {
            Some(row) => {
                row_to_item(&row).map_err(|e| StoreError::Query(format!("insert_item: {e}")))
            }
            None => Err(StoreError::Query("insert_item returned no row".into())),
        }
    }
}

#[async_trait]
impl ProcessedLedger for LibSqlStore {
    async fn exists(&self, message_id: &str, work_item_id: i64) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_emails WHERE message_id = ?1 AND work_item_id = ?2 LIMIT 1",
                params![message_id, work_item_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("ledger exists: {e}")))?;

        Ok(rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("ledger exists: {e}")))?
            .is_some())
    }

    async fn record(&self, message_id: &str, work_item_id: i64) -> Result<(), StoreError> {
        let result = self
            .conn()
            .execute(
                "INSERT INTO processed_emails (message_id, work_item_id, created_at) VALUES (?1, ?2, ?3)",
                params![message_id, work_item_id, Utc::now().to_rfc3339()],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // A racing ingestion already recorded the pair; the dedup fact stands.
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                debug!(message_id, work_item_id, "Pair already recorded");
                Ok(())
            }
            Err(e) => Err(StoreError::Query(format!("ledger record: {e}"))),
        }
    }

    async fn records_for_item(
        &self,
        work_item_id: i64,
    ) -> Result<Vec<ProcessedEmailRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, work_item_id, created_at FROM processed_emails
                 WHERE work_item_id = ?1 ORDER BY id ASC",
                params![work_item_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("ledger records_for_item: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("ledger records_for_item: {e}")))?
        {
            let created_str: String = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("ledger records_for_item: {e}")))?;
            records.push(ProcessedEmailRecord {
                message_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("ledger records_for_item: {e}")))?,
                work_item_id: row
                    .get(1)
                    .map_err(|e| StoreError::Query(format!("ledger records_for_item: {e}")))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(records)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
