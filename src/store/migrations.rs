//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `init_schema()` checks the
//! current version in `_migrations` and applies only the new ones
//! sequentially.

use libsql::Connection;
use tracing::info;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS work_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'NEW',
            processed INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            failure_reason TEXT,
            claim_token TEXT,
            claimed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_work_items_eligible
            ON work_items(processed, retry_count, created_at);

        CREATE TABLE IF NOT EXISTS processed_emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL,
            work_item_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (message_id, work_item_id)
        );
        CREATE INDEX IF NOT EXISTS idx_processed_emails_item
            ON processed_emails(work_item_id);
    "#,
}];

/// Apply all pending migrations.
pub async fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {e}", migration.name)))?;

        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                migration.version,
                migration.name,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .await
        .map_err(|e| StoreError::Migration(format!("record {}: {e}", migration.name)))?;

        info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("read version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("read version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("decode version: {e}"))),
        None => Ok(0),
    }
}
