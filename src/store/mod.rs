//! Persistence layer — work item store and processed-email dedup ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{ProcessedLedger, WorkItemStore};
