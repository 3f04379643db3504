//! Error types for ordermail.

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Work item not found: {0}")]
    NotFound(i64),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Conditional update on work item {id} affected {rows} rows, expected 1")]
    Consistency { id: i64, rows: u64 },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mail server / IMAP transport errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("IMAP login failed for {username}")]
    LoginFailed { username: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Fetch task panicked: {0}")]
    TaskPanicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-item processing errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Retry budget exhausted for work item {id}: retry count would exceed {max_retry}")]
    RetryExhausted { id: i64, max_retry: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
