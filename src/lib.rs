//! ordermail — batch correlation of order requests with inbound email.
//!
//! A periodic scheduler claims pending work items from the store in bounded
//! batches, fans them out to a worker pool, fetches correlated messages from
//! an IMAP mailbox per item, and records each (message, item) pair exactly
//! once in a dedup ledger before marking the message handled remotely.

pub mod admin;
pub mod config;
pub mod error;
pub mod ingest;
pub mod mail;
pub mod model;
pub mod processor;
pub mod scheduler;
pub mod store;
