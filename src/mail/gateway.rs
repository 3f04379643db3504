//! Mail gateway trait and the IMAP-backed implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::MailServerConfig;
use crate::error::MailError;
use crate::mail::imap::{ImapSession, build_search_criteria};
use crate::mail::message::map_message;
use crate::model::EmailMessage;

/// Flag applied to a remote message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailFlag {
    Seen,
    Deleted,
}

impl MailFlag {
    fn imap_name(self) -> &'static str {
        match self {
            MailFlag::Seen => "\\Seen",
            MailFlag::Deleted => "\\Deleted",
        }
    }
}

/// Access to the remote mailbox: filtered search and per-message flagging.
#[async_trait]
pub trait MailGateway: Send + Sync {
    /// Search the folder with conjunctive filters and map the results.
    ///
    /// When both filters are absent this returns empty without opening a
    /// connection — an unfiltered full-folder scan is never performed.
    /// Messages that fail mapping are dropped individually.
    async fn fetch(
        &self,
        subject_filter: Option<&str>,
        received_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<EmailMessage>, MailError>;

    /// Locate messages by Message-ID header and apply `flag`.
    ///
    /// No-op (no connection opened) when `message_id` is blank.
    async fn set_flag(&self, message_id: &str, flag: MailFlag) -> Result<(), MailError>;
}

/// IMAP-backed gateway. Each operation opens a scoped connection, does its
/// work, and releases the folder and transport.
pub struct ImapGateway {
    config: MailServerConfig,
}

impl ImapGateway {
    pub fn new(config: MailServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailGateway for ImapGateway {
    async fn fetch(
        &self,
        subject_filter: Option<&str>,
        received_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<EmailMessage>, MailError> {
        let Some(criteria) = build_search_criteria(subject_filter, received_after) else {
            warn!("No search criteria provided for fetching emails, aborting fetch");
            return Ok(Vec::new());
        };

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_blocking(&config, &criteria))
            .await
            .map_err(|e| MailError::TaskPanicked(e.to_string()))?
    }

    async fn set_flag(&self, message_id: &str, flag: MailFlag) -> Result<(), MailError> {
        if message_id.trim().is_empty() {
            debug!("Blank message id, skipping flag update");
            return Ok(());
        }

        let config = self.config.clone();
        let message_id = message_id.to_string();
        tokio::task::spawn_blocking(move || set_flag_blocking(&config, &message_id, flag))
            .await
            .map_err(|e| MailError::TaskPanicked(e.to_string()))?
    }
}

fn fetch_blocking(
    config: &MailServerConfig,
    criteria: &str,
) -> Result<Vec<EmailMessage>, MailError> {
    let mut session = ImapSession::connect(config, true)?;

    let result = (|| {
        let seqs = session.search(criteria)?;
        debug!(matches = seqs.len(), criteria, "Mailbox search complete");

        let mut messages = Vec::new();
        for seq in seqs {
            match session.fetch_rfc822(seq) {
                Ok(Some(raw)) => {
                    // Mapping failures drop the one message, not the batch.
                    if let Some(msg) = map_message(raw.as_bytes()) {
                        messages.push(msg);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(seq, "Failed to fetch message: {e}");
                }
            }
        }
        Ok(messages)
    })();

    session.close();
    result
}

fn set_flag_blocking(
    config: &MailServerConfig,
    message_id: &str,
    flag: MailFlag,
) -> Result<(), MailError> {
    let mut session = ImapSession::connect(config, false)?;

    let result = (|| {
        let criteria = format!("HEADER Message-ID \"{}\"", message_id.replace('"', ""));
        let seqs = session.search(&criteria)?;
        for seq in seqs {
            session.store_flag(seq, flag.imap_name())?;
        }
        Ok(())
    })();

    session.close();
    result
}
