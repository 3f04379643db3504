//! Blocking IMAP-over-TLS session.
//!
//! A thin hand-rolled client: tagged commands over rustls, just enough of
//! the protocol for LOGIN, folder selection, SEARCH, FETCH, and STORE.
//! All methods block — callers run them under `spawn_blocking`.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::MailServerConfig;
use crate::error::MailError;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// An authenticated session with one folder selected.
pub struct ImapSession {
    tls: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    tag_counter: u32,
}

impl ImapSession {
    /// Connect, log in, and select the configured folder.
    ///
    /// `read_only` selects with EXAMINE instead of SELECT, so the server
    /// will not mutate flags as a side effect of fetches.
    pub fn connect(config: &MailServerConfig, read_only: bool) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((&*config.host, config.port)).map_err(|e| {
            MailError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: e.to_string(),
            }
        })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.host.clone())
                .map_err(|e| MailError::Protocol(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailError::Protocol(format!("TLS setup failed: {e}")))?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self { tls, tag_counter: 0 };

        let _greeting = session.read_line()?;

        let login_resp = session.send_cmd(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !last_line_ok(&login_resp) {
            return Err(MailError::LoginFailed {
                username: config.username.clone(),
            });
        }

        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        let select_resp = session.send_cmd(&format!("{verb} {}", quote(&config.folder)))?;
        if !last_line_ok(&select_resp) {
            return Err(MailError::Protocol(format!(
                "failed to open folder {:?}",
                config.folder
            )));
        }

        Ok(session)
    }

    /// SEARCH with the given criteria; returns matching sequence numbers.
    pub fn search(&mut self, criteria: &str) -> Result<Vec<u32>, MailError> {
        let resp = self.send_cmd(&format!("SEARCH {criteria}"))?;
        if !last_line_ok(&resp) {
            return Err(MailError::Search(format!("SEARCH {criteria} rejected")));
        }

        let mut seqs = Vec::new();
        for line in &resp {
            if let Some(rest) = line.strip_prefix("* SEARCH") {
                seqs.extend(rest.split_whitespace().filter_map(|s| s.parse::<u32>().ok()));
            }
        }
        Ok(seqs)
    }

    /// FETCH the full RFC822 text of one message.
    pub fn fetch_rfc822(&mut self, seq: u32) -> Result<Option<String>, MailError> {
        let resp = self.send_cmd(&format!("FETCH {seq} RFC822"))?;
        if !last_line_ok(&resp) {
            warn!(seq, "FETCH rejected by server");
            return Ok(None);
        }
        if resp.len() < 3 {
            return Ok(None);
        }

        // First line is the untagged FETCH response, last is the tagged OK.
        let raw: String = resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(2))
            .cloned()
            .collect();
        Ok(Some(raw))
    }

    /// STORE a flag onto one message.
    pub fn store_flag(&mut self, seq: u32, flag: &str) -> Result<(), MailError> {
        let resp = self.send_cmd(&format!("STORE {seq} +FLAGS ({flag})"))?;
        if !last_line_ok(&resp) {
            return Err(MailError::Protocol(format!(
                "STORE {flag} rejected for message {seq}"
            )));
        }
        Ok(())
    }

    /// Release the folder, then the transport. Best-effort cleanup: each
    /// step's failure is logged, never escalated.
    pub fn close(mut self) {
        if let Err(e) = self.send_cmd("CLOSE") {
            warn!("Failed to close mail folder: {e}");
        }
        if let Err(e) = self.send_cmd("LOGOUT") {
            warn!("Failed to log out of mail server: {e}");
        }
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => {
                    return Err(MailError::Protocol("connection closed by server".into()));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send_cmd(&mut self, cmd: &str) -> Result<Vec<String>, MailError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);
        debug!(%tag, "IMAP command");

        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }
}

/// Build conjunctive SEARCH criteria from the optional filters.
///
/// Returns `None` when no filter is present — callers must not search at
/// all in that case rather than scan the whole folder.
pub fn build_search_criteria(
    subject_filter: Option<&str>,
    received_after: Option<chrono::DateTime<chrono::Utc>>,
) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(subject) = subject_filter {
        parts.push(format!("SUBJECT {}", quote(subject)));
    }
    if let Some(after) = received_after {
        // IMAP SINCE has day granularity: dd-Mon-yyyy.
        parts.push(format!("SINCE {}", after.format("%d-%b-%Y")));
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join(" "))
}

/// Quote an IMAP string literal, escaping backslashes and quotes.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn last_line_ok(lines: &[String]) -> bool {
    lines
        .last()
        .is_some_and(|l| l.split_whitespace().nth(1) == Some("OK"))
}
