//! Configuration types, built from environment variables.

use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;

/// Batch job configuration. Immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct BatchJobConfig {
    /// Interval between scheduler ticks, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of work items claimed per store round-trip.
    pub chunk_size: u32,
    /// Maximum number of failed attempts before an item becomes unclaimable.
    pub max_retry: u32,
}

impl BatchJobConfig {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
    pub const DEFAULT_CHUNK_SIZE: u32 = 25;
    pub const DEFAULT_MAX_RETRY: u32 = 5;

    /// Build config from `BATCH_JOB_*` environment variables.
    ///
    /// Absent values fall back to defaults (with a warning, so a deployment
    /// that forgot to set them is visible in the logs). Out-of-range values
    /// are a hard startup error rather than a silent clamp.
    pub fn from_env() -> Result<Self, ConfigError> {
        let poll_interval_ms = match read_env_parsed::<u64>("BATCH_JOB_INTERVAL_MS")? {
            Some(v) => v,
            None => {
                warn!(
                    "BATCH_JOB_INTERVAL_MS not set, using default {} ms",
                    Self::DEFAULT_POLL_INTERVAL_MS
                );
                Self::DEFAULT_POLL_INTERVAL_MS
            }
        };
        let chunk_size = match read_env_parsed::<u32>("BATCH_JOB_CHUNK_SIZE")? {
            Some(v) => v,
            None => {
                warn!(
                    "BATCH_JOB_CHUNK_SIZE not set, using default {}",
                    Self::DEFAULT_CHUNK_SIZE
                );
                Self::DEFAULT_CHUNK_SIZE
            }
        };
        let max_retry = match read_env_parsed::<u32>("BATCH_JOB_MAX_RETRY")? {
            Some(v) => v,
            None => {
                warn!(
                    "BATCH_JOB_MAX_RETRY not set, using default {}",
                    Self::DEFAULT_MAX_RETRY
                );
                Self::DEFAULT_MAX_RETRY
            }
        };

        Self::new(poll_interval_ms, chunk_size, max_retry)
    }

    /// Construct a validated config.
    pub fn new(
        poll_interval_ms: u64,
        chunk_size: u32,
        max_retry: u32,
    ) -> Result<Self, ConfigError> {
        check_range("BATCH_JOB_INTERVAL_MS", poll_interval_ms, 60_000, 300_000)?;
        check_range("BATCH_JOB_CHUNK_SIZE", u64::from(chunk_size), 1, 1000)?;
        check_range("BATCH_JOB_MAX_RETRY", u64::from(max_retry), 1, 25)?;
        Ok(Self {
            poll_interval_ms,
            chunk_size,
            max_retry,
        })
    }

    /// Tick interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Mail server connection configuration.
#[derive(Debug, Clone)]
pub struct MailServerConfig {
    pub host: String,
    pub username: String,
    pub password: SecretString,
    /// Folder to monitor, e.g. `INBOX`.
    pub folder: String,
    pub port: u16,
    /// Protocol label; only `imaps` is implemented.
    pub protocol: String,
}

impl MailServerConfig {
    pub const DEFAULT_PORT: u16 = 993;
    pub const DEFAULT_PROTOCOL: &'static str = "imaps";

    /// Build config from `MAIL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = read_env_required("MAIL_HOST")?;
        let username = read_env_required("MAIL_USERNAME")?;
        let password = SecretString::from(read_env_required("MAIL_PASSWORD")?);
        let folder = std::env::var("MAIL_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        let port = match read_env_parsed::<u16>("MAIL_PORT")? {
            Some(p) if p >= 1 => p,
            Some(p) => {
                return Err(ConfigError::InvalidValue {
                    key: "MAIL_PORT".into(),
                    message: format!("port {p} out of range 1..=65535"),
                });
            }
            None => Self::DEFAULT_PORT,
        };

        let protocol = std::env::var("MAIL_PROTOCOL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Self::DEFAULT_PROTOCOL.to_string());

        Ok(Self {
            host,
            username,
            password,
            folder,
            port,
            protocol,
        })
    }
}

fn read_env_required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn read_env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("cannot parse {raw:?}"),
            })
        }
        _ => Ok(None),
    }
}

fn check_range(key: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} out of range {min}..={max}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let cfg = BatchJobConfig::new(
            BatchJobConfig::DEFAULT_POLL_INTERVAL_MS,
            BatchJobConfig::DEFAULT_CHUNK_SIZE,
            BatchJobConfig::DEFAULT_MAX_RETRY,
        )
        .unwrap();
        assert_eq!(cfg.poll_interval_ms, 60_000);
        assert_eq!(cfg.chunk_size, 25);
        assert_eq!(cfg.max_retry, 5);
    }

    #[test]
    fn interval_below_minimum_rejected() {
        let err = BatchJobConfig::new(59_999, 25, 5).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BATCH_JOB_INTERVAL_MS"));
    }

    #[test]
    fn interval_above_maximum_rejected() {
        assert!(BatchJobConfig::new(300_001, 25, 5).is_err());
    }

    #[test]
    fn chunk_size_bounds() {
        assert!(BatchJobConfig::new(60_000, 0, 5).is_err());
        assert!(BatchJobConfig::new(60_000, 1000, 5).is_ok());
        assert!(BatchJobConfig::new(60_000, 1001, 5).is_err());
    }

    #[test]
    fn max_retry_bounds() {
        assert!(BatchJobConfig::new(60_000, 25, 0).is_err());
        assert!(BatchJobConfig::new(60_000, 25, 25).is_ok());
        assert!(BatchJobConfig::new(60_000, 25, 26).is_err());
    }

    #[test]
    fn poll_interval_duration() {
        let cfg = BatchJobConfig::new(120_000, 10, 3).unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(120_000));
    }
}
