use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::assembler::{AssemblerConfig, DEFAULT_FETCH_TIMEOUT};
use crate::chunk_source::DEFAULT_CHUNK_SIZE;
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::session::DEFAULT_MAX_SESSIONS;

/// Process configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Public base URL links are issued under, `{base_url}/{token}`.
    pub base_url: String,
    pub db_path: PathBuf,
    pub upstream_url: String,
    pub chunk_size: u64,
    pub max_sessions: usize,
    pub session_wait: Duration,
    pub fetch_timeout: Duration,
    pub retry_attempts: u32,
    pub cleanup_interval_secs: u64,
    /// How long expired links keep answering 410 before they are purged.
    pub expired_grace: chrono::Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let Some(upstream_url) = var("FILELINK_UPSTREAM_URL") else {
            bail!("FILELINK_UPSTREAM_URL is required (base URL of the remote file API)");
        };

        let port = match var("FILELINK_PORT").or_else(|| var("PORT")) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid port: {}", raw))?,
            None => 8080,
        };

        let chunk_size: u64 = parse_or(&var, "FILELINK_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        if !chunk_size.is_power_of_two() {
            bail!("FILELINK_CHUNK_SIZE must be a power of two, got {}", chunk_size);
        }
        let max_sessions: usize = parse_or(&var, "FILELINK_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?;
        if max_sessions == 0 {
            bail!("FILELINK_MAX_SESSIONS must be at least 1");
        }
        let cleanup_interval_secs: u64 = parse_or(&var, "FILELINK_CLEANUP_INTERVAL_SECS", 3600)?;
        if cleanup_interval_secs == 0 {
            bail!("FILELINK_CLEANUP_INTERVAL_SECS must be at least 1");
        }
        let grace_hours: i64 = parse_or(&var, "FILELINK_EXPIRED_GRACE_HOURS", 24)?;
        let expired_grace = chrono::Duration::try_hours(grace_hours)
            .filter(|grace| *grace >= chrono::Duration::zero())
            .with_context(|| {
                format!("FILELINK_EXPIRED_GRACE_HOURS out of range: {}", grace_hours)
            })?;

        Ok(Self {
            host: var("FILELINK_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            base_url: var("FILELINK_BASE_URL").unwrap_or_else(|| "http://localhost:8080".into()),
            db_path: var("FILELINK_DB_PATH")
                .unwrap_or_else(|| "filelink.db".into())
                .into(),
            upstream_url,
            chunk_size,
            max_sessions,
            session_wait: Duration::from_secs(parse_or(&var, "FILELINK_SESSION_WAIT_SECS", 10)?),
            fetch_timeout: Duration::from_secs(parse_or(
                &var,
                "FILELINK_FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT.as_secs(),
            )?),
            retry_attempts: parse_or(&var, "FILELINK_RETRY_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            cleanup_interval_secs,
            expired_grace,
        })
    }

    pub fn assembler(&self) -> AssemblerConfig {
        AssemblerConfig {
            fetch_timeout: self.fetch_timeout,
            retry: RetryPolicy::new(
                self.retry_attempts,
                Duration::from_millis(250),
                Duration::from_secs(4),
            ),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {}", key, raw)),
        None => Ok(default),
    }
}
