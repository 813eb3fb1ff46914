use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filelink_db::{LinkDb, LinkRow};
use filelink_types::{FileDescriptor, FileHandle};
use thiserror::Error;

/// Longest token accepted on the wire; issued tokens are 32 characters.
const MAX_TOKEN_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("link not found")]
    NotFound,
    #[error("link expired")]
    Expired,
    #[error("link store failure: {0}")]
    Backend(String),
}

/// Read-only view of issued links. Safe for any number of concurrent callers.
#[async_trait]
pub trait LinkRegistry: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<FileDescriptor, ResolveError>;
}

/// Tokens are URL-safe base64. Anything else cannot have been issued.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Registry backed by the SQLite link store the bot front end writes to.
pub struct SqliteRegistry {
    db: Arc<LinkDb>,
}

impl SqliteRegistry {
    pub fn new(db: Arc<LinkDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LinkRegistry for SqliteRegistry {
    async fn resolve(&self, token: &str) -> Result<FileDescriptor, ResolveError> {
        let db = self.db.clone();
        let token = token.to_string();
        let row = tokio::task::spawn_blocking(move || db.find(&token))
            .await
            .map_err(|e| ResolveError::Backend(format!("spawn_blocking join error: {}", e)))?
            .map_err(|e| ResolveError::Backend(e.to_string()))?
            .ok_or(ResolveError::NotFound)?;

        let descriptor = descriptor_from_row(row)?;
        if descriptor.is_expired(Utc::now()) {
            return Err(ResolveError::Expired);
        }
        Ok(descriptor)
    }
}

fn descriptor_from_row(row: LinkRow) -> Result<FileDescriptor, ResolveError> {
    let total_size = u64::try_from(row.total_size)
        .map_err(|_| ResolveError::Backend(format!("negative size for {}", row.token)))?;
    let created_at = timestamp(row.created_at)?;
    let expires_at = row.expires_at.map(timestamp).transpose()?;

    Ok(FileDescriptor {
        handle: FileHandle::new(row.handle),
        total_size,
        mime_type: row.mime_type,
        file_name: row.file_name,
        created_at,
        expires_at,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, ResolveError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ResolveError::Backend(format!("timestamp out of range: {}", secs)))
}
