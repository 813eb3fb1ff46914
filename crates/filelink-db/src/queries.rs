use crate::LinkDb;
use crate::models::{LinkRow, NewLink};
use crate::tokens::generate_token;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

impl LinkDb {
    /// Publish a file under a fresh token. `ttl = None` never expires.
    pub fn issue(&self, link: &NewLink, ttl: Option<Duration>) -> Result<String> {
        let token = generate_token();
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| (now + ttl).timestamp());
        let total_size = i64::try_from(link.total_size)?;

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO links (token, handle, total_size, mime_type, file_name, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    &token,
                    &link.handle,
                    total_size,
                    &link.mime_type,
                    &link.file_name,
                    now.timestamp(),
                    expires_at,
                ],
            )?;
            Ok(())
        })?;

        info!("Issued link for {} ({} bytes)", link.handle, link.total_size);
        Ok(token)
    }

    /// Look up a live (non-revoked) link. Expired links are still returned;
    /// the caller decides between 404 and 410.
    pub fn find(&self, token: &str) -> Result<Option<LinkRow>> {
        self.with_conn(|conn| query_link(conn, token))
    }

    /// Revoke a link. Returns false if the token was unknown or already revoked.
    pub fn revoke(&self, token: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE links SET revoked_at = ?1 WHERE token = ?2 AND revoked_at IS NULL",
                rusqlite::params![now, token],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete links that expired before `before`, plus any revoked links.
    pub fn purge_expired(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM links
                 WHERE (expires_at IS NOT NULL AND expires_at < ?1)
                    OR revoked_at IS NOT NULL",
                [before.timestamp()],
            )?;
            Ok(removed)
        })
    }
}

fn query_link(conn: &Connection, token: &str) -> Result<Option<LinkRow>> {
    let mut stmt = conn.prepare(
        "SELECT token, handle, total_size, mime_type, file_name, created_at, expires_at
         FROM links WHERE token = ?1 AND revoked_at IS NULL",
    )?;

    let row = stmt
        .query_row([token], |row| {
            Ok(LinkRow {
                token: row.get(0)?,
                handle: row.get(1)?,
                total_size: row.get(2)?,
                mime_type: row.get(3)?,
                file_name: row.get(4)?,
                created_at: row.get(5)?,
                expires_at: row.get(6)?,
            })
        })
        .optional()?;

    Ok(row)
}
