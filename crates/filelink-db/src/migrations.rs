use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Link DB: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE links (
                token       TEXT PRIMARY KEY,
                handle      TEXT NOT NULL,
                total_size  INTEGER NOT NULL CHECK (total_size >= 0),
                mime_type   TEXT NOT NULL DEFAULT 'application/octet-stream',
                file_name   TEXT,
                created_at  INTEGER NOT NULL,
                expires_at  INTEGER,
                revoked_at  INTEGER
            );

            CREATE INDEX idx_links_expires ON links(expires_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}
