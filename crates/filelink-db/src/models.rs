/// Database row types. These map directly to SQLite rows and stay
/// independent of the filelink-types descriptor; timestamps are unix seconds.

pub struct LinkRow {
    pub token: String,
    pub handle: String,
    pub total_size: i64,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// A file the bot front end wants to publish.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub handle: String,
    pub total_size: u64,
    pub mime_type: String,
    pub file_name: Option<String>,
}
