use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use filelink_db::LinkDb;
use tracing::{info, warn};

/// Background task that prunes dead links.
///
/// Expired links are kept for `grace` after their expiry so late requests
/// still get 410 instead of 404; after that they are deleted along with
/// revoked ones.
pub async fn run_cleanup_loop(db: Arc<LinkDb>, interval_secs: u64, grace: chrono::Duration) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match purge_dead_links(db.clone(), grace).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: purged {} dead links", count);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }
}

async fn purge_dead_links(db: Arc<LinkDb>, grace: chrono::Duration) -> anyhow::Result<usize> {
    let cutoff = Utc::now() - grace;
    tokio::task::spawn_blocking(move || db.purge_expired(cutoff)).await?
}
