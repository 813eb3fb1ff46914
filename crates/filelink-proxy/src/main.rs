mod assembler;
mod chunk_source;
mod cleanup;
mod config;
mod error;
mod range;
mod registry;
mod retry;
mod routes;
mod session;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use filelink_db::LinkDb;
use tracing::info;

use crate::chunk_source::HttpChunkSource;
use crate::config::Config;
use crate::registry::SqliteRegistry;
use crate::routes::AppState;
use crate::session::SessionPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "filelink_proxy=debug,filelink_db=info,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(LinkDb::open(&config.db_path)?);
    let source = Arc::new(HttpChunkSource::new(&config.upstream_url, config.chunk_size)?);
    let sessions = Arc::new(SessionPool::new(config.max_sessions));

    // Background cleanup of expired and revoked links
    tokio::spawn(cleanup::run_cleanup_loop(
        db.clone(),
        config.cleanup_interval_secs,
        config.expired_grace,
    ));

    let state = AppState {
        registry: Arc::new(SqliteRegistry::new(db)),
        source,
        sessions,
        session_wait: config.session_wait,
        assembler: config.assembler(),
    };
    let app = routes::router(state);

    let addr: SocketAddr = config.bind_addr().parse()?;
    info!("filelink proxy listening on {}", addr);
    info!("Links served under {}/{{token}}", config.base_url.trim_end_matches('/'));
    info!(
        "Remote sessions: {} (wait {:?}), fetch timeout {:?}, {} attempts per fetch",
        config.max_sessions, config.session_wait, config.fetch_timeout, config.retry_attempts
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
