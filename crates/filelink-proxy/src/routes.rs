use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{self, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use filelink_types::FileDescriptor;
use futures_util::StreamExt;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::assembler::{AssemblerConfig, StreamInterrupted, assemble};
use crate::chunk_source::{ChunkError, ChunkSource};
use crate::error::{ApiError, ApiResult};
use crate::range::{ByteInterval, RangeOutcome, negotiate};
use crate::registry::{LinkRegistry, is_valid_token};
use crate::session::{SessionPool, StreamSession};

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn LinkRegistry>,
    pub source: Arc<dyn ChunkSource>,
    pub sessions: Arc<SessionPool>,
    /// How long a request may queue for a remote session before 503.
    pub session_wait: Duration,
    pub assembler: AssemblerConfig,
}

pub fn router(state: AppState) -> Router {
    // Links are opened from any origin
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([RANGE])
        .expose_headers([CONTENT_RANGE, CONTENT_LENGTH, ACCEPT_RANGES])
        .allow_credentials(false);

    Router::new()
        .route("/health", get(health))
        .route("/{token}", get(serve_link))
        .route("/{token}/{file_name}", get(serve_named_link))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET|HEAD /{token}: stream the linked file, honouring `Range`.
pub async fn serve_link(
    State(state): State<AppState>,
    Path(token): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> ApiResult<Response> {
    serve(state, token, method, &headers).await
}

/// GET|HEAD /{token}/{file_name}: same as `/{token}`; the name is only
/// there so saved files get a sensible name.
pub async fn serve_named_link(
    State(state): State<AppState>,
    Path((token, _file_name)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> ApiResult<Response> {
    serve(state, token, method, &headers).await
}

/// GET /health: liveness check (no auth).
pub async fn health() -> &'static str {
    "ok"
}

async fn serve(
    state: AppState,
    token: String,
    method: Method,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    if !is_valid_token(&token) {
        return Err(ApiError::NotFound);
    }
    let descriptor = state.registry.resolve(&token).await?;
    let total_size = descriptor.total_size;

    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
    let (status, interval) = match negotiate(range, total_size) {
        RangeOutcome::Full => (StatusCode::OK, ByteInterval::full(total_size)),
        RangeOutcome::Partial(interval) => (StatusCode::PARTIAL_CONTENT, Some(interval)),
        RangeOutcome::Unsatisfiable => {
            debug!("{}: unsatisfiable range {:?} for {} bytes", token, range, total_size);
            return Err(ApiError::RangeNotSatisfiable { total_size });
        }
    };
    let response_headers = entity_headers(&descriptor, status, interval)?;

    // HEAD and empty files never touch the remote
    let interval = match interval {
        Some(interval) if method != Method::HEAD => interval,
        _ => return Ok((status, response_headers, Body::empty()).into_response()),
    };

    let Some(permit) = state.sessions.acquire(state.session_wait).await else {
        warn!(
            "{}: no remote session free after {:?} ({}/{} in use)",
            token,
            state.session_wait,
            state.sessions.active(),
            state.sessions.capacity()
        );
        return Err(ApiError::RemoteUnavailable("session pool exhausted".into()));
    };

    let mut chunks = assemble(
        state.source.clone(),
        descriptor.handle.clone(),
        total_size,
        interval,
        state.assembler.clone(),
    )
    .boxed();

    // Pull the first chunk before committing to a status line
    let first = match chunks.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => {
            warn!("{}: remote failed before first byte: {}", token, e);
            return Err(e.cause.into());
        }
        None => {
            return Err(ChunkError::HandleInvalid(format!(
                "no data for {}-{}",
                interval.start, interval.end
            ))
            .into());
        }
    };

    debug!(
        "{}: streaming {} bytes {}-{}/{}",
        token, descriptor.handle, interval.start, interval.end, total_size
    );
    let mut session = StreamSession::new(token, interval, permit);
    let body = async_stream::stream! {
        session.record(first.len());
        yield Ok::<Bytes, StreamInterrupted>(first);

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    session.record(chunk.len());
                    yield Ok(chunk);
                }
                Err(e) => {
                    warn!(
                        "{}: remote failed mid-stream after {} bytes: {}",
                        session.token(),
                        session.emitted(),
                        e
                    );
                    session.mark_interrupted();
                    // Aborts the connection, the client sees a short read
                    yield Err(e);
                    return;
                }
            }
        }
    };

    Ok((status, response_headers, Body::from_stream(body)).into_response())
}

/// Headers shared by GET and HEAD for the same request.
fn entity_headers(
    descriptor: &FileDescriptor,
    status: StatusCode,
    interval: Option<ByteInterval>,
) -> ApiResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&descriptor.mime_type)
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from(interval.map_or(0, |i| i.len())),
    );
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let (StatusCode::PARTIAL_CONTENT, Some(interval)) = (status, interval) {
        let value = format!(
            "bytes {}-{}/{}",
            interval.start, interval.end, descriptor.total_size
        );
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&value).map_err(|e| ApiError::Internal(e.to_string()))?,
        );
    }

    if let Some(disposition) = descriptor.file_name.as_deref().and_then(content_disposition) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok(headers)
}

/// `attachment` disposition with an ASCII fallback name and the exact
/// UTF-8 name in `filename*`.
fn content_disposition(name: &str) -> Option<HeaderValue> {
    let ascii: String = name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    if ascii.trim().is_empty() {
        return None;
    }
    let encoded = urlencoding::encode(name);
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii, encoded
    ))
    .ok()
}
