use std::time::Duration;

use anyhow::{Result, ensure};
use bytes::{Bytes, BytesMut};
use filelink_types::FileHandle;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tracing::{debug, info};

/// Default chunk granularity: 1 MiB, the remote protocol's largest part.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// Transient: retry with backoff.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    /// Fatal: the descriptor no longer matches anything remote.
    #[error("remote handle invalid: {0}")]
    HandleInvalid(String),
}

impl ChunkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChunkError::RemoteUnavailable(_))
    }
}

/// Lazy sequence of non-empty chunks in increasing offset order.
/// Dropping it cancels whatever fetch is in flight.
pub type ChunkStream = BoxStream<'static, Result<Bytes, ChunkError>>;

/// Handle-based chunked fetch capability of the remote transport.
pub trait ChunkSource: Send + Sync {
    /// Fixed alignment (a power of two) every `fetch` offset must respect.
    fn granularity(&self) -> u64;

    /// Stream at most `max_len` bytes of `handle` starting at `offset`.
    /// `offset` must be a multiple of [`granularity`](Self::granularity);
    /// the sequence ends early at remote end of file.
    fn fetch(&self, handle: &FileHandle, offset: u64, max_len: u64) -> ChunkStream;
}

/// Remote transport adapter over an HTTP file API.
///
/// The upstream serves a handle's bytes at `{base_url}/{handle}` and honors
/// single `Range` requests. Each protocol chunk is one ranged GET of at most
/// `granularity` bytes, so no more than one chunk is buffered per fetch.
pub struct HttpChunkSource {
    client: Client,
    base_url: String,
    granularity: u64,
}

impl HttpChunkSource {
    pub fn new(base_url: &str, granularity: u64) -> Result<Self> {
        ensure!(
            granularity.is_power_of_two(),
            "chunk size must be a power of two, got {}",
            granularity
        );
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        info!("Remote file API: {} ({} byte chunks)", base_url, granularity);
        Ok(Self {
            client,
            base_url,
            granularity,
        })
    }

    fn url(&self, handle: &FileHandle) -> String {
        let path = handle
            .as_str()
            .trim_start_matches('/')
            .split('/')
            .map(urlencoding::encode)
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url, path)
    }
}

impl ChunkSource for HttpChunkSource {
    fn granularity(&self) -> u64 {
        self.granularity
    }

    fn fetch(&self, handle: &FileHandle, offset: u64, max_len: u64) -> ChunkStream {
        let client = self.client.clone();
        let url = self.url(handle);
        let granularity = self.granularity;

        async_stream::stream! {
            let end = offset.saturating_add(max_len);
            let mut pos = offset;
            while pos < end {
                let want = granularity.min(end - pos);
                match fetch_part(&client, &url, pos, want).await {
                    Ok(Some(chunk)) => {
                        let got = chunk.len() as u64;
                        pos += got;
                        yield Ok(chunk);
                        // A short part means the remote file ends here
                        if got < want {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
        .boxed()
    }
}

/// One ranged GET. `Ok(None)` signals remote end of file.
async fn fetch_part(
    client: &Client,
    url: &str,
    offset: u64,
    len: u64,
) -> Result<Option<Bytes>, ChunkError> {
    debug!("GET {} bytes={}-{}", url, offset, offset + len - 1);

    let resp = client
        .get(url)
        .header(header::RANGE, format!("bytes={}-{}", offset, offset + len - 1))
        .send()
        .await
        .map_err(|e| ChunkError::RemoteUnavailable(format!("request failed: {}", e)))?;

    match resp.status() {
        StatusCode::PARTIAL_CONTENT => {
            let start = resp
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .map(content_range_start);
            // A missing Content-Range is tolerated; a wrong one is not
            if let Some(start) = start.filter(|s| *s != Some(offset)) {
                return Err(ChunkError::HandleInvalid(format!(
                    "upstream answered bytes from {:?} for offset {}",
                    start, offset
                )));
            }
        }
        // Range ignored, but at offset 0 the prefix is still what we asked for
        StatusCode::OK if offset == 0 => {}
        StatusCode::OK => {
            return Err(ChunkError::HandleInvalid(
                "upstream ignored the range request".into(),
            ));
        }
        StatusCode::RANGE_NOT_SATISFIABLE => return Ok(None),
        status @ (StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::GONE) => {
            return Err(ChunkError::HandleInvalid(format!("upstream returned {}", status)));
        }
        status => {
            return Err(ChunkError::RemoteUnavailable(format!("upstream returned {}", status)));
        }
    }

    let mut body = resp.bytes_stream();
    let mut buf = BytesMut::with_capacity(len as usize);
    while let Some(frame) = body.next().await {
        let frame =
            frame.map_err(|e| ChunkError::RemoteUnavailable(format!("body read failed: {}", e)))?;
        let room = len as usize - buf.len();
        buf.extend_from_slice(&frame[..frame.len().min(room)]);
        if buf.len() as u64 >= len {
            break;
        }
    }

    if buf.is_empty() {
        return Ok(None);
    }
    Ok(Some(buf.freeze()))
}

/// First byte of a `Content-Range: bytes a-b/total` value.
fn content_range_start(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (start, _) = rest.trim().split_once('-')?;
    start.trim().parse().ok()
}
