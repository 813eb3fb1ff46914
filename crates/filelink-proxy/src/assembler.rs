//! Turns a byte interval into an exact, in-order byte stream built from
//! granularity-aligned remote fetches.
//!
//! The stream is lazy: a chunk is only fetched when the consumer polls for
//! it, so at most one chunk is held here while the previous one is written.
//! Memory per request is O(granularity) whatever the file size.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use filelink_types::FileHandle;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::chunk_source::{ChunkError, ChunkSource};
use crate::range::ByteInterval;
use crate::retry::RetryPolicy;

/// Default timeout for one chunk to arrive from the remote.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Bound on each individual chunk wait, not on the whole stream.
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// The stream could not be completed. `offset` is the first byte that was
/// never delivered.
#[derive(Debug, Error)]
#[error("stream interrupted at offset {offset}: {cause}")]
pub struct StreamInterrupted {
    pub offset: u64,
    pub cause: ChunkError,
}

/// Granularity-aligned region actually fetched to cover an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub aligned_start: u64,
    pub aligned_end: u64,
}

impl ChunkWindow {
    pub fn covering(interval: ByteInterval, granularity: u64, total_size: u64) -> Self {
        let aligned_start = align_down(interval.start, granularity);
        let aligned_end = align_down(interval.end, granularity)
            .saturating_add(granularity - 1)
            .min(total_size.saturating_sub(1));
        Self {
            aligned_start,
            aligned_end,
        }
    }
}

fn align_down(offset: u64, granularity: u64) -> u64 {
    offset - offset % granularity
}

/// Stream exactly the bytes of `interval` from `handle`.
///
/// A transient failure restarts the fetch at the chunk boundary at or
/// below the first undelivered byte and discards the overlap. The failure
/// budget resets whenever a byte is delivered. Fatal failures, a spent
/// budget, or a remote file shorter than `total_size` end the stream with
/// [`StreamInterrupted`].
pub fn assemble(
    source: Arc<dyn ChunkSource>,
    handle: FileHandle,
    total_size: u64,
    interval: ByteInterval,
    config: AssemblerConfig,
) -> impl Stream<Item = Result<Bytes, StreamInterrupted>> + Send + 'static {
    async_stream::stream! {
        let granularity = source.granularity();
        let window = ChunkWindow::covering(interval, granularity, total_size);
        let mut cursor = interval.start;
        let mut failures = 0u32;

        while cursor <= interval.end {
            let fetch_at = align_down(cursor, granularity);
            let mut skip = cursor - fetch_at;
            debug!(
                "fetching {} at {} for bytes {}-{} (window {}-{})",
                handle, fetch_at, cursor, interval.end, window.aligned_start, window.aligned_end
            );
            let mut chunks = source.fetch(&handle, fetch_at, window.aligned_end + 1 - fetch_at);

            let cause = loop {
                let next = match tokio::time::timeout(config.fetch_timeout, chunks.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        break ChunkError::RemoteUnavailable(format!(
                            "no chunk within {:?}",
                            config.fetch_timeout
                        ));
                    }
                };
                let mut chunk = match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => break e,
                    None => {
                        break ChunkError::HandleInvalid(format!(
                            "remote file ended at {} but descriptor says {} bytes",
                            cursor, total_size
                        ));
                    }
                };

                // Leading overhang of the first chunk
                if skip > 0 {
                    if chunk.len() as u64 <= skip {
                        skip -= chunk.len() as u64;
                        continue;
                    }
                    chunk = chunk.slice(skip as usize..);
                    skip = 0;
                }
                // Trailing overhang of the last chunk
                let remaining = interval.end + 1 - cursor;
                if chunk.len() as u64 > remaining {
                    chunk.truncate(remaining as usize);
                }
                if chunk.is_empty() {
                    continue;
                }

                cursor += chunk.len() as u64;
                failures = 0;
                yield Ok(chunk);
                if cursor > interval.end {
                    return;
                }
            };
            drop(chunks);

            if !cause.is_transient() {
                yield Err(StreamInterrupted { offset: cursor, cause });
                return;
            }
            failures += 1;
            match config.retry.delay_for(failures) {
                Some(delay) => {
                    warn!(
                        "{} failed at offset {} (attempt {}/{}): {}; retrying in {:?}",
                        handle, cursor, failures, config.retry.max_attempts(), cause, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    yield Err(StreamInterrupted { offset: cursor, cause });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fault, ScriptedChunkSource, reference_bytes};

    fn quick_config(max_attempts: u32) -> AssemblerConfig {
        AssemblerConfig {
            fetch_timeout: Duration::from_millis(100),
            retry: RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5)),
        }
    }

    async fn run(
        source: &Arc<ScriptedChunkSource>,
        total_size: u64,
        interval: ByteInterval,
        config: AssemblerConfig,
    ) -> (Vec<Bytes>, Option<StreamInterrupted>) {
        let stream = assemble(
            source.clone(),
            FileHandle::new("documents/report.pdf"),
            total_size,
            interval,
            config,
        );
        futures_util::pin_mut!(stream);
        let mut parts = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(part) => parts.push(part),
                Err(e) => return (parts, Some(e)),
            }
        }
        (parts, None)
    }

    fn concat(parts: &[Bytes]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn test_window_alignment() {
        let cases = [
            // (start, end, granularity, total) -> (aligned_start, aligned_end)
            ((300, 700, 256, 1000), (256, 767)),
            ((0, 999, 256, 1000), (0, 999)),
            ((256, 511, 256, 1000), (256, 511)),
            ((999, 999, 256, 1000), (768, 999)),
            ((0, 0, 1024 * 1024, 1), (0, 0)),
            ((5, 10, 1, 20), (5, 10)),
        ];
        for ((start, end, g, total), (aligned_start, aligned_end)) in cases {
            let window = ChunkWindow::covering(ByteInterval::new(start, end), g, total);
            assert_eq!(
                window,
                ChunkWindow { aligned_start, aligned_end },
                "interval {}-{} granularity {} total {}",
                start,
                end,
                g,
                total
            );
        }
    }

    #[tokio::test]
    async fn test_partial_range_scenario() {
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256));

        let (parts, err) =
            run(&source, 1000, ByteInterval::new(300, 700), AssemblerConfig::default()).await;

        assert!(err.is_none());
        assert_eq!(source.fetch_calls(), vec![(256, 512)]);
        assert_eq!(source.parts_yielded(), 2);
        // 256..511 trimmed to 300..511, 512..767 trimmed to 512..700
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![212, 189]);
        assert_eq!(concat(&parts), &data[300..=700]);
    }

    #[tokio::test]
    async fn test_full_file_and_tail_byte() {
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256));

        let (parts, err) =
            run(&source, 1000, ByteInterval::full(1000).unwrap(), AssemblerConfig::default()).await;
        assert!(err.is_none());
        assert_eq!(parts.len(), 4);
        assert_eq!(concat(&parts), data);

        let (parts, err) =
            run(&source, 1000, ByteInterval::new(999, 999), AssemblerConfig::default()).await;
        assert!(err.is_none());
        assert_eq!(concat(&parts), vec![data[999]]);
        assert_eq!(source.fetch_calls()[1], (768, 232));
    }

    #[tokio::test]
    async fn test_resumes_after_transient_failure() {
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256));
        source.push_fault(Fault::Fail {
            after_parts: 1,
            error: ChunkError::RemoteUnavailable("flood wait".into()),
        });

        let (parts, err) = run(&source, 1000, ByteInterval::new(300, 900), quick_config(3)).await;

        assert!(err.is_none());
        assert_eq!(concat(&parts), &data[300..=900]);
        assert_eq!(source.fetch_calls(), vec![(256, 744), (512, 488)]);
    }

    #[tokio::test]
    async fn test_resume_realigns_mid_chunk() {
        // Parts smaller than the granularity leave the cursor mid-chunk
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256).with_part_size(100));
        source.push_fault(Fault::Fail {
            after_parts: 3,
            error: ChunkError::RemoteUnavailable("connection reset".into()),
        });

        let (parts, err) = run(&source, 1000, ByteInterval::full(1000).unwrap(), quick_config(3)).await;

        assert!(err.is_none());
        assert_eq!(concat(&parts), data);
        assert_eq!(source.fetch_calls(), vec![(0, 1000), (256, 744)]);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256));
        for _ in 0..5 {
            source.push_fault(Fault::Fail {
                after_parts: 0,
                error: ChunkError::RemoteUnavailable("503".into()),
            });
        }

        let (parts, err) = run(&source, 1000, ByteInterval::new(0, 999), quick_config(3)).await;

        assert!(parts.is_empty());
        let err = err.expect("stream should be interrupted");
        assert_eq!(err.offset, 0);
        assert!(err.cause.is_transient());
        assert_eq!(source.fetch_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_handle_invalid_is_not_retried() {
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256));
        source.push_fault(Fault::Fail {
            after_parts: 2,
            error: ChunkError::HandleInvalid("file reference expired".into()),
        });

        let (parts, err) = run(&source, 1000, ByteInterval::full(1000).unwrap(), quick_config(3)).await;

        assert_eq!(concat(&parts), &data[..512]);
        let err = err.expect("stream should be interrupted");
        assert_eq!(err.offset, 512);
        assert!(matches!(err.cause, ChunkError::HandleInvalid(_)));
        assert_eq!(source.fetch_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_fetch_times_out_and_is_cancelled() {
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256));
        source.push_fault(Fault::Stall { after_parts: 0 });
        source.push_fault(Fault::Stall { after_parts: 0 });

        let (parts, err) = run(&source, 1000, ByteInterval::new(0, 99), quick_config(2)).await;

        assert!(parts.is_empty());
        assert!(err.expect("timed out").cause.is_transient());
        assert_eq!(source.fetch_calls().len(), 2);
        assert_eq!(source.streams_dropped(), 2);
    }

    #[tokio::test]
    async fn test_stall_then_recovery() {
        let data = reference_bytes(1000);
        let source = Arc::new(ScriptedChunkSource::new(data.clone(), 256));
        source.push_fault(Fault::Stall { after_parts: 1 });

        let (parts, err) = run(&source, 1000, ByteInterval::full(1000).unwrap(), quick_config(2)).await;

        assert!(err.is_none());
        assert_eq!(concat(&parts), data);
        assert_eq!(source.fetch_calls(), vec![(0, 1000), (256, 744)]);
    }

    #[tokio::test]
    async fn test_short_remote_file_is_fatal() {
        let source = Arc::new(ScriptedChunkSource::new(reference_bytes(600), 256));

        let (parts, err) = run(&source, 1000, ByteInterval::full(1000).unwrap(), quick_config(3)).await;

        assert_eq!(concat(&parts).len(), 600);
        let err = err.expect("descriptor mismatch");
        assert_eq!(err.offset, 600);
        assert!(matches!(err.cause, ChunkError::HandleInvalid(_)));
    }

    #[tokio::test]
    async fn test_no_read_ahead() {
        let granularity = 64;
        let total = granularity * 64;
        let source = Arc::new(ScriptedChunkSource::new(reference_bytes(total as usize), granularity));

        let stream = assemble(
            source.clone(),
            FileHandle::new("big.bin"),
            total,
            ByteInterval::full(total).unwrap(),
            AssemblerConfig::default(),
        );
        futures_util::pin_mut!(stream);

        for pulled in 1..=3 {
            let part = stream.next().await.unwrap().unwrap();
            assert!(part.len() as u64 <= granularity);
            assert!(source.parts_yielded() <= pulled + 1);
        }
        assert_eq!(source.fetch_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_ranges_are_identical() {
        let data = reference_bytes(5000);
        let source = Arc::new(ScriptedChunkSource::new(data, 512));
        let interval = ByteInterval::new(1234, 4321);

        let (first, _) = run(&source, 5000, interval, AssemblerConfig::default()).await;
        let (second, _) = run(&source, 5000, interval, AssemblerConfig::default()).await;
        assert_eq!(concat(&first), concat(&second));
        assert_eq!(concat(&first).len() as u64, interval.len());
    }
}
