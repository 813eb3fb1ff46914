//! Deterministic test doubles for the registry and the remote transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use filelink_types::{FileDescriptor, FileHandle};
use futures_util::StreamExt;

use crate::chunk_source::{ChunkError, ChunkSource, ChunkStream};
use crate::registry::{LinkRegistry, ResolveError};

/// Reference file contents: a repeating pattern that makes misplaced
/// bytes obvious in assertions.
pub fn reference_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn descriptor(handle: &str, total_size: u64) -> FileDescriptor {
    FileDescriptor {
        handle: FileHandle::new(handle),
        total_size,
        mime_type: "application/pdf".into(),
        file_name: Some("report.pdf".into()),
        created_at: Utc::now(),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    }
}

/// In-memory registry. A token registered with [`MemoryRegistry::insert_broken`]
/// fails as if the backing store were down.
#[derive(Default)]
pub struct MemoryRegistry {
    links: RwLock<HashMap<String, Result<FileDescriptor, String>>>,
}

impl MemoryRegistry {
    pub fn insert(&self, token: &str, descriptor: FileDescriptor) {
        self.links
            .write()
            .unwrap()
            .insert(token.to_string(), Ok(descriptor));
    }

    pub fn insert_broken(&self, token: &str, failure: &str) {
        self.links
            .write()
            .unwrap()
            .insert(token.to_string(), Err(failure.to_string()));
    }
}

#[async_trait]
impl LinkRegistry for MemoryRegistry {
    async fn resolve(&self, token: &str) -> Result<FileDescriptor, ResolveError> {
        let descriptor = self
            .links
            .read()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(ResolveError::NotFound)?
            .map_err(ResolveError::Backend)?;
        if descriptor.is_expired(Utc::now()) {
            return Err(ResolveError::Expired);
        }
        Ok(descriptor)
    }
}

/// What a scripted fetch call does once it has yielded `after_parts` parts.
#[derive(Debug, Clone)]
pub enum Fault {
    Fail { after_parts: usize, error: ChunkError },
    /// Never yields again; only a timeout or a drop gets past it.
    Stall { after_parts: usize },
}

#[derive(Default)]
pub struct SourceStats {
    fetch_calls: Mutex<Vec<(u64, u64)>>,
    parts_yielded: AtomicUsize,
    streams_dropped: AtomicUsize,
}

struct DropCounter(Arc<SourceStats>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.streams_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory chunk source with fetch-call accounting and injected faults.
///
/// Each `fetch` pops the next scripted [`Fault`] (if any). Parts are
/// `part_size` bytes, which defaults to the granularity.
pub struct ScriptedChunkSource {
    data: Bytes,
    granularity: u64,
    part_size: u64,
    faults: Mutex<VecDeque<Fault>>,
    stats: Arc<SourceStats>,
}

impl ScriptedChunkSource {
    pub fn new(data: Vec<u8>, granularity: u64) -> Self {
        Self {
            data: Bytes::from(data),
            granularity,
            part_size: granularity,
            faults: Mutex::new(VecDeque::new()),
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    /// `(offset, max_len)` of every fetch call, in order.
    pub fn fetch_calls(&self) -> Vec<(u64, u64)> {
        self.stats.fetch_calls.lock().unwrap().clone()
    }

    pub fn parts_yielded(&self) -> usize {
        self.stats.parts_yielded.load(Ordering::SeqCst)
    }

    pub fn streams_dropped(&self) -> usize {
        self.stats.streams_dropped.load(Ordering::SeqCst)
    }
}

impl ChunkSource for ScriptedChunkSource {
    fn granularity(&self) -> u64 {
        self.granularity
    }

    fn fetch(&self, _handle: &FileHandle, offset: u64, max_len: u64) -> ChunkStream {
        self.stats.fetch_calls.lock().unwrap().push((offset, max_len));
        let fault = self.faults.lock().unwrap().pop_front();
        let guard = DropCounter(self.stats.clone());
        let stats = self.stats.clone();
        let data = self.data.clone();
        let part_size = self.part_size;
        let aligned = offset % self.granularity == 0;

        async_stream::stream! {
            let _guard = guard;
            if !aligned {
                yield Err(ChunkError::HandleInvalid(format!("misaligned fetch at {}", offset)));
                return;
            }

            let total = data.len() as u64;
            let end = offset.saturating_add(max_len).min(total);
            let mut pos = offset;
            let mut index = 0;
            while pos < end {
                match &fault {
                    Some(Fault::Fail { after_parts, error }) if *after_parts == index => {
                        yield Err(error.clone());
                        return;
                    }
                    Some(Fault::Stall { after_parts }) if *after_parts == index => {
                        std::future::pending::<()>().await;
                    }
                    _ => {}
                }
                let next = (pos + part_size).min(end);
                stats.parts_yielded.fetch_add(1, Ordering::SeqCst);
                yield Ok(data.slice(pos as usize..next as usize));
                pos = next;
                index += 1;
            }
        }
        .boxed()
    }
}
