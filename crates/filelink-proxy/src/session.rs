use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::range::ByteInterval;

/// Default number of concurrent remote download sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 8;

#[derive(Default)]
struct PoolCounters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Bounded pool of remote transport sessions.
///
/// A permit is taken before a response starts streaming and handed back
/// when the [`SessionPermit`] is dropped, on every exit path.
pub struct SessionPool {
    semaphore: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
    capacity: usize,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(PoolCounters::default()),
            capacity,
        }
    }

    /// Wait up to `wait` for a free session. `None` means the pool stayed full.
    pub async fn acquire(&self, wait: Duration) -> Option<SessionPermit> {
        let permit = tokio::time::timeout(wait, self.semaphore.clone().acquire_owned())
            .await
            .ok()?
            .ok()?;
        self.counters.acquired.fetch_add(1, Ordering::Release);
        Some(SessionPermit {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions currently held.
    pub fn active(&self) -> u64 {
        // Acquired first: a later `released` can only make the result smaller
        let acquired = self.counters.acquired.load(Ordering::Acquire);
        acquired.saturating_sub(self.counters.released.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::Acquire)
    }
}

pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<PoolCounters>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Release);
    }
}

/// Per-request streaming state. Owns the session permit, so dropping the
/// session (response finished, client gone, or remote failure) frees it.
pub struct StreamSession {
    token: String,
    interval: ByteInterval,
    emitted: u64,
    interrupted: bool,
    _permit: SessionPermit,
}

impl StreamSession {
    pub fn new(token: String, interval: ByteInterval, permit: SessionPermit) -> Self {
        Self {
            token,
            interval,
            emitted: 0,
            interrupted: false,
            _permit: permit,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.emitted += bytes as u64;
    }

    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn is_complete(&self) -> bool {
        self.emitted >= self.interval.len()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.is_complete() {
            debug!(
                "{}: sent bytes {}-{} ({} bytes)",
                self.token, self.interval.start, self.interval.end, self.emitted
            );
        } else if !self.interrupted {
            // Client disconnect, not an error
            debug!(
                "{}: client went away after {} of {} bytes",
                self.token,
                self.emitted,
                self.interval.len()
            );
        }
    }
}
