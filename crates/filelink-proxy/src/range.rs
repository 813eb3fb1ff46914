//! HTTP `Range` negotiation for single byte ranges.
//!
//! Multi-range requests (`bytes=0-1,5-6`) are answered with 416: only one
//! contiguous interval is ever streamed. A `Range` header with a unit other
//! than `bytes` is ignored and the full content is served.

/// Inclusive byte range `[start, end]` with `start <= end < total_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteInterval {
    pub start: u64,
    pub end: u64,
}

impl ByteInterval {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted interval {}-{}", start, end);
        Self { start, end }
    }

    /// The whole file, or `None` for an empty file.
    pub fn full(total_size: u64) -> Option<Self> {
        (total_size > 0).then(|| Self::new(0, total_size - 1))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Result of matching a request's `Range` header against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No usable range: serve everything with 200.
    Full,
    /// Serve this interval with 206.
    Partial(ByteInterval),
    /// Answer 416 with `Content-Range: bytes */{total}`.
    Unsatisfiable,
}

pub fn negotiate(header: Option<&str>, total_size: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };
    // Range units are case-insensitive
    let byte_range = match header.trim().split_once('=') {
        Some((unit, rest)) if unit.trim().eq_ignore_ascii_case("bytes") => rest,
        _ => return RangeOutcome::Full,
    };
    if byte_range.contains(',') {
        return RangeOutcome::Unsatisfiable;
    }
    let Some((first, last)) = byte_range.trim().split_once('-') else {
        return RangeOutcome::Unsatisfiable;
    };
    let (first, last) = (first.trim(), last.trim());

    if total_size == 0 {
        return RangeOutcome::Unsatisfiable;
    }
    let last_byte = total_size - 1;

    match (first.is_empty(), last.is_empty()) {
        // bytes=-N: the final N bytes
        (true, false) => match parse_offset(last) {
            Some(0) | None => RangeOutcome::Unsatisfiable,
            Some(n) => {
                let start = total_size.saturating_sub(n);
                RangeOutcome::Partial(ByteInterval::new(start, last_byte))
            }
        },
        // bytes=A-
        (false, true) => match parse_offset(first) {
            Some(start) if start <= last_byte => {
                RangeOutcome::Partial(ByteInterval::new(start, last_byte))
            }
            _ => RangeOutcome::Unsatisfiable,
        },
        // bytes=A-B, B clamped to EOF
        (false, false) => match (parse_offset(first), parse_offset(last)) {
            (Some(start), Some(end)) if start <= end && start <= last_byte => {
                RangeOutcome::Partial(ByteInterval::new(start, end.min(last_byte)))
            }
            _ => RangeOutcome::Unsatisfiable,
        },
        (true, true) => RangeOutcome::Unsatisfiable,
    }
}

/// Digits only; `u64::from_str` would also take a leading `+`.
fn parse_offset(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
