//! Circular bucket timeline.

/// Maps wall-clock time onto a ring of fixed-width buckets.
///
/// The ring covers `span_secs` seconds and is divided into buckets of
/// `interval_secs` seconds each. Time wraps every `span_secs`, so the same
/// bucket index is reused once per lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    span_secs: u64,
    interval_secs: u64,
    bucket_count: usize,
}

impl BucketClock {
    /// Create a clock. Callers are expected to have validated that
    /// `interval_secs` is non-zero and evenly divides `span_secs`.
    pub(crate) fn new(span_secs: u64, interval_secs: u64) -> Self {
        Self {
            span_secs,
            interval_secs,
            bucket_count: (span_secs / interval_secs) as usize,
        }
    }

    /// Bucket index for a point in time given as epoch milliseconds.
    pub fn bucket_of(&self, time_millis: u64) -> usize {
        let secs = time_millis / 1000;
        ((secs % self.span_secs) / self.interval_secs) as usize
    }

    /// Step `delta` buckets around the ring from `index`, in either direction.
    pub fn step(&self, index: usize, delta: i64) -> usize {
        let n = self.bucket_count as i64;
        (index as i64 + delta).rem_euclid(n) as usize
    }

    /// Number of buckets on the ring.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn span_secs(&self) -> u64 {
        self.span_secs
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }
}
