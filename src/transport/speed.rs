//! Rolling-window throughput counters.
//!
//! Each channel keeps four meters (data-in, data-out, proto-in, proto-out).
//! Bytes accumulate in the current bucket; the 1 Hz sampling tick closes the
//! bucket and publishes it as the rate, so the reported speeds are bytes
//! over the most recent completed window, not cumulative totals.

/// A single bytes-per-window meter.
#[derive(Debug, Clone, Default)]
pub struct SpeedMeter {
    /// Bytes accumulated in the open bucket.
    bucket: u64,
    /// The last completed bucket, reported as the current rate.
    rate: u64,
}

impl SpeedMeter {
    /// Create an empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account bytes into the open bucket.
    pub fn add(&mut self, bytes: usize) {
        self.bucket = self.bucket.saturating_add(bytes as u64);
    }

    /// Close the bucket: the accumulated bytes become the rate and a new
    /// bucket opens. Returns the new rate.
    pub fn sample(&mut self) -> u64 {
        self.rate = self.bucket;
        self.bucket = 0;
        self.rate
    }

    /// The last completed bucket (bytes over the last sampling window).
    pub fn rate(&self) -> u64 {
        self.rate
    }
}
