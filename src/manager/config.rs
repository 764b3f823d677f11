//! Channel manager configuration.

use std::time::Duration;

use crate::core::constants;

/// Tunables for a [`crate::manager::ChannelManager`].
///
/// The defaults are validated against the crate's delivery and
/// backpressure properties; most deployments only ever touch the queue
/// capacity and timeouts.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum data-frame payload in bytes.
    pub max_payload: usize,

    /// Per-channel unacknowledged-byte budget; `send` reports `QueueFull`
    /// beyond it.
    pub send_queue_capacity: usize,

    /// Frames buffered ahead of the in-order delivery cursor before
    /// arrivals are treated as loss and dropped.
    pub reorder_window: u64,

    /// Retransmissions of a single frame before the channel fails with
    /// `PeerUnreachable`.
    pub max_retransmits: u32,

    /// Open handshake deadline.
    pub handshake_timeout: Duration,

    /// Graceful close deadline.
    pub close_timeout: Duration,

    /// Idle-channel RTT probe interval.
    pub probe_interval: Duration,

    /// Speed counter sampling window.
    pub speed_sample_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_payload: constants::DEFAULT_MAX_PAYLOAD,
            send_queue_capacity: constants::DEFAULT_SEND_QUEUE_CAPACITY,
            reorder_window: constants::DEFAULT_REORDER_WINDOW,
            max_retransmits: constants::MAX_RETRANSMITS,
            handshake_timeout: constants::DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: constants::DEFAULT_CLOSE_TIMEOUT,
            probe_interval: constants::DEFAULT_PROBE_INTERVAL,
            speed_sample_interval: constants::DEFAULT_SPEED_SAMPLE_INTERVAL,
        }
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Create a builder seeded with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum data-frame payload.
    pub fn max_payload(mut self, bytes: usize) -> Self {
        self.config.max_payload = bytes;
        self
    }

    /// Set the per-channel send-queue capacity.
    pub fn send_queue_capacity(mut self, bytes: usize) -> Self {
        self.config.send_queue_capacity = bytes;
        self
    }

    /// Set the reorder window, in frames.
    pub fn reorder_window(mut self, frames: u64) -> Self {
        self.config.reorder_window = frames;
        self
    }

    /// Set the per-frame retransmission limit.
    pub fn max_retransmits(mut self, count: u32) -> Self {
        self.config.max_retransmits = count;
        self
    }

    /// Set the open handshake deadline.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the graceful close deadline.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the idle-channel probe interval.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = ManagerConfigBuilder::new()
            .max_payload(800)
            .send_queue_capacity(8 * 1024)
            .reorder_window(32)
            .handshake_timeout(Duration::from_secs(2))
            .build();

        assert_eq!(config.max_payload, 800);
        assert_eq!(config.send_queue_capacity, 8 * 1024);
        assert_eq!(config.reorder_window, 32);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        // Untouched fields keep their defaults
        assert_eq!(config.max_retransmits, constants::MAX_RETRANSMITS);
    }
}
