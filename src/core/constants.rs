//! Protocol limits and timing defaults.
//!
//! These are the crate-wide defaults; the tunable subset is overridable
//! through [`crate::manager::ManagerConfig`].

use std::time::Duration;

// =============================================================================
// FRAMING
// =============================================================================

/// Maximum data-frame payload, chosen to keep datagrams under common MTUs.
pub const DEFAULT_MAX_PAYLOAD: usize = 1200;

/// Default send-queue capacity: bytes that may be queued/unacknowledged per
/// channel before `send` reports `QueueFull`.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256 * 1024;

/// Default reorder window: frames buffered ahead of the in-order cursor.
/// Arrivals farther ahead than this are dropped and recovered by the
/// sender's retransmission.
pub const DEFAULT_REORDER_WINDOW: u64 = 256;

// =============================================================================
// RELIABILITY
// =============================================================================

/// Maximum retransmissions of a single frame before the channel fails.
pub const MAX_RETRANSMITS: u32 = 10;

/// Duplicate cumulative acks that trigger one fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Initial congestion window (frames in flight).
pub const CWND_INITIAL: usize = 16;

/// Congestion window floor after timeout halving.
pub const CWND_MIN: usize = 4;

/// Congestion window cap.
pub const CWND_MAX: usize = 256;

// =============================================================================
// HANDSHAKES
// =============================================================================

/// Open handshake deadline: the channel errors with `HandshakeTimeout`
/// (or `PeerUnreachable` on rejection) if not Open by then.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// First OPEN retransmit interval; doubles per attempt.
pub const OPEN_RETX_INTERVAL: Duration = Duration::from_secs(1);

/// Graceful close deadline: the channel transitions to Closed even if the
/// peer never acknowledges the close frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// CLOSE retransmit interval.
pub const CLOSE_RETX_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum CLOSE transmissions during the close handshake.
pub const CLOSE_MAX_TRIES: u32 = 3;

// =============================================================================
// TIMERS
// =============================================================================

/// Worker sweep interval for retransmissions and handshake deadlines.
pub const FAST_TICK: Duration = Duration::from_millis(20);

/// Speed sampling interval (the counters are rates over this window).
pub const DEFAULT_SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Idle-channel RTT probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
