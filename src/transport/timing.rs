//! RTT estimation and probe timing.
//!
//! RTT samples come from two sources: cumulative acks covering frames that
//! were never retransmitted (Karn's rule), and probe/echo exchanges on idle
//! channels. Both feed the same RFC 6298 estimator, which sizes the
//! retransmission timeout.

use std::time::{Duration, Instant};

/// RTT timing constants.
pub mod constants {
    use std::time::Duration;

    /// Retransmission timeout before the first RTT sample.
    pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

    /// Minimum retransmission timeout.
    pub const MIN_RTO: Duration = Duration::from_millis(100);

    /// Maximum retransmission timeout.
    pub const MAX_RTO: Duration = Duration::from_millis(60000);

    /// Alpha for SRTT smoothing (1/8).
    pub const SRTT_ALPHA: f64 = 0.125;

    /// Beta for RTTVAR smoothing (1/4).
    pub const RTTVAR_BETA: f64 = 0.25;

    /// K multiplier for RTO calculation (RFC 6298).
    pub const RTO_K: f64 = 4.0;

    /// Minimum granularity term in the RTO formula.
    pub const MIN_RTO_GRANULARITY_MS: f64 = 100.0;
}

/// RTT estimator implementing RFC 6298, extended with the most recent raw
/// sample so callers can report both `rtt` and `srtt`.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Most recent raw sample in milliseconds.
    last_sample: f64,
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Current retransmission timeout.
    rto: Duration,
    /// Whether the first sample has arrived.
    initialized: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create a new estimator with initial values.
    pub fn new() -> Self {
        Self {
            last_sample: 0.0,
            srtt: 0.0,
            rttvar: 0.0,
            rto: constants::INITIAL_RTO,
            initialized: false,
        }
    }

    /// Update with a new RTT sample.
    ///
    /// First measurement: SRTT = sample, RTTVAR = sample / 2.
    /// Subsequent: RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - sample|,
    /// SRTT = 7/8 SRTT + 1/8 sample.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.last_sample = sample_ms;

        if !self.initialized {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.initialized = true;
        } else {
            self.rttvar = (1.0 - constants::RTTVAR_BETA) * self.rttvar
                + constants::RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt =
                (1.0 - constants::SRTT_ALPHA) * self.srtt + constants::SRTT_ALPHA * sample_ms;
        }

        // RTO = SRTT + max(G, K * RTTVAR), clamped to [MIN_RTO, MAX_RTO]
        let rto_ms =
            self.srtt + f64::max(constants::MIN_RTO_GRANULARITY_MS, constants::RTO_K * self.rttvar);
        let rto_ms = rto_ms.clamp(
            constants::MIN_RTO.as_millis() as f64,
            constants::MAX_RTO.as_millis() as f64,
        );
        self.rto = Duration::from_millis(rto_ms as u64);
    }

    /// Most recent raw RTT sample, in whole milliseconds.
    pub fn rtt_ms(&self) -> u32 {
        self.last_sample.round() as u32
    }

    /// Smoothed RTT, in whole milliseconds.
    pub fn srtt_ms(&self) -> u32 {
        self.srtt.round() as u32
    }

    /// Smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt / 1000.0)
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Whether at least one sample has been observed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Double the RTO after a retransmission timeout (capped at MAX_RTO).
    pub fn backoff(&mut self) -> Duration {
        let doubled = (self.rto.as_millis() as u64).saturating_mul(2);
        self.rto = Duration::from_millis(doubled).min(constants::MAX_RTO);
        self.rto
    }
}

/// Probe clock for idle-channel RTT measurement.
///
/// Probe frames carry a u32 millisecond timestamp relative to the channel
/// epoch; the peer echoes it back and the echo yields an RTT sample. Only
/// one probe is outstanding at a time: a new probe replaces a stale one.
#[derive(Debug, Clone)]
pub struct ProbeClock {
    /// Channel epoch; probe timestamps are milliseconds since this instant.
    epoch: Instant,
    /// Outstanding probe: the timestamp sent and when it was sent.
    pending: Option<(u32, Instant)>,
}

impl ProbeClock {
    /// Create a probe clock with its epoch at now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            pending: None,
        }
    }

    /// Current timestamp (ms since the channel epoch).
    pub fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Record an outgoing probe.
    pub fn on_probe_sent(&mut self, timestamp: u32) {
        self.pending = Some((timestamp, Instant::now()));
    }

    /// Whether a probe is outstanding.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Process an echo. Returns an RTT sample if it matches the
    /// outstanding probe.
    pub fn on_echo(&mut self, echo: u32) -> Option<Duration> {
        let (sent_ts, sent_at) = self.pending?;
        if echo != sent_ts {
            return None;
        }
        self.pending = None;
        Some(sent_at.elapsed())
    }
}

impl Default for ProbeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimator_initial() {
        let estimator = RttEstimator::new();
        assert!(!estimator.is_initialized());
        assert_eq!(estimator.rto(), constants::INITIAL_RTO);
        assert_eq!(estimator.rtt_ms(), 0);
        assert_eq!(estimator.srtt_ms(), 0);
    }

    #[test]
    fn test_estimator_first_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        assert!(estimator.is_initialized());
        assert_eq!(estimator.rtt_ms(), 100);
        assert_eq!(estimator.srtt_ms(), 100);
    }

    #[test]
    fn test_estimator_smoothing_moves_toward_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));
        estimator.update(Duration::from_millis(180));

        let srtt = estimator.srtt_ms();
        assert!(srtt > 100);
        assert!(srtt < 180);
        // Latest raw sample is reported as-is
        assert_eq!(estimator.rtt_ms(), 180);
    }

    #[test]
    fn test_estimator_converges() {
        let mut estimator = RttEstimator::new();
        // Start far off, then feed a stationary latency
        estimator.update(Duration::from_millis(500));
        for _ in 0..20 {
            estimator.update(Duration::from_millis(50));
        }
        let srtt = estimator.srtt_ms() as f64;
        assert!((srtt - 50.0).abs() / 50.0 < 0.05, "srtt {srtt} not within 5%");
    }

    #[test]
    fn test_estimator_backoff_caps() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        let rto1 = estimator.rto();
        let rto2 = estimator.backoff();
        assert!(rto2 > rto1);

        for _ in 0..20 {
            estimator.backoff();
        }
        assert_eq!(estimator.rto(), constants::MAX_RTO);
    }

    #[test]
    fn test_estimator_min_rto() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_micros(100));
        assert!(estimator.rto() >= constants::MIN_RTO);
    }

    #[test]
    fn test_probe_clock_echo() {
        let mut clock = ProbeClock::new();
        let ts = clock.now_ms();
        clock.on_probe_sent(ts);
        assert!(clock.has_pending());

        std::thread::sleep(Duration::from_millis(10));
        let rtt = clock.on_echo(ts).unwrap();
        assert!(rtt >= Duration::from_millis(10));
        assert!(!clock.has_pending());
    }

    #[test]
    fn test_probe_clock_mismatched_echo() {
        let mut clock = ProbeClock::new();
        clock.on_probe_sent(1000);

        assert!(clock.on_echo(999).is_none());
        // Pending probe is still outstanding
        assert!(clock.has_pending());
    }

    #[test]
    fn test_probe_clock_no_pending() {
        let mut clock = ProbeClock::new();
        assert!(clock.on_echo(0).is_none());
    }
}
