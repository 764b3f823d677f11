//! Wire format and transport-level bookkeeping.
//!
//! - **Frame encoding/decoding**: [`Frame`], kind-specific bodies, and the
//!   source-identity datagram envelope
//! - **RTT estimation**: [`RttEstimator`] implementing RFC 6298, plus the
//!   [`ProbeClock`] for idle-channel samples
//! - **Throughput accounting**: [`SpeedMeter`] rolling-window counters
//!
//! The reliability and flow-control logic that uses these pieces lives in
//! [`crate::channel`]; nothing here performs I/O.

mod frame;
mod speed;
mod timing;

pub use frame::*;
pub use speed::SpeedMeter;
pub use timing::{constants as timing_constants, ProbeClock, RttEstimator};
