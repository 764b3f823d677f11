//! Channels: reliable, ordered, flow-controlled virtual circuits.
//!
//! A [`Channel`] is a cheap cloneable handle. All protocol state lives in
//! the manager's worker task; the handle carries just enough cached state
//! (atomics) to answer `send` admission and the statistics getters without
//! a cross-thread round trip. Everything else is marshaled onto the worker
//! through the manager's command queue.

mod state;

pub(crate) use state::ChannelCore;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::{ChannelError, ChannelId, ChannelObserver, PeerId, VportId};
use crate::manager::Command;

/// Channel lifecycle state.
///
/// Transitions are forward-only: Opening → Open → Closing → Closed, or to
/// Errored from any non-terminal state. Closed and Errored are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelPhase {
    /// Open handshake in progress.
    Opening = 0,
    /// Established; data flows.
    Open = 1,
    /// Close handshake in progress.
    Closing = 2,
    /// Closed (terminal).
    Closed = 3,
    /// Failed (terminal).
    Errored = 4,
}

impl ChannelPhase {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Opening,
            1 => Self::Open,
            2 => Self::Closing,
            3 => Self::Closed,
            _ => Self::Errored,
        }
    }

    /// Whether the phase is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    /// Whether `send` is still admitted in this phase.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Opening | Self::Open)
    }
}

/// Statistics snapshot for one channel.
///
/// The speed fields are rates: bytes over the most recent completed
/// sampling window (1 second by default), not cumulative totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Channel id.
    pub id: ChannelId,
    /// Most recent RTT sample, milliseconds.
    pub rtt_ms: u32,
    /// Smoothed RTT, milliseconds.
    pub srtt_ms: u32,
    /// Application bytes received per window.
    pub data_in_speed: u64,
    /// Application bytes sent per window.
    pub data_out_speed: u64,
    /// Protocol overhead bytes received per window.
    pub proto_in_speed: u64,
    /// Protocol overhead bytes sent per window.
    pub proto_out_speed: u64,
}

/// Handle-visible channel state, shared between the handle clones and the
/// worker-owned core.
pub(crate) struct ChannelShared {
    pub(crate) id: ChannelId,
    pub(crate) remote_peer: PeerId,
    pub(crate) remote_vport: VportId,
    pub(crate) phase: AtomicU8,
    /// Bytes accepted by `send` and not yet acknowledged by the peer.
    pub(crate) queued_bytes: AtomicUsize,
    pub(crate) queue_capacity: usize,
    /// Latched by a rejected `send`; cleared by the worker when room
    /// returns, firing exactly one `writable`.
    pub(crate) queue_full: AtomicBool,
    pub(crate) rtt_ms: AtomicU32,
    pub(crate) srtt_ms: AtomicU32,
    pub(crate) data_in_rate: AtomicU64,
    pub(crate) data_out_rate: AtomicU64,
    pub(crate) proto_in_rate: AtomicU64,
    pub(crate) proto_out_rate: AtomicU64,
}

impl ChannelShared {
    pub(crate) fn new(
        id: ChannelId,
        remote_peer: PeerId,
        remote_vport: VportId,
        phase: ChannelPhase,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_peer,
            remote_vport,
            phase: AtomicU8::new(phase as u8),
            queued_bytes: AtomicUsize::new(0),
            queue_capacity,
            queue_full: AtomicBool::new(false),
            rtt_ms: AtomicU32::new(0),
            srtt_ms: AtomicU32::new(0),
            data_in_rate: AtomicU64::new(0),
            data_out_rate: AtomicU64::new(0),
            proto_in_rate: AtomicU64::new(0),
            proto_out_rate: AtomicU64::new(0),
        })
    }

    pub(crate) fn phase(&self) -> ChannelPhase {
        ChannelPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: ChannelPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// A reliable, ordered, flow-controlled virtual circuit to a remote peer.
///
/// Handles are cheap clones and safe to use from any thread. `send` decides
/// admission synchronously from cached state; `close` and `set_observer`
/// are marshaled onto the manager's worker. Observer callbacks run on the
/// worker thread and must not block it.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Channel {
    /// The process-unique channel id.
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// The remote peer this channel is connected to.
    pub fn remote_peer(&self) -> &PeerId {
        &self.shared.remote_peer
    }

    /// The remote vport (the listening vport for initiated channels, the
    /// initiator's vport for accepted ones).
    pub fn remote_vport(&self) -> VportId {
        self.shared.remote_vport
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ChannelPhase {
        self.shared.phase()
    }

    /// Attach the observer that receives this channel's events.
    ///
    /// Data that arrived before the observer was attached is buffered and
    /// delivered, in order, as soon as it is.
    pub fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        let _ = self.cmd_tx.send(Command::SetObserver {
            id: self.shared.id,
            observer,
        });
    }

    /// Queue bytes for transmission. Non-blocking.
    ///
    /// Returns `Ok(())` when the data was accepted. `Err(QueueFull)` means
    /// the unacknowledged-byte budget is exhausted: stop sending and wait
    /// for the observer's `writable` callback, which fires exactly once per
    /// full-to-room transition. `Err(ChannelClosed)` means the channel is
    /// past its sending lifetime.
    pub fn send(&self, data: Vec<u8>) -> Result<(), ChannelError> {
        if !self.shared.phase().can_send() {
            return Err(ChannelError::ChannelClosed);
        }
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len();
        let capacity = self.shared.queue_capacity;
        let reserved = self.shared.queued_bytes.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |queued| {
                if queued + len > capacity {
                    None
                } else {
                    Some(queued + len)
                }
            },
        );
        if reserved.is_err() {
            self.shared.queue_full.store(true, Ordering::Release);
            return Err(ChannelError::QueueFull);
        }

        if self
            .cmd_tx
            .send(Command::Send {
                id: self.shared.id,
                data,
            })
            .is_err()
        {
            // Worker is gone; roll the reservation back.
            self.shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(ChannelError::ChannelClosed);
        }
        Ok(())
    }

    /// Close the channel gracefully. Idempotent; closing a channel that is
    /// already closing, closed, or errored is a no-op.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close { id: self.shared.id });
    }

    /// Most recent RTT sample, milliseconds.
    pub fn rtt(&self) -> u32 {
        self.shared.rtt_ms.load(Ordering::Acquire)
    }

    /// Smoothed RTT, milliseconds.
    pub fn srtt(&self) -> u32 {
        self.shared.srtt_ms.load(Ordering::Acquire)
    }

    /// Application bytes received over the last sampling window.
    pub fn data_in_speed(&self) -> u64 {
        self.shared.data_in_rate.load(Ordering::Acquire)
    }

    /// Application bytes sent over the last sampling window.
    pub fn data_out_speed(&self) -> u64 {
        self.shared.data_out_rate.load(Ordering::Acquire)
    }

    /// Protocol overhead bytes received over the last sampling window.
    pub fn proto_in_speed(&self) -> u64 {
        self.shared.proto_in_rate.load(Ordering::Acquire)
    }

    /// Protocol overhead bytes sent over the last sampling window.
    pub fn proto_out_speed(&self) -> u64 {
        self.shared.proto_out_rate.load(Ordering::Acquire)
    }

    /// Full statistics snapshot.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            id: self.shared.id,
            rtt_ms: self.rtt(),
            srtt_ms: self.srtt(),
            data_in_speed: self.data_in_speed(),
            data_out_speed: self.data_out_speed(),
            proto_in_speed: self.proto_in_speed(),
            proto_out_speed: self.proto_out_speed(),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("remote_peer", &self.shared.remote_peer)
            .field("remote_vport", &self.shared.remote_vport)
            .field("phase", &self.shared.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle(phase: ChannelPhase, capacity: usize) -> (Channel, mpsc::UnboundedReceiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = ChannelShared::new(
            ChannelId::from_u64(1),
            PeerId::new("peer").unwrap(),
            7,
            phase,
            capacity,
        );
        (Channel { shared, cmd_tx }, cmd_rx)
    }

    #[test]
    fn test_send_rejected_when_closed() {
        for phase in [ChannelPhase::Closing, ChannelPhase::Closed, ChannelPhase::Errored] {
            let (channel, _rx) = test_handle(phase, 1024);
            assert_eq!(channel.send(vec![1]), Err(ChannelError::ChannelClosed));
        }
    }

    #[test]
    fn test_send_reserves_bytes_until_full() {
        let (channel, mut rx) = test_handle(ChannelPhase::Open, 10);

        assert!(channel.send(vec![0; 6]).is_ok());
        assert!(channel.send(vec![0; 4]).is_ok());
        // Budget exhausted
        assert_eq!(channel.send(vec![0; 1]), Err(ChannelError::QueueFull));
        assert!(channel.shared.queue_full.load(Ordering::Acquire));

        // Both accepted sends reached the command queue
        assert!(matches!(rx.try_recv(), Ok(Command::Send { .. })));
        assert!(matches!(rx.try_recv(), Ok(Command::Send { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_oversized_single_buffer() {
        let (channel, _rx) = test_handle(ChannelPhase::Open, 10);
        assert_eq!(channel.send(vec![0; 11]), Err(ChannelError::QueueFull));
    }

    #[test]
    fn test_send_empty_is_noop() {
        let (channel, mut rx) = test_handle(ChannelPhase::Open, 10);
        assert!(channel.send(Vec::new()).is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.shared.queued_bytes.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_send_rolls_back_when_worker_gone() {
        let (channel, rx) = test_handle(ChannelPhase::Open, 10);
        drop(rx);
        assert_eq!(channel.send(vec![0; 4]), Err(ChannelError::ChannelClosed));
        assert_eq!(channel.shared.queued_bytes.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_phase_transitions_forward_only_markers() {
        assert!(!ChannelPhase::Opening.is_terminal());
        assert!(!ChannelPhase::Open.is_terminal());
        assert!(!ChannelPhase::Closing.is_terminal());
        assert!(ChannelPhase::Closed.is_terminal());
        assert!(ChannelPhase::Errored.is_terminal());

        assert!(ChannelPhase::Opening.can_send());
        assert!(ChannelPhase::Open.can_send());
        assert!(!ChannelPhase::Closing.can_send());
    }
}
