//! Worker-owned channel state: framing, reliability, ordering, and flow
//! control.
//!
//! `ChannelCore` is the single-writer side of a channel. It is owned by the
//! manager's worker task and never locked: handles reach it only through
//! the command queue, and every method here runs on the worker. Methods
//! that can produce outbound traffic take an `out` vector; the manager
//! sends whatever accumulates there to the channel's remote peer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::constants;
use crate::core::{ChannelError, ChannelObserver, PeerId, VportId};
use crate::manager::ManagerConfig;
use crate::transport::{
    decode_probe_body, encode_probe_body, timing_constants, AcceptBody, Frame, FrameKind,
    OpenBody, ProbeClock, RttEstimator, SpeedMeter, FRAME_HEADER_SIZE,
};

use super::{Channel, ChannelPhase, ChannelStats};

/// One data frame in the send path, before and after transmission.
#[derive(Debug)]
struct PendingFrame {
    seq: u64,
    payload: Vec<u8>,
    sent_at: Instant,
    retransmits: u32,
    rto: Duration,
}

/// Worker-owned state of one channel.
pub(crate) struct ChannelCore {
    handle: Channel,
    observer: Option<Arc<dyn ChannelObserver>>,
    config: ManagerConfig,

    id: u64,
    local_vport: VportId,
    /// The peer's channel id, learned from OPEN (accepted side) or ACCEPT
    /// (initiating side). Outbound frames address this id.
    remote_id: Option<u64>,
    /// Demux-index key for accepted channels: (peer, initiator id).
    accept_key: Option<(PeerId, u64)>,
    initiator: bool,
    phase: ChannelPhase,

    // ---- transmit path ----
    next_tx_seq: u64,
    unsent: VecDeque<PendingFrame>,
    in_flight: VecDeque<PendingFrame>,
    cwnd: usize,
    dup_ack_count: u32,
    last_ack_seen: u64,

    // ---- receive path ----
    next_rx_seq: u64,
    reorder: BTreeMap<u64, Vec<u8>>,
    ack_pending: bool,
    pending_delivery: VecDeque<Vec<u8>>,
    pending_error: Option<ChannelError>,
    writable_pending: bool,
    error_delivered: bool,

    // ---- timing ----
    rtt: RttEstimator,
    probe: ProbeClock,
    last_probe_at: Instant,
    open_deadline: Instant,
    open_retx_at: Instant,
    open_tries: u32,
    close_deadline: Instant,
    close_retx_at: Instant,
    close_tries: u32,

    // ---- throughput ----
    data_in: SpeedMeter,
    data_out: SpeedMeter,
    proto_in: SpeedMeter,
    proto_out: SpeedMeter,
}

impl ChannelCore {
    /// Create the core for a channel this process is opening.
    pub(crate) fn new_initiator(
        handle: Channel,
        local_vport: VportId,
        config: ManagerConfig,
    ) -> Self {
        Self::new(handle, local_vport, None, None, config)
    }

    /// Create the core for a channel accepted from a remote OPEN request.
    pub(crate) fn new_accepted(
        handle: Channel,
        local_vport: VportId,
        remote_id: u64,
        config: ManagerConfig,
    ) -> Self {
        let peer = handle.remote_peer().clone();
        Self::new(
            handle,
            local_vport,
            Some(remote_id),
            Some((peer, remote_id)),
            config,
        )
    }

    fn new(
        handle: Channel,
        local_vport: VportId,
        remote_id: Option<u64>,
        accept_key: Option<(PeerId, u64)>,
        config: ManagerConfig,
    ) -> Self {
        let now = Instant::now();
        let id = handle.id().as_u64();
        let phase = handle.phase();
        Self {
            handle,
            observer: None,
            config,
            id,
            local_vport,
            remote_id,
            accept_key,
            initiator: remote_id.is_none(),
            phase,
            next_tx_seq: 0,
            unsent: VecDeque::new(),
            in_flight: VecDeque::new(),
            cwnd: constants::CWND_INITIAL,
            dup_ack_count: 0,
            last_ack_seen: 0,
            next_rx_seq: 0,
            reorder: BTreeMap::new(),
            ack_pending: false,
            pending_delivery: VecDeque::new(),
            pending_error: None,
            writable_pending: false,
            error_delivered: false,
            rtt: RttEstimator::new(),
            probe: ProbeClock::new(),
            last_probe_at: now,
            open_deadline: now,
            open_retx_at: now,
            open_tries: 0,
            close_deadline: now,
            close_retx_at: now,
            close_tries: 0,
            data_in: SpeedMeter::new(),
            data_out: SpeedMeter::new(),
            proto_in: SpeedMeter::new(),
            proto_out: SpeedMeter::new(),
        }
    }

    /// The handle for this channel (cloned into observer callbacks).
    pub(crate) fn handle(&self) -> &Channel {
        &self.handle
    }

    /// The peer on the other end.
    pub(crate) fn remote_peer(&self) -> &PeerId {
        self.handle.remote_peer()
    }

    /// Demux-index key for accepted channels.
    pub(crate) fn accept_key(&self) -> Option<&(PeerId, u64)> {
        self.accept_key.as_ref()
    }

    /// Whether the manager should drop this core from its table.
    pub(crate) fn is_removable(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Statistics snapshot (worker-side authoritative values).
    pub(crate) fn stats(&self) -> ChannelStats {
        ChannelStats {
            id: self.handle.id(),
            rtt_ms: self.rtt.rtt_ms(),
            srtt_ms: self.rtt.srtt_ms(),
            data_in_speed: self.data_in.rate(),
            data_out_speed: self.data_out.rate(),
            proto_in_speed: self.proto_in.rate(),
            proto_out_speed: self.proto_out.rate(),
        }
    }

    // ------------------------------------------------------------------ //
    // Observer plumbing
    // ------------------------------------------------------------------ //

    /// Attach the observer, flushing anything buffered before attachment.
    pub(crate) fn set_observer(&mut self, observer: Arc<dyn ChannelObserver>) {
        self.observer = Some(Arc::clone(&observer));
        while let Some(data) = self.pending_delivery.pop_front() {
            observer.on_recv_data(self.handle.clone(), data);
        }
        if self.writable_pending {
            self.writable_pending = false;
            observer.writable(self.handle.clone());
        }
        if let Some(error) = self.pending_error.take() {
            observer.on_error(self.handle.clone(), error);
        }
    }

    fn deliver_data(&mut self, data: Vec<u8>) {
        if let Some(observer) = self.observer.clone() {
            observer.on_recv_data(self.handle.clone(), data);
        } else {
            self.pending_delivery.push_back(data);
        }
    }

    fn emit_writable(&mut self) {
        if let Some(observer) = self.observer.clone() {
            observer.writable(self.handle.clone());
        } else {
            self.writable_pending = true;
        }
    }

    fn deliver_error(&mut self, error: ChannelError) {
        if self.error_delivered {
            return;
        }
        self.error_delivered = true;
        if let Some(observer) = self.observer.clone() {
            observer.on_error(self.handle.clone(), error);
        } else {
            self.pending_error = Some(error);
        }
    }

    // ------------------------------------------------------------------ //
    // Lifecycle
    // ------------------------------------------------------------------ //

    fn set_phase(&mut self, phase: ChannelPhase) {
        self.phase = phase;
        self.handle.shared.set_phase(phase);
    }

    fn clear_queues(&mut self) {
        self.unsent.clear();
        self.in_flight.clear();
        self.reorder.clear();
        self.handle.shared.queued_bytes.store(0, Ordering::Release);
    }

    /// Terminal failure: Errored, queues dropped, observer notified once.
    fn fail(&mut self, error: ChannelError) {
        if self.phase.is_terminal() {
            return;
        }
        tracing::debug!(id = self.id, %error, "channel failed");
        self.set_phase(ChannelPhase::Errored);
        self.clear_queues();
        self.deliver_error(error);
    }

    /// Begin the open handshake (initiating side).
    pub(crate) fn start_open(&mut self, out: &mut Vec<Frame>) {
        let now = Instant::now();
        self.open_deadline = now + self.config.handshake_timeout;
        self.open_retx_at = now + constants::OPEN_RETX_INTERVAL;
        self.open_tries = 1;
        self.push_open(out);
        tracing::debug!(
            id = self.id,
            peer = %self.remote_peer(),
            vport = self.handle.remote_vport(),
            "channel opening"
        );
    }

    /// Send (or re-send) the ACCEPT for this accepted channel.
    pub(crate) fn make_accept(&mut self, out: &mut Vec<Frame>) {
        let Some((_, initiator_id)) = self.accept_key else {
            return;
        };
        let frame = Frame {
            kind: FrameKind::Accept,
            channel: initiator_id,
            sequence: 0,
            ack: self.next_rx_seq,
            payload: AcceptBody {
                src_channel: self.id,
            }
            .encode(),
        };
        self.proto_out.add(frame.encoded_len());
        out.push(frame);
    }

    /// Graceful local close. Idempotent.
    pub(crate) fn start_close(&mut self, out: &mut Vec<Frame>) {
        match self.phase {
            ChannelPhase::Opening => {
                if self.remote_id.is_some() {
                    self.begin_close_handshake(out);
                } else {
                    // The peer never answered; nothing to hand-shake with.
                    self.set_phase(ChannelPhase::Closed);
                    self.clear_queues();
                }
            }
            ChannelPhase::Open => self.begin_close_handshake(out),
            _ => {}
        }
    }

    fn begin_close_handshake(&mut self, out: &mut Vec<Frame>) {
        let now = Instant::now();
        self.set_phase(ChannelPhase::Closing);
        self.clear_queues();
        self.close_deadline = now + self.config.close_timeout;
        self.close_retx_at = now + constants::CLOSE_RETX_INTERVAL;
        self.close_tries = 1;
        self.push_simple(FrameKind::Close, out);
        tracing::debug!(id = self.id, "channel closing");
    }

    /// Produce a best-effort CLOSE for orderly manager shutdown. No
    /// handshake, no notifications.
    pub(crate) fn orderly_shutdown(&mut self) -> Option<Frame> {
        let was_open = matches!(self.phase, ChannelPhase::Open | ChannelPhase::Closing);
        self.set_phase(ChannelPhase::Closed);
        self.clear_queues();
        let remote = self.remote_id?;
        was_open.then(|| Frame {
            kind: FrameKind::Close,
            channel: remote,
            sequence: 0,
            ack: self.next_rx_seq,
            payload: Vec::new(),
        })
    }

    // ------------------------------------------------------------------ //
    // Transmit path
    // ------------------------------------------------------------------ //

    /// Accept bytes already reserved by the handle into the send queue.
    pub(crate) fn queue_send(&mut self, data: Vec<u8>, out: &mut Vec<Frame>) {
        if !self.phase.can_send() {
            // Raced with close/error; hand the reservation back.
            self.handle
                .shared
                .queued_bytes
                .fetch_sub(data.len(), Ordering::AcqRel);
            return;
        }

        for chunk in data.chunks(self.config.max_payload.max(1)) {
            let seq = self.next_tx_seq;
            self.next_tx_seq += 1;
            self.unsent.push_back(PendingFrame {
                seq,
                payload: chunk.to_vec(),
                sent_at: Instant::now(),
                retransmits: 0,
                rto: self.rtt.rto(),
            });
        }
        self.pump(out);
    }

    /// Move frames from the unsent queue to the wire while the congestion
    /// window has room.
    fn pump(&mut self, out: &mut Vec<Frame>) {
        if self.phase != ChannelPhase::Open {
            return;
        }
        let Some(remote) = self.remote_id else {
            return;
        };

        let now = Instant::now();
        while self.in_flight.len() < self.cwnd {
            let Some(mut frame) = self.unsent.pop_front() else {
                break;
            };
            frame.sent_at = now;
            frame.rto = self.rtt.rto();

            self.data_out.add(frame.payload.len());
            self.proto_out.add(FRAME_HEADER_SIZE);
            out.push(Frame {
                kind: FrameKind::Data,
                channel: remote,
                sequence: frame.seq,
                ack: self.next_rx_seq,
                payload: frame.payload.clone(),
            });
            // The data frame carried the cumulative ack.
            self.ack_pending = false;
            self.in_flight.push_back(frame);
        }
    }

    fn retransmit_frame(&mut self, index: usize, now: Instant, out: &mut Vec<Frame>) {
        let Some(remote) = self.remote_id else {
            return;
        };
        let (seq, payload) = {
            let Some(frame) = self.in_flight.get_mut(index) else {
                return;
            };
            frame.retransmits += 1;
            frame.sent_at = now;
            frame.rto = (frame.rto * 2).min(timing_constants::MAX_RTO);
            (frame.seq, frame.payload.clone())
        };

        self.data_out.add(payload.len());
        self.proto_out.add(FRAME_HEADER_SIZE);
        out.push(Frame {
            kind: FrameKind::Data,
            channel: remote,
            sequence: seq,
            ack: self.next_rx_seq,
            payload,
        });
    }

    /// Process a cumulative acknowledgment.
    fn process_ack(&mut self, ack: u64, out: &mut Vec<Frame>) {
        let mut acked_frames = 0usize;
        let mut released = 0usize;
        let mut sample = None;

        while self.in_flight.front().is_some_and(|f| f.seq < ack) {
            let Some(frame) = self.in_flight.pop_front() else {
                break;
            };
            if frame.retransmits == 0 {
                // Karn's rule: only never-retransmitted frames sample RTT.
                sample = Some(frame.sent_at.elapsed());
            }
            released += frame.payload.len();
            acked_frames += 1;
        }

        if acked_frames > 0 {
            self.cwnd = (self.cwnd + acked_frames).min(constants::CWND_MAX);
            self.dup_ack_count = 0;
            self.last_ack_seen = ack;
            if let Some(sample) = sample {
                self.rtt.update(sample);
                self.publish_rtt();
            }
            self.release_bytes(released);
            self.pump(out);
        } else if ack == self.last_ack_seen && !self.in_flight.is_empty() {
            self.dup_ack_count += 1;
            if self.dup_ack_count >= constants::DUP_ACK_THRESHOLD {
                self.dup_ack_count = 0;
                tracing::trace!(id = self.id, ack, "fast retransmit");
                self.retransmit_frame(0, Instant::now(), out);
            }
        } else if ack > self.last_ack_seen {
            self.last_ack_seen = ack;
        }
    }

    fn release_bytes(&mut self, released: usize) {
        if released == 0 {
            return;
        }
        let shared = &self.handle.shared;
        let before = shared.queued_bytes.fetch_sub(released, Ordering::AcqRel);
        let after = before.saturating_sub(released);
        if shared.queue_full.load(Ordering::Acquire) && after < shared.queue_capacity {
            shared.queue_full.store(false, Ordering::Release);
            self.emit_writable();
        }
    }

    // ------------------------------------------------------------------ //
    // Receive path
    // ------------------------------------------------------------------ //

    /// Handle one inbound frame addressed to this channel.
    pub(crate) fn on_frame(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        match frame.kind {
            FrameKind::Data => self.on_data(frame, out),
            FrameKind::Ack => {
                self.proto_in.add(frame.encoded_len());
                self.process_ack(frame.ack, out);
            }
            FrameKind::Accept => self.on_accept(frame, out),
            FrameKind::Reject => {
                self.proto_in.add(frame.encoded_len());
                if self.phase == ChannelPhase::Opening {
                    tracing::debug!(id = self.id, "open rejected by peer");
                    self.fail(ChannelError::PeerUnreachable);
                }
            }
            FrameKind::Probe => {
                self.proto_in.add(frame.encoded_len());
                if let Ok(echo) = decode_probe_body(&frame.payload)
                    && self.remote_id.is_some()
                    && !self.phase.is_terminal()
                {
                    self.push_probe(FrameKind::ProbeAck, echo, out);
                }
            }
            FrameKind::ProbeAck => {
                self.proto_in.add(frame.encoded_len());
                if let Ok(echo) = decode_probe_body(&frame.payload)
                    && let Some(sample) = self.probe.on_echo(echo)
                {
                    self.rtt.update(sample);
                    self.publish_rtt();
                }
            }
            FrameKind::Close => {
                self.proto_in.add(frame.encoded_len());
                self.on_remote_close(out);
            }
            FrameKind::CloseAck => {
                self.proto_in.add(frame.encoded_len());
                if self.phase == ChannelPhase::Closing {
                    self.set_phase(ChannelPhase::Closed);
                    tracing::debug!(id = self.id, "channel closed");
                }
            }
            FrameKind::Open => {
                // OPEN is demultiplexed by vport and never reaches a core.
                self.proto_in.add(frame.encoded_len());
                self.fail(ChannelError::ProtocolViolation);
            }
        }
        self.flush_ack(out);
    }

    fn on_accept(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        self.proto_in.add(frame.encoded_len());
        if !self.initiator {
            self.fail(ChannelError::ProtocolViolation);
            return;
        }
        let Ok(body) = AcceptBody::decode(&frame.payload) else {
            self.fail(ChannelError::ProtocolViolation);
            return;
        };

        match self.phase {
            ChannelPhase::Opening => {
                self.remote_id = Some(body.src_channel);
                self.set_phase(ChannelPhase::Open);
                tracing::debug!(id = self.id, remote_id = body.src_channel, "channel open");
                // Third leg of the exchange; also flushes anything queued
                // while the handshake was in flight.
                self.ack_pending = true;
                self.pump(out);
            }
            ChannelPhase::Open if self.remote_id == Some(body.src_channel) => {
                // Our ack was lost; answer the duplicate ACCEPT again.
                self.ack_pending = true;
            }
            _ => {}
        }
    }

    fn on_data(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        self.proto_in.add(FRAME_HEADER_SIZE);
        self.process_ack(frame.ack, out);

        if !matches!(self.phase, ChannelPhase::Opening | ChannelPhase::Open) {
            self.proto_in.add(frame.payload.len());
            return;
        }

        let seq = frame.sequence;
        let payload = frame.payload;

        if seq < self.next_rx_seq {
            // Retransmit race; the sender missed our ack.
            self.proto_in.add(payload.len());
            self.ack_pending = true;
        } else if seq == self.next_rx_seq {
            self.data_in.add(payload.len());
            self.next_rx_seq += 1;
            self.deliver_data(payload);
            // Drain whatever the gap was holding back.
            while let Some(next) = self.reorder.remove(&self.next_rx_seq) {
                self.next_rx_seq += 1;
                self.deliver_data(next);
            }
            self.ack_pending = true;
        } else if seq - self.next_rx_seq > self.config.reorder_window {
            tracing::trace!(
                id = self.id,
                seq,
                next_rx = self.next_rx_seq,
                "frame beyond reorder window dropped"
            );
            self.proto_in.add(payload.len());
        } else if self.reorder.contains_key(&seq) {
            self.proto_in.add(payload.len());
            self.ack_pending = true;
        } else {
            self.data_in.add(payload.len());
            self.reorder.insert(seq, payload);
            // Duplicate ack tells the sender about the gap.
            self.ack_pending = true;
        }
    }

    fn on_remote_close(&mut self, out: &mut Vec<Frame>) {
        if self.remote_id.is_some() {
            self.push_simple(FrameKind::CloseAck, out);
        }
        match self.phase {
            ChannelPhase::Opening | ChannelPhase::Open => {
                self.set_phase(ChannelPhase::Closed);
                self.clear_queues();
                tracing::debug!(id = self.id, "channel closed by peer");
                self.deliver_error(ChannelError::ChannelClosed);
            }
            ChannelPhase::Closing => {
                // Simultaneous close; both sides wanted this.
                self.set_phase(ChannelPhase::Closed);
            }
            _ => {}
        }
    }

    fn flush_ack(&mut self, out: &mut Vec<Frame>) {
        if self.ack_pending && self.remote_id.is_some() && !self.phase.is_terminal() {
            self.push_simple(FrameKind::Ack, out);
        }
        self.ack_pending = false;
    }

    // ------------------------------------------------------------------ //
    // Timers
    // ------------------------------------------------------------------ //

    /// Retransmission sweep and handshake deadlines; runs every fast tick.
    pub(crate) fn on_fast_tick(&mut self, now: Instant, out: &mut Vec<Frame>) {
        match self.phase {
            ChannelPhase::Opening => {
                if now >= self.open_deadline {
                    self.fail(ChannelError::HandshakeTimeout);
                } else if now >= self.open_retx_at {
                    self.open_tries += 1;
                    let backoff = constants::OPEN_RETX_INTERVAL
                        .saturating_mul(1 << (self.open_tries - 1).min(5));
                    self.open_retx_at = now + backoff;
                    self.push_open(out);
                }
            }
            ChannelPhase::Open => {
                let mut expired = Vec::new();
                let mut exhausted = false;
                for (index, frame) in self.in_flight.iter().enumerate() {
                    if now.duration_since(frame.sent_at) >= frame.rto {
                        if frame.retransmits >= self.config.max_retransmits {
                            exhausted = true;
                            break;
                        }
                        expired.push(index);
                    }
                }
                if exhausted {
                    self.fail(ChannelError::PeerUnreachable);
                    return;
                }
                if !expired.is_empty() {
                    for index in &expired {
                        self.retransmit_frame(*index, now, out);
                    }
                    self.cwnd = (self.cwnd / 2).max(constants::CWND_MIN);
                    self.rtt.backoff();
                    tracing::trace!(
                        id = self.id,
                        retransmitted = expired.len(),
                        cwnd = self.cwnd,
                        "retransmission timeout"
                    );
                }
            }
            ChannelPhase::Closing => {
                if now >= self.close_deadline {
                    // The peer never acknowledged; close out anyway.
                    self.set_phase(ChannelPhase::Closed);
                } else if self.close_tries < constants::CLOSE_MAX_TRIES
                    && now >= self.close_retx_at
                {
                    self.close_tries += 1;
                    self.close_retx_at = now + constants::CLOSE_RETX_INTERVAL;
                    self.push_simple(FrameKind::Close, out);
                }
            }
            _ => {}
        }
    }

    /// Speed sampling and idle probing; runs on the sampling tick.
    pub(crate) fn on_speed_tick(&mut self, now: Instant, out: &mut Vec<Frame>) {
        let shared = &self.handle.shared;
        shared
            .data_in_rate
            .store(self.data_in.sample(), Ordering::Release);
        shared
            .data_out_rate
            .store(self.data_out.sample(), Ordering::Release);
        shared
            .proto_in_rate
            .store(self.proto_in.sample(), Ordering::Release);
        shared
            .proto_out_rate
            .store(self.proto_out.sample(), Ordering::Release);

        // Keep RTT fresh while the channel is idle.
        if self.phase == ChannelPhase::Open
            && self.in_flight.is_empty()
            && self.unsent.is_empty()
            && self.remote_id.is_some()
            && now.duration_since(self.last_probe_at) >= self.config.probe_interval
        {
            self.last_probe_at = now;
            let timestamp = self.probe.now_ms();
            self.probe.on_probe_sent(timestamp);
            self.push_probe(FrameKind::Probe, timestamp, out);
        }
    }

    // ------------------------------------------------------------------ //
    // Frame builders
    // ------------------------------------------------------------------ //

    fn push_open(&mut self, out: &mut Vec<Frame>) {
        let frame = Frame {
            kind: FrameKind::Open,
            channel: 0,
            sequence: 0,
            ack: 0,
            payload: OpenBody {
                src_channel: self.id,
                src_vport: self.local_vport,
                dst_vport: self.handle.remote_vport(),
            }
            .encode(),
        };
        self.proto_out.add(frame.encoded_len());
        out.push(frame);
    }

    fn push_simple(&mut self, kind: FrameKind, out: &mut Vec<Frame>) {
        let Some(remote) = self.remote_id else {
            return;
        };
        let frame = Frame {
            kind,
            channel: remote,
            sequence: 0,
            ack: self.next_rx_seq,
            payload: Vec::new(),
        };
        self.proto_out.add(frame.encoded_len());
        out.push(frame);
    }

    fn push_probe(&mut self, kind: FrameKind, timestamp: u32, out: &mut Vec<Frame>) {
        let Some(remote) = self.remote_id else {
            return;
        };
        let frame = Frame {
            kind,
            channel: remote,
            sequence: 0,
            ack: self.next_rx_seq,
            payload: encode_probe_body(timestamp),
        };
        self.proto_out.add(frame.encoded_len());
        out.push(frame);
    }

    fn publish_rtt(&self) {
        let shared = &self.handle.shared;
        shared.rtt_ms.store(self.rtt.rtt_ms(), Ordering::Release);
        shared.srtt_ms.store(self.rtt.srtt_ms(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelShared;
    use crate::core::ChannelId;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Data(Vec<u8>),
        Writable,
        Error(ChannelError),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl ChannelObserver for Recorder {
        fn on_error(&self, _channel: Channel, error: ChannelError) {
            self.events.lock().unwrap().push(Event::Error(error));
        }
        fn on_recv_data(&self, _channel: Channel, data: Vec<u8>) {
            self.events.lock().unwrap().push(Event::Data(data));
        }
        fn writable(&self, _channel: Channel) {
            self.events.lock().unwrap().push(Event::Writable);
        }
    }

    fn small_config() -> ManagerConfig {
        ManagerConfig {
            max_payload: 8,
            send_queue_capacity: 64,
            reorder_window: 4,
            max_retransmits: 2,
            ..ManagerConfig::default()
        }
    }

    fn make_core(accepted: bool) -> (ChannelCore, Arc<Recorder>) {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let phase = if accepted {
            ChannelPhase::Open
        } else {
            ChannelPhase::Opening
        };
        let shared = ChannelShared::new(
            ChannelId::from_u64(10),
            PeerId::new("peer").unwrap(),
            7,
            phase,
            64,
        );
        let handle = Channel {
            shared,
            cmd_tx: cmd_tx.clone(),
        };
        // Keep the receiver alive for the duration of the test.
        std::mem::forget(_cmd_rx);

        let core = if accepted {
            ChannelCore::new_accepted(handle, 7, 99, small_config())
        } else {
            ChannelCore::new_initiator(handle, 0xE000, small_config())
        };
        let recorder = Arc::new(Recorder::default());
        (core, recorder)
    }

    fn open_initiator(core: &mut ChannelCore) {
        let mut out = Vec::new();
        core.start_open(&mut out);
        core.on_frame(
            Frame {
                kind: FrameKind::Accept,
                channel: 10,
                sequence: 0,
                ack: 0,
                payload: AcceptBody { src_channel: 99 }.encode(),
            },
            &mut out,
        );
        assert_eq!(core.phase, ChannelPhase::Open);
    }

    fn data_frame(seq: u64, payload: &[u8]) -> Frame {
        Frame {
            kind: FrameKind::Data,
            channel: 10,
            sequence: seq,
            ack: 0,
            payload: payload.to_vec(),
        }
    }

    fn ack_frame(ack: u64) -> Frame {
        Frame {
            kind: FrameKind::Ack,
            channel: 10,
            sequence: 0,
            ack,
            payload: Vec::new(),
        }
    }

    fn reserve(core: &ChannelCore, bytes: usize) {
        core.handle
            .shared
            .queued_bytes
            .fetch_add(bytes, Ordering::AcqRel);
    }

    #[test]
    fn test_ordered_delivery_with_reordering_and_duplicates() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        // Frames 1 and 2 arrive before 0; 1 arrives twice.
        core.on_frame(data_frame(1, b"bb"), &mut out);
        core.on_frame(data_frame(2, b"cc"), &mut out);
        core.on_frame(data_frame(1, b"bb"), &mut out);
        assert_eq!(recorder.take(), vec![]);

        core.on_frame(data_frame(0, b"aa"), &mut out);
        assert_eq!(
            recorder.take(),
            vec![
                Event::Data(b"aa".to_vec()),
                Event::Data(b"bb".to_vec()),
                Event::Data(b"cc".to_vec()),
            ]
        );

        // A late duplicate of 0 is dropped, not redelivered.
        core.on_frame(data_frame(0, b"aa"), &mut out);
        assert_eq!(recorder.take(), vec![]);
    }

    #[test]
    fn test_beyond_reorder_window_dropped() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        // Window is 4: sequence 5 is out of range while expecting 0.
        core.on_frame(data_frame(5, b"xx"), &mut out);
        core.on_frame(data_frame(0, b"aa"), &mut out);
        core.on_frame(data_frame(1, b"bb"), &mut out);
        core.on_frame(data_frame(2, b"cc"), &mut out);
        core.on_frame(data_frame(3, b"dd"), &mut out);
        core.on_frame(data_frame(4, b"ee"), &mut out);

        // Sequence 5 was dropped, so delivery stops at 4.
        let events = recorder.take();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4], Event::Data(b"ee".to_vec()));

        // Retransmitted later, it fills in.
        core.on_frame(data_frame(5, b"xx"), &mut out);
        assert_eq!(recorder.take(), vec![Event::Data(b"xx".to_vec())]);
    }

    #[test]
    fn test_data_buffered_before_observer_attach() {
        let (mut core, recorder) = make_core(true);
        let mut out = Vec::new();

        core.on_frame(data_frame(0, b"early"), &mut out);
        assert_eq!(recorder.take(), vec![]);

        core.set_observer(recorder.clone());
        assert_eq!(recorder.take(), vec![Event::Data(b"early".to_vec())]);
    }

    #[test]
    fn test_ack_releases_bytes_and_fires_one_writable() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        reserve(&core, 16);
        core.queue_send(vec![0xAB; 16], &mut out);
        // 16 bytes / 8-byte payload = two data frames on the wire
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Data).count(), 2);

        // Pretend a sender saw the queue full.
        core.handle.shared.queue_full.store(true, Ordering::Release);

        out.clear();
        core.on_frame(ack_frame(2), &mut out);
        assert_eq!(
            core.handle.shared.queued_bytes.load(Ordering::Acquire),
            0
        );
        assert_eq!(recorder.take(), vec![Event::Writable]);

        // No second writable without a new full edge.
        core.on_frame(ack_frame(2), &mut out);
        assert_eq!(recorder.take(), vec![]);
    }

    #[test]
    fn test_retransmit_then_peer_unreachable() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        reserve(&core, 4);
        core.queue_send(vec![1, 2, 3, 4], &mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Data).count(), 1);

        // First RTO expiry: retransmit #1.
        let later = Instant::now() + Duration::from_secs(2);
        out.clear();
        core.on_fast_tick(later, &mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Data).count(), 1);

        // Second expiry (RTO doubled): retransmit #2.
        let later = later + Duration::from_secs(4);
        out.clear();
        core.on_fast_tick(later, &mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Data).count(), 1);

        // Third expiry exceeds max_retransmits = 2: terminal failure.
        let later = later + Duration::from_secs(10);
        out.clear();
        core.on_fast_tick(later, &mut out);
        assert_eq!(
            recorder.take(),
            vec![Event::Error(ChannelError::PeerUnreachable)]
        );
        assert!(core.is_removable());
    }

    #[test]
    fn test_handshake_timeout() {
        let (mut core, recorder) = make_core(false);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        core.start_open(&mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Open).count(), 1);

        // Past the deadline without an ACCEPT.
        out.clear();
        core.on_fast_tick(Instant::now() + Duration::from_secs(6), &mut out);
        assert_eq!(
            recorder.take(),
            vec![Event::Error(ChannelError::HandshakeTimeout)]
        );
        assert_eq!(core.phase, ChannelPhase::Errored);
    }

    #[test]
    fn test_open_retransmits_before_deadline() {
        let (mut core, _recorder) = make_core(false);
        let mut out = Vec::new();
        core.start_open(&mut out);

        out.clear();
        core.on_fast_tick(Instant::now() + Duration::from_millis(1500), &mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Open).count(), 1);
    }

    #[test]
    fn test_accept_opens_and_flushes_queued_data() {
        let (mut core, _recorder) = make_core(false);
        let mut out = Vec::new();
        core.start_open(&mut out);

        // Data queued while the handshake is still in flight.
        reserve(&core, 4);
        core.queue_send(vec![9, 9, 9, 9], &mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Data).count(), 0);

        out.clear();
        open_initiator(&mut core);
        // Opening flushed the queue; an explicit third-leg ack went out too.
        // (The data frame itself carries the cumulative ack.)
        assert!(core.unsent.is_empty());
        assert_eq!(core.in_flight.len(), 1);
    }

    #[test]
    fn test_reject_is_peer_unreachable() {
        let (mut core, recorder) = make_core(false);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();
        core.start_open(&mut out);

        core.on_frame(
            Frame {
                kind: FrameKind::Reject,
                channel: 10,
                sequence: 0,
                ack: 0,
                payload: crate::transport::encode_reject_body(1),
            },
            &mut out,
        );
        assert_eq!(
            recorder.take(),
            vec![Event::Error(ChannelError::PeerUnreachable)]
        );
        assert_eq!(core.phase, ChannelPhase::Errored);
    }

    #[test]
    fn test_remote_close_notifies_once_and_acks() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        core.on_frame(
            Frame {
                kind: FrameKind::Close,
                channel: 10,
                sequence: 0,
                ack: 0,
                payload: Vec::new(),
            },
            &mut out,
        );
        assert_eq!(
            out.iter().filter(|f| f.kind == FrameKind::CloseAck).count(),
            1
        );
        assert_eq!(
            recorder.take(),
            vec![Event::Error(ChannelError::ChannelClosed)]
        );
        assert_eq!(core.phase, ChannelPhase::Closed);
    }

    #[test]
    fn test_local_close_handshake_no_error_event() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        core.start_close(&mut out);
        assert_eq!(core.phase, ChannelPhase::Closing);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Close).count(), 1);

        core.on_frame(
            Frame {
                kind: FrameKind::CloseAck,
                channel: 10,
                sequence: 0,
                ack: 0,
                payload: Vec::new(),
            },
            &mut out,
        );
        assert_eq!(core.phase, ChannelPhase::Closed);
        assert_eq!(recorder.take(), vec![]);
    }

    #[test]
    fn test_double_close_is_noop() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        core.start_close(&mut out);
        let frames_after_first = out.len();
        core.start_close(&mut out);
        core.start_close(&mut out);
        assert_eq!(out.len(), frames_after_first);
        assert_eq!(recorder.take(), vec![]);
    }

    #[test]
    fn test_probe_echo_updates_rtt() {
        let (mut core, _recorder) = make_core(true);
        let mut out = Vec::new();

        // Idle channel probes on the speed tick once the interval elapsed.
        let later = Instant::now() + Duration::from_secs(2);
        core.on_speed_tick(later, &mut out);
        let probe = out
            .iter()
            .find(|f| f.kind == FrameKind::Probe)
            .expect("idle channel should probe");
        let echo = decode_probe_body(&probe.payload).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        core.on_frame(
            Frame {
                kind: FrameKind::ProbeAck,
                channel: 10,
                sequence: 0,
                ack: 0,
                payload: encode_probe_body(echo),
            },
            &mut out,
        );
        assert!(core.rtt.is_initialized());
        assert!(core.handle.rtt() >= 5);
    }

    #[test]
    fn test_probe_answered_with_echo() {
        let (mut core, _recorder) = make_core(true);
        let mut out = Vec::new();

        core.on_frame(
            Frame {
                kind: FrameKind::Probe,
                channel: 10,
                sequence: 0,
                ack: 0,
                payload: encode_probe_body(777),
            },
            &mut out,
        );
        let echo = out
            .iter()
            .find(|f| f.kind == FrameKind::ProbeAck)
            .expect("probe must be echoed");
        assert_eq!(decode_probe_body(&echo.payload).unwrap(), 777);
    }

    #[test]
    fn test_duplicate_acks_trigger_fast_retransmit() {
        let (mut core, _recorder) = make_core(true);
        let mut out = Vec::new();

        reserve(&core, 24);
        core.queue_send(vec![5; 24], &mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Data).count(), 3);

        // Ack frame 0, then three duplicates of the same cumulative ack.
        out.clear();
        core.on_frame(ack_frame(1), &mut out);
        core.on_frame(ack_frame(1), &mut out);
        core.on_frame(ack_frame(1), &mut out);
        assert_eq!(out.iter().filter(|f| f.kind == FrameKind::Data).count(), 0);
        core.on_frame(ack_frame(1), &mut out);

        let retransmitted: Vec<_> = out
            .iter()
            .filter(|f| f.kind == FrameKind::Data)
            .collect();
        assert_eq!(retransmitted.len(), 1);
        assert_eq!(retransmitted[0].sequence, 1);
    }

    #[test]
    fn test_speed_sampling_publishes_rates() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        core.on_frame(data_frame(0, b"12345678"), &mut out);
        core.on_speed_tick(Instant::now(), &mut out);
        assert_eq!(core.handle.data_in_speed(), 8);
        assert!(core.handle.proto_in_speed() >= FRAME_HEADER_SIZE as u64);

        // Next idle window drops back to zero.
        core.on_speed_tick(Instant::now(), &mut out);
        assert_eq!(core.handle.data_in_speed(), 0);
    }

    #[test]
    fn test_send_while_terminal_returns_reservation() {
        let (mut core, recorder) = make_core(true);
        core.set_observer(recorder.clone());
        let mut out = Vec::new();

        core.start_close(&mut out);
        reserve(&core, 4);
        core.queue_send(vec![1, 2, 3, 4], &mut out);
        assert_eq!(core.handle.shared.queued_bytes.load(Ordering::Acquire), 0);
    }
}
