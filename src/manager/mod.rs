//! The multiplexing engine.
//!
//! One [`ChannelManager`] drives all channels and acceptors bound to a
//! router. All mutable protocol state lives in a single worker task (the
//! cooperative-single-writer model: no per-channel locks); handle calls
//! from other threads enqueue commands that the worker applies in order,
//! and observer callbacks are invoked on the worker.

mod acceptor;
mod config;

pub use acceptor::ChannelAcceptor;
pub use config::{ManagerConfig, ManagerConfigBuilder};

pub(crate) use acceptor::AcceptorCore;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelCore, ChannelPhase, ChannelShared, ChannelStats};
use crate::core::{
    constants, AcceptorObserver, ChannelId, ChannelObserver, ManagerError, PeerId, RouterError,
    VportId, EPHEMERAL_VPORT_BASE,
};
use crate::router::Router;
use crate::transport::{encode_reject_body, Frame, FrameKind, OpenBody, REJECT_NO_ACCEPTOR};

/// Commands marshaled from handles onto the worker.
pub(crate) enum Command {
    RegisterChannel(Box<ChannelCore>),
    RegisterAcceptor(Box<AcceptorCore>),
    Send {
        id: ChannelId,
        data: Vec<u8>,
    },
    SetObserver {
        id: ChannelId,
        observer: Arc<dyn ChannelObserver>,
    },
    Close {
        id: ChannelId,
    },
    SetAcceptorObserver {
        vport: VportId,
        observer: Arc<dyn AcceptorObserver>,
    },
    SetAcceptorOpen {
        vport: VportId,
        open: bool,
    },
    Stats {
        reply: oneshot::Sender<ManagerStats>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Aggregate statistics snapshot across all live channels.
///
/// `Display` renders the human-readable report; the fields carry the
/// structured form.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    /// Per-channel snapshots, ordered by channel id.
    pub channels: Vec<ChannelStats>,
}

impl ManagerStats {
    /// Sum of `data_in_speed` over all channels.
    pub fn total_data_in_speed(&self) -> u64 {
        self.channels.iter().map(|c| c.data_in_speed).sum()
    }

    /// Sum of `data_out_speed` over all channels.
    pub fn total_data_out_speed(&self) -> u64 {
        self.channels.iter().map(|c| c.data_out_speed).sum()
    }

    /// Sum of `proto_in_speed` over all channels.
    pub fn total_proto_in_speed(&self) -> u64 {
        self.channels.iter().map(|c| c.proto_in_speed).sum()
    }

    /// Sum of `proto_out_speed` over all channels.
    pub fn total_proto_out_speed(&self) -> u64 {
        self.channels.iter().map(|c| c.proto_out_speed).sum()
    }
}

impl std::fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in &self.channels {
            writeln!(
                f,
                "channel: {}, in_data: {}, out_data: {}, in_proto: {}, out_proto: {}, rtt: {}, srtt: {}",
                c.id,
                c.data_in_speed,
                c.data_out_speed,
                c.proto_in_speed,
                c.proto_out_speed,
                c.rtt_ms,
                c.srtt_ms
            )?;
        }
        writeln!(f, "-----------------------------")?;
        writeln!(f, "total_speed_in_data: {}", self.total_data_in_speed())?;
        writeln!(f, "total_speed_out_data: {}", self.total_data_out_speed())?;
        writeln!(f, "total_speed_in_proto: {}", self.total_proto_in_speed())?;
        writeln!(f, "total_speed_out_proto: {}", self.total_proto_out_speed())?;
        if !self.channels.is_empty() {
            let n = self.channels.len() as u64;
            let sum_rtt: u64 = self.channels.iter().map(|c| c.rtt_ms as u64).sum();
            let sum_srtt: u64 = self.channels.iter().map(|c| c.srtt_ms as u64).sum();
            writeln!(f, "avg_rtt: {}, avg_srtt: {}", sum_rtt / n, sum_srtt / n)?;
        }
        write!(f, "-----------------------------")
    }
}

enum Lifecycle {
    Created,
    Running(Running),
    Stopped,
}

struct Running {
    cmd_tx: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

struct VportTable {
    bound: HashSet<VportId>,
    next_ephemeral: VportId,
}

impl VportTable {
    fn new() -> Self {
        Self {
            bound: HashSet::new(),
            next_ephemeral: EPHEMERAL_VPORT_BASE,
        }
    }

    /// Next ephemeral vport, skipping bound ones (wraps within the range).
    fn alloc_ephemeral(&mut self) -> VportId {
        loop {
            let vport = self.next_ephemeral;
            self.next_ephemeral = if vport == VportId::MAX {
                EPHEMERAL_VPORT_BASE
            } else {
                vport + 1
            };
            if !self.bound.contains(&vport) {
                return vport;
            }
        }
    }
}

/// Lifecycle and multiplexing for channels and acceptors.
///
/// `init` must be called from within a tokio runtime: it spawns the worker
/// task. After `shutdown` the instance is unusable and every method fails
/// with `NotInitialized`.
pub struct ChannelManager {
    router: Arc<Router>,
    config: ManagerConfig,
    lifecycle: Mutex<Lifecycle>,
    next_channel_id: Arc<AtomicU64>,
    vports: Mutex<VportTable>,
}

impl ChannelManager {
    /// Create a manager bound to a router.
    pub fn new(router: Arc<Router>, config: ManagerConfig) -> Self {
        Self {
            router,
            config,
            lifecycle: Mutex::new(Lifecycle::Created),
            next_channel_id: Arc::new(AtomicU64::new(1)),
            vports: Mutex::new(VportTable::new()),
        }
    }

    /// Start the worker and timers. Fails with `AlreadyInitialized` on a
    /// second call and `NotInitialized` after `shutdown`.
    pub fn init(&self) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match &*lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Err(ManagerError::AlreadyInitialized),
            Lifecycle::Stopped => return Err(ManagerError::NotInitialized),
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dgram_tx, dgram_rx) = mpsc::unbounded_channel();
        self.router.start(dgram_tx).map_err(|e| match e {
            RouterError::AlreadyInitialized => ManagerError::AlreadyInitialized,
            _ => ManagerError::NotInitialized,
        })?;

        let worker = Worker {
            router: Arc::clone(&self.router),
            config: self.config.clone(),
            cmd_tx: cmd_tx.clone(),
            next_channel_id: Arc::clone(&self.next_channel_id),
            channels: HashMap::new(),
            acceptors: BTreeMap::new(),
            open_index: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(cmd_rx, dgram_rx));

        *lifecycle = Lifecycle::Running(Running {
            cmd_tx,
            worker: handle,
        });
        tracing::info!(peer = %self.router.local_peer(), "channel manager started");
        Ok(())
    }

    fn cmd_tx(&self) -> Result<mpsc::UnboundedSender<Command>, ManagerError> {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match &*lifecycle {
            Lifecycle::Running(running) => Ok(running.cmd_tx.clone()),
            _ => Err(ManagerError::NotInitialized),
        }
    }

    /// Open a channel to `dst_vport` on `dst_peer`.
    ///
    /// Returns the handle immediately; the open handshake completes in the
    /// background. Data may be sent right away — it is queued until the
    /// channel is Open. Handshake failure surfaces through the channel
    /// observer's `on_error`.
    pub fn new_channel(
        &self,
        dst_peer: PeerId,
        dst_vport: VportId,
    ) -> Result<Channel, ManagerError> {
        let cmd_tx = self.cmd_tx()?;

        let id = ChannelId::from_u64(self.next_channel_id.fetch_add(1, Ordering::AcqRel));
        let local_vport = {
            let mut vports = self.vports.lock().unwrap_or_else(|e| e.into_inner());
            vports.alloc_ephemeral()
        };

        let shared = ChannelShared::new(
            id,
            dst_peer,
            dst_vport,
            ChannelPhase::Opening,
            self.config.send_queue_capacity,
        );
        let handle = Channel {
            shared,
            cmd_tx: cmd_tx.clone(),
        };
        let core = ChannelCore::new_initiator(handle.clone(), local_vport, self.config.clone());

        cmd_tx
            .send(Command::RegisterChannel(Box::new(core)))
            .map_err(|_| ManagerError::NotInitialized)?;
        Ok(handle)
    }

    /// Bind an acceptor to a vport (0 = ephemeral). The acceptor starts in
    /// the Open state. Fails with `VportInUse` if the vport is bound.
    pub fn new_acceptor(&self, vport: VportId) -> Result<ChannelAcceptor, ManagerError> {
        let cmd_tx = self.cmd_tx()?;

        let vport = {
            let mut vports = self.vports.lock().unwrap_or_else(|e| e.into_inner());
            if vport == 0 {
                let v = vports.alloc_ephemeral();
                vports.bound.insert(v);
                v
            } else if vports.bound.contains(&vport) {
                return Err(ManagerError::VportInUse(vport));
            } else {
                vports.bound.insert(vport);
                vport
            }
        };

        let shared = Arc::new(acceptor::AcceptorShared {
            vport,
            open: std::sync::atomic::AtomicBool::new(true),
        });
        let handle = ChannelAcceptor {
            shared,
            cmd_tx: cmd_tx.clone(),
        };
        let core = AcceptorCore::new(handle.clone());

        cmd_tx
            .send(Command::RegisterAcceptor(Box::new(core)))
            .map_err(|_| ManagerError::NotInitialized)?;
        Ok(handle)
    }

    /// Snapshot the statistics of every live channel.
    pub async fn stats(&self) -> Result<ManagerStats, ManagerError> {
        let cmd_tx = self.cmd_tx()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Stats { reply: reply_tx })
            .map_err(|_| ManagerError::NotInitialized)?;
        reply_rx.await.map_err(|_| ManagerError::NotInitialized)
    }

    /// Close every channel and acceptor (without observer notifications —
    /// this is an orderly shutdown, not a failure), stop the timers, and
    /// release the router binding. Safe to call exactly once.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let running = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    // Preserve the pre-call state for the error.
                    *lifecycle = other;
                    return Err(ManagerError::NotInitialized);
                }
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        if running
            .cmd_tx
            .send(Command::Shutdown { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let _ = running.worker.await;
        self.router.shutdown();
        tracing::info!(peer = %self.router.local_peer(), "channel manager stopped");
        Ok(())
    }
}

// ========================================================================= //
// Worker
// ========================================================================= //

struct Worker {
    router: Arc<Router>,
    config: ManagerConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_channel_id: Arc<AtomicU64>,
    /// Live channels keyed by raw channel id (the demux key of every frame
    /// except OPEN).
    channels: HashMap<u64, ChannelCore>,
    /// Acceptors keyed by vport; ordered so that "vport 0 = any" picks the
    /// lowest open one deterministically.
    acceptors: BTreeMap<VportId, AcceptorCore>,
    /// Handshake dedup: (peer, initiator channel id) -> accepted channel.
    open_index: HashMap<(PeerId, u64), u64>,
}

impl Worker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut dgram_rx: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
    ) {
        let mut fast = tokio::time::interval(constants::FAST_TICK);
        let mut speed = tokio::time::interval(self.config.speed_sample_interval);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { done }) => {
                        self.orderly_shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.orderly_shutdown();
                        break;
                    }
                },
                dgram = dgram_rx.recv() => {
                    if let Some((peer, bytes)) = dgram {
                        self.on_datagram(peer, bytes);
                    }
                }
                _ = fast.tick() => self.on_fast_tick(),
                _ = speed.tick() => self.on_speed_tick(),
            }
        }
    }

    fn send_frames(router: &Router, peer: &PeerId, frames: Vec<Frame>) {
        for frame in frames {
            let _ = router.send_datagram(peer, &frame.encode());
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterChannel(mut core) => {
                let mut out = Vec::new();
                core.start_open(&mut out);
                let peer = core.remote_peer().clone();
                let id = core.handle().id().as_u64();
                self.channels.insert(id, *core);
                Self::send_frames(&self.router, &peer, out);
            }
            Command::RegisterAcceptor(core) => {
                tracing::debug!(vport = core.vport(), "acceptor listening");
                self.acceptors.insert(core.vport(), *core);
            }
            Command::Send { id, data } => {
                self.with_channel(id.as_u64(), |core, out| core.queue_send(data, out));
            }
            Command::SetObserver { id, observer } => {
                if let Some(core) = self.channels.get_mut(&id.as_u64()) {
                    core.set_observer(observer);
                }
            }
            Command::Close { id } => {
                self.with_channel(id.as_u64(), |core, out| core.start_close(out));
            }
            Command::SetAcceptorObserver { vport, observer } => {
                if let Some(core) = self.acceptors.get_mut(&vport) {
                    core.set_observer(observer);
                }
            }
            Command::SetAcceptorOpen { vport, open } => {
                if let Some(core) = self.acceptors.get(&vport) {
                    core.set_open(open);
                }
            }
            Command::Stats { reply } => {
                let mut channels: Vec<ChannelStats> =
                    self.channels.values().map(|core| core.stats()).collect();
                channels.sort_by_key(|c| c.id);
                let _ = reply.send(ManagerStats { channels });
            }
            Command::Shutdown { .. } => {
                // Handled in the select loop.
            }
        }
    }

    /// Run a closure against one channel core, deliver whatever frames it
    /// produced, and drop it from the table if it went terminal.
    fn with_channel<F>(&mut self, id: u64, f: F)
    where
        F: FnOnce(&mut ChannelCore, &mut Vec<Frame>),
    {
        let Some(core) = self.channels.get_mut(&id) else {
            return;
        };
        let mut out = Vec::new();
        f(core, &mut out);
        let peer = core.remote_peer().clone();
        if !out.is_empty() {
            Self::send_frames(&self.router, &peer, out);
        }
        self.sweep_removed();
    }

    fn on_datagram(&mut self, peer: PeerId, bytes: Vec<u8>) {
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(peer = %peer, error = %e, "malformed frame dropped");
                return;
            }
        };

        if frame.kind == FrameKind::Open {
            self.on_open(peer, frame);
            return;
        }

        let Some(core) = self.channels.get_mut(&frame.channel) else {
            // The local side already closed; the peer will give up.
            tracing::trace!(peer = %peer, channel = frame.channel, "frame for unknown channel dropped");
            return;
        };
        if core.remote_peer() != &peer {
            tracing::trace!(peer = %peer, channel = frame.channel, "frame from wrong peer dropped");
            return;
        }

        let mut out = Vec::new();
        core.on_frame(frame, &mut out);
        if !out.is_empty() {
            Self::send_frames(&self.router, &peer, out);
        }
        self.sweep_removed();
    }

    fn on_open(&mut self, peer: PeerId, frame: Frame) {
        let body = match OpenBody::decode(&frame.payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::trace!(peer = %peer, error = %e, "malformed open dropped");
                return;
            }
        };

        // Retransmit race: the channel already exists, our ACCEPT was lost.
        if let Some(&existing) = self.open_index.get(&(peer.clone(), body.src_channel)) {
            let mut out = Vec::new();
            if let Some(core) = self.channels.get_mut(&existing) {
                core.make_accept(&mut out);
            }
            Self::send_frames(&self.router, &peer, out);
            return;
        }

        let acceptor_vport = if body.dst_vport == 0 {
            self.acceptors
                .iter()
                .find(|(_, a)| a.is_open())
                .map(|(vport, _)| *vport)
        } else {
            self.acceptors
                .get(&body.dst_vport)
                .filter(|a| a.is_open())
                .map(|a| a.vport())
        };

        let Some(acceptor_vport) = acceptor_vport else {
            tracing::debug!(peer = %peer, vport = body.dst_vport, "open rejected: no acceptor");
            let reject = Frame {
                kind: FrameKind::Reject,
                channel: body.src_channel,
                sequence: 0,
                ack: 0,
                payload: encode_reject_body(REJECT_NO_ACCEPTOR),
            };
            Self::send_frames(&self.router, &peer, vec![reject]);
            return;
        };

        // Accepted channels begin in Open state: the OPEN/ACCEPT/ack
        // exchange is the handshake.
        let id = ChannelId::from_u64(self.next_channel_id.fetch_add(1, Ordering::AcqRel));
        let shared = ChannelShared::new(
            id,
            peer.clone(),
            body.src_vport,
            ChannelPhase::Open,
            self.config.send_queue_capacity,
        );
        let handle = Channel {
            shared,
            cmd_tx: self.cmd_tx.clone(),
        };
        let mut core = ChannelCore::new_accepted(
            handle.clone(),
            acceptor_vport,
            body.src_channel,
            self.config.clone(),
        );

        let mut out = Vec::new();
        core.make_accept(&mut out);
        self.open_index
            .insert((peer.clone(), body.src_channel), id.as_u64());
        self.channels.insert(id.as_u64(), core);
        tracing::debug!(id = %id, peer = %peer, vport = acceptor_vport, "channel accepted");

        if let Some(acceptor) = self.acceptors.get_mut(&acceptor_vport) {
            acceptor.notify_accept(handle);
        }
        Self::send_frames(&self.router, &peer, out);
    }

    fn on_fast_tick(&mut self) {
        let now = Instant::now();
        let mut outbox: Vec<(PeerId, Vec<Frame>)> = Vec::new();
        for core in self.channels.values_mut() {
            let mut out = Vec::new();
            core.on_fast_tick(now, &mut out);
            if !out.is_empty() {
                outbox.push((core.remote_peer().clone(), out));
            }
        }
        for (peer, frames) in outbox {
            Self::send_frames(&self.router, &peer, frames);
        }
        self.sweep_removed();
    }

    fn on_speed_tick(&mut self) {
        let now = Instant::now();
        let mut outbox: Vec<(PeerId, Vec<Frame>)> = Vec::new();
        for core in self.channels.values_mut() {
            let mut out = Vec::new();
            core.on_speed_tick(now, &mut out);
            if !out.is_empty() {
                outbox.push((core.remote_peer().clone(), out));
            }
        }
        for (peer, frames) in outbox {
            Self::send_frames(&self.router, &peer, frames);
        }
    }

    fn sweep_removed(&mut self) {
        let mut removed_keys = Vec::new();
        self.channels.retain(|id, core| {
            if core.is_removable() {
                tracing::debug!(id = *id, "channel removed from table");
                if let Some(key) = core.accept_key() {
                    removed_keys.push(key.clone());
                }
                false
            } else {
                true
            }
        });
        for key in removed_keys {
            self.open_index.remove(&key);
        }
    }

    fn orderly_shutdown(&mut self) {
        let mut outbox: Vec<(PeerId, Vec<Frame>)> = Vec::new();
        for core in self.channels.values_mut() {
            let peer = core.remote_peer().clone();
            if let Some(frame) = core.orderly_shutdown() {
                outbox.push((peer, vec![frame]));
            }
        }
        for (peer, frames) in outbox {
            Self::send_frames(&self.router, &peer, frames);
        }
        for acceptor in self.acceptors.values() {
            acceptor.set_open(false);
        }
        self.channels.clear();
        self.acceptors.clear();
        self.open_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_fixture() -> ManagerStats {
        ManagerStats {
            channels: vec![
                ChannelStats {
                    id: ChannelId::from_u64(1),
                    rtt_ms: 10,
                    srtt_ms: 12,
                    data_in_speed: 100,
                    data_out_speed: 200,
                    proto_in_speed: 30,
                    proto_out_speed: 40,
                },
                ChannelStats {
                    id: ChannelId::from_u64(2),
                    rtt_ms: 30,
                    srtt_ms: 28,
                    data_in_speed: 1,
                    data_out_speed: 2,
                    proto_in_speed: 3,
                    proto_out_speed: 4,
                },
            ],
        }
    }

    #[test]
    fn test_stats_totals() {
        let stats = stats_fixture();
        assert_eq!(stats.total_data_in_speed(), 101);
        assert_eq!(stats.total_data_out_speed(), 202);
        assert_eq!(stats.total_proto_in_speed(), 33);
        assert_eq!(stats.total_proto_out_speed(), 44);
    }

    #[test]
    fn test_stats_display() {
        let rendered = stats_fixture().to_string();
        assert!(rendered.contains("channel: 1,"));
        assert!(rendered.contains("channel: 2,"));
        assert!(rendered.contains("total_speed_in_data: 101"));
        assert!(rendered.contains("avg_rtt: 20, avg_srtt: 20"));
    }

    #[test]
    fn test_vport_table_skips_bound() {
        let mut table = VportTable::new();
        let first = table.alloc_ephemeral();
        assert_eq!(first, EPHEMERAL_VPORT_BASE);

        table.bound.insert(EPHEMERAL_VPORT_BASE + 1);
        assert_eq!(table.alloc_ephemeral(), EPHEMERAL_VPORT_BASE + 2);
    }

    #[test]
    fn test_vport_table_wraps() {
        let mut table = VportTable::new();
        table.next_ephemeral = VportId::MAX;
        assert_eq!(table.alloc_ephemeral(), VportId::MAX);
        assert_eq!(table.alloc_ephemeral(), EPHEMERAL_VPORT_BASE);
    }
}
