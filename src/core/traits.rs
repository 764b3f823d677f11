//! Observer and collaborator traits.
//!
//! Observers are the event-delivery contract between the manager and
//! application code. All callbacks execute on the manager's worker task:
//! implementations must not block and should defer heavy work elsewhere.
//! Calling back into handles (`send`, `close`) from inside a callback is
//! safe — those calls enqueue onto the worker rather than re-entering it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use super::error::ChannelError;
use super::types::PeerId;
use crate::channel::Channel;
use crate::manager::ChannelAcceptor;

/// Events delivered for a channel.
pub trait ChannelObserver: Send + Sync {
    /// A terminal failure occurred. Fires at most once per channel; the
    /// channel is already in a terminal state when this runs.
    fn on_error(&self, channel: Channel, error: ChannelError);

    /// In-order application data arrived.
    fn on_recv_data(&self, channel: Channel, data: Vec<u8>);

    /// The send queue transitioned from full back to having room.
    ///
    /// Edge-triggered: fires exactly once per full-to-room transition, not
    /// once per freed byte.
    fn writable(&self, channel: Channel);
}

/// Events delivered for an acceptor.
pub trait AcceptorObserver: Send + Sync {
    /// A terminal failure occurred on the acceptor.
    fn on_error(&self, acceptor: ChannelAcceptor, error: ChannelError);

    /// An inbound channel was accepted. The channel is already Open; attach
    /// a [`ChannelObserver`] to start receiving its data. Frames arriving
    /// before the observer is attached are buffered, not dropped.
    fn on_accept_channel(&self, acceptor: ChannelAcceptor, channel: Channel);
}

/// Resolves peer identities to reachable network endpoints.
///
/// Peer discovery is an external collaborator: the core only asks for the
/// current endpoint of a peer at send time, so directories may resolve
/// lazily and answers may change between calls.
pub trait PeerDirectory: Send + Sync {
    /// Resolve a peer to an endpoint, or `None` if unknown.
    fn resolve(&self, peer: &PeerId) -> Option<SocketAddr>;
}

/// A fixed peer-to-endpoint map, for configuration files and tests.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: RwLock<HashMap<PeerId, SocketAddr>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&self, peer: PeerId, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(peer, addr);
        }
    }

    /// Remove an entry.
    pub fn remove(&self, peer: &PeerId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(peer);
        }
    }
}

impl PeerDirectory for StaticDirectory {
    fn resolve(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.entries.read().ok()?.get(peer).copied()
    }
}
