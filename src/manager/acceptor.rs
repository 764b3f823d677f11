//! Channel acceptors: vport listeners that produce inbound channels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::core::{AcceptorObserver, VportId};

use super::Command;

/// Handle-visible acceptor state.
pub(crate) struct AcceptorShared {
    pub(crate) vport: VportId,
    pub(crate) open: AtomicBool,
}

/// Listens on a vport for inbound channel-open requests.
///
/// Created by [`crate::manager::ChannelManager::new_acceptor`] in the Open
/// state. `close` stops new inbound creation at the vport but does not
/// affect channels that were already accepted.
#[derive(Clone)]
pub struct ChannelAcceptor {
    pub(crate) shared: Arc<AcceptorShared>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ChannelAcceptor {
    /// The vport this acceptor listens on.
    pub fn vport(&self) -> VportId {
        self.shared.vport
    }

    /// Whether the acceptor is currently listening.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Attach the observer that receives accepted channels. Channels
    /// accepted before the observer was attached are buffered and handed
    /// over, in order, as soon as it is.
    pub fn set_observer(&self, observer: Arc<dyn AcceptorObserver>) {
        let _ = self.cmd_tx.send(Command::SetAcceptorObserver {
            vport: self.shared.vport,
            observer,
        });
    }

    /// Resume listening. Idempotent.
    pub fn open(&self) {
        let _ = self.cmd_tx.send(Command::SetAcceptorOpen {
            vport: self.shared.vport,
            open: true,
        });
    }

    /// Stop listening. Idempotent.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::SetAcceptorOpen {
            vport: self.shared.vport,
            open: false,
        });
    }
}

impl std::fmt::Debug for ChannelAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAcceptor")
            .field("vport", &self.shared.vport)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Worker-owned acceptor state.
pub(crate) struct AcceptorCore {
    handle: ChannelAcceptor,
    observer: Option<Arc<dyn AcceptorObserver>>,
    /// Channels accepted before the observer was attached.
    pending_accepts: VecDeque<Channel>,
}

impl AcceptorCore {
    pub(crate) fn new(handle: ChannelAcceptor) -> Self {
        Self {
            handle,
            observer: None,
            pending_accepts: VecDeque::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub(crate) fn vport(&self) -> VportId {
        self.handle.vport()
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.handle.shared.open.store(open, Ordering::Release);
    }

    pub(crate) fn set_observer(&mut self, observer: Arc<dyn AcceptorObserver>) {
        self.observer = Some(Arc::clone(&observer));
        while let Some(channel) = self.pending_accepts.pop_front() {
            observer.on_accept_channel(self.handle.clone(), channel);
        }
    }

    pub(crate) fn notify_accept(&mut self, channel: Channel) {
        if let Some(observer) = self.observer.clone() {
            observer.on_accept_channel(self.handle.clone(), channel);
        } else {
            self.pending_accepts.push_back(channel);
        }
    }
}
