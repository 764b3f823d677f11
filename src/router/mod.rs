//! Peer identity and raw datagram transport.
//!
//! The router is a thin name-plus-transport substrate: it owns this
//! process's peer identity and a UDP socket, sends best-effort datagrams to
//! peers resolved through a [`PeerDirectory`], and hands inbound datagrams
//! up to the channel manager. It performs no reliability or ordering —
//! those are the channel's job.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{PeerDirectory, PeerId, RouterError};
use crate::transport;

/// Receive buffer size; a datagram never exceeds this.
const RECV_BUFFER_SIZE: usize = 65535;

/// Peer-addressed datagram endpoint.
///
/// Created with [`Router::bind`], which validates the local identity and
/// binds the socket. `send_datagram` is fire-and-forget: the endpoint is
/// resolved lazily at send time and failures are reported asynchronously
/// (through the reliability machinery above this layer), never via the
/// return value.
pub struct Router {
    local: PeerId,
    directory: Arc<dyn PeerDirectory>,
    socket: Arc<UdpSocket>,
    started: AtomicBool,
    shut: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Bind a router to the given local address with the given identity.
    pub async fn bind(
        local: PeerId,
        addr: SocketAddr,
        directory: Arc<dyn PeerDirectory>,
    ) -> Result<Arc<Self>, RouterError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self {
            local,
            directory,
            socket: Arc::new(socket),
            started: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            recv_task: Mutex::new(None),
        }))
    }

    /// The local peer identity.
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, RouterError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram to a peer, best-effort.
    ///
    /// The payload is wrapped in the source-identity envelope. Resolution
    /// misses and socket errors are logged and swallowed — the datagram
    /// substrate is unreliable by contract. The only synchronous failure is
    /// `NotInitialized` after [`Router::shutdown`].
    pub fn send_datagram(&self, peer: &PeerId, payload: &[u8]) -> Result<(), RouterError> {
        if self.shut.load(Ordering::Acquire) {
            return Err(RouterError::NotInitialized);
        }

        let Some(addr) = self.directory.resolve(peer) else {
            tracing::debug!(peer = %peer, "datagram dropped: peer not in directory");
            return Ok(());
        };

        let mut buf = Vec::with_capacity(1 + self.local.len() + payload.len());
        buf.push(self.local.len() as u8);
        buf.extend_from_slice(self.local.as_bytes());
        buf.extend_from_slice(payload);

        match self.socket.try_send_to(&buf, addr) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::trace!(peer = %peer, "datagram dropped: socket not ready");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "datagram send failed");
            }
        }
        Ok(())
    }

    /// Start the receive loop, forwarding `(source peer, frame bytes)` to
    /// the given queue. Called once by the channel manager's `init`.
    pub(crate) fn start(
        self: &Arc<Self>,
        inbound: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    ) -> Result<(), RouterError> {
        if self.shut.load(Ordering::Acquire) {
            return Err(RouterError::NotInitialized);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RouterError::AlreadyInitialized);
        }

        let socket = Arc::clone(&self.socket);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let len = match socket.recv_from(&mut buf).await {
                    Ok((len, _from)) => len,
                    Err(e) => {
                        tracing::warn!(error = %e, "datagram receive failed");
                        continue;
                    }
                };
                match transport::decode_datagram(&buf[..len]) {
                    Ok((peer, frame_bytes)) => {
                        if inbound.send((peer, frame_bytes.to_vec())).is_err() {
                            // Manager is gone; stop receiving.
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, "malformed datagram dropped");
                    }
                }
            }
        });

        if let Ok(mut slot) = self.recv_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    /// Stop the router. Idempotent; subsequent sends fail `NotInitialized`.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.recv_task.lock()
            && let Some(task) = slot.take()
        {
            task.abort();
        }
        tracing::debug!(peer = %self.local, "router shut down");
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StaticDirectory;
    use crate::transport::{Frame, FrameKind};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn probe_frame() -> Frame {
        Frame {
            kind: FrameKind::Probe,
            channel: 1,
            sequence: 0,
            ack: 0,
            payload: transport::encode_probe_body(42),
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let dir = Arc::new(StaticDirectory::new());
        let alice = PeerId::new("alice").unwrap();
        let bob = PeerId::new("bob").unwrap();

        let ra = Router::bind(alice.clone(), loopback(), dir.clone())
            .await
            .unwrap();
        let rb = Router::bind(bob.clone(), loopback(), dir.clone())
            .await
            .unwrap();
        dir.insert(alice.clone(), ra.local_addr().unwrap());
        dir.insert(bob.clone(), rb.local_addr().unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        rb.start(tx).unwrap();

        let frame = probe_frame();
        ra.send_datagram(&bob, &frame.encode()).unwrap();

        let (from, bytes) = rx.recv().await.unwrap();
        assert_eq!(from, alice);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_unresolved_peer_is_swallowed() {
        let dir = Arc::new(StaticDirectory::new());
        let router = Router::bind(PeerId::new("a").unwrap(), loopback(), dir)
            .await
            .unwrap();

        // Nobody in the directory: send succeeds (failure is asynchronous)
        let ghost = PeerId::new("ghost").unwrap();
        router.send_datagram(&ghost, b"payload").unwrap();
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = Arc::new(StaticDirectory::new());
        let router = Router::bind(PeerId::new("a").unwrap(), loopback(), dir)
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        router.start(tx).unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            router.start(tx2),
            Err(RouterError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let dir = Arc::new(StaticDirectory::new());
        let peer = PeerId::new("a").unwrap();
        let router = Router::bind(peer.clone(), loopback(), dir).await.unwrap();

        router.shutdown();
        router.shutdown(); // idempotent

        assert!(matches!(
            router.send_datagram(&peer, b"x"),
            Err(RouterError::NotInitialized)
        ));
    }
}
