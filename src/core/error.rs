//! Error types for the peermux transport core.

use thiserror::Error;

use super::types::VportId;

/// Errors reported on channels and acceptors.
///
/// This is both the synchronous failure type of [`crate::channel::Channel::send`]
/// and the code carried by observer `on_error` notifications. `QueueFull` is
/// the only non-fatal member: it signals backpressure and is recovered by
/// waiting for the `writable` callback. Every other variant is terminal for
/// the affected channel.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The open handshake did not complete in time.
    #[error("open handshake timed out")]
    HandshakeTimeout,

    /// The peer (or the requested vport on it) is unreachable.
    #[error("peer unreachable")]
    PeerUnreachable,

    /// A malformed or unexpected frame was received.
    #[error("protocol violation")]
    ProtocolViolation,

    /// The send queue is full; wait for `writable` before sending again.
    #[error("send queue full")]
    QueueFull,

    /// The channel is closing, closed, or errored.
    #[error("channel closed")]
    ChannelClosed,
}

/// Errors in the router layer.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The local peer identity is empty or malformed.
    #[error("invalid peer identity: {0}")]
    InvalidIdentity(String),

    /// The router was already started.
    #[error("router already initialized")]
    AlreadyInitialized,

    /// The router is not running (never started, or shut down).
    #[error("router not initialized")]
    NotInitialized,

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the channel manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// `init` was called on a running manager.
    #[error("manager already initialized")]
    AlreadyInitialized,

    /// The manager is not running (never initialized, or shut down).
    #[error("manager not initialized")]
    NotInitialized,

    /// The requested listening vport is already bound.
    #[error("vport {0} already in use")]
    VportInUse(VportId),
}
