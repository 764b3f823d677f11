//! # peermux
//!
//! A reliable, multiplexed, peer-addressed channel transport over
//! unreliable datagrams. It provides:
//!
//! - **Peer routing**: datagrams addressed by opaque peer identity, with
//!   endpoint resolution delegated to a pluggable directory
//! - **Channel multiplexing**: any number of reliable virtual circuits
//!   between peers, demultiplexed over one socket
//! - **Reliable framed delivery**: ordered, exactly-once delivery with
//!   cumulative acks, retransmission, and a bounded reorder window
//! - **RTT estimation**: RFC 6298 smoothing, kept fresh on idle channels
//!   by probe frames
//! - **Backpressure**: non-blocking `send` with an edge-triggered
//!   `writable` notification when a full queue drains
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │             Application                   │
//! │   observers (on worker) + handles (any)   │
//! ├───────────────────────────────────────────┤
//! │            ChannelManager                 │  ← single worker task
//! │   demux, timers, channel/acceptor tables  │
//! ├───────────────────────────────────────────┤
//! │               Channel                     │
//! │  framing, reliability, RTT, flow control  │
//! ├───────────────────────────────────────────┤
//! │                Router                     │
//! │     peer identity + UDP datagrams         │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use peermux::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let directory = Arc::new(StaticDirectory::new());
//! let router = Router::bind(
//!     PeerId::new("alice")?,
//!     "0.0.0.0:0".parse()?,
//!     directory.clone(),
//! )
//! .await?;
//!
//! let manager = ChannelManager::new(router, ManagerConfig::default());
//! manager.init()?;
//!
//! // Accept inbound channels on vport 7
//! let acceptor = manager.new_acceptor(7)?;
//! acceptor.set_observer(my_acceptor_observer);
//!
//! // Or open one to a remote peer
//! let channel = manager.new_channel(PeerId::new("bob")?, 7)?;
//! channel.set_observer(my_channel_observer);
//! while channel.send(block.clone()).is_ok() {}
//! // ... resume sending from the observer's `writable` callback
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Core types, traits, and errors
pub mod core;

// Wire format, RTT estimation, throughput accounting
pub mod transport;

// Peer identity + datagram substrate
pub mod router;

// Reliable virtual circuits
pub mod channel;

// Multiplexing engine and acceptors
pub mod manager;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{Channel, ChannelPhase, ChannelStats};
    pub use crate::core::{
        AcceptorObserver, ChannelError, ChannelId, ChannelObserver, ManagerError, PeerDirectory,
        PeerId, RouterError, StaticDirectory, VportId,
    };
    pub use crate::manager::{
        ChannelAcceptor, ChannelManager, ManagerConfig, ManagerConfigBuilder, ManagerStats,
    };
    pub use crate::router::Router;
}

// Re-export commonly used items at crate root
pub use crate::channel::{Channel, ChannelPhase, ChannelStats};
pub use crate::core::{
    AcceptorObserver, ChannelError, ChannelId, ChannelObserver, ManagerError, PeerDirectory,
    PeerId, RouterError, StaticDirectory, VportId,
};
pub use crate::manager::{
    ChannelAcceptor, ChannelManager, ManagerConfig, ManagerConfigBuilder, ManagerStats,
};
pub use crate::router::Router;
