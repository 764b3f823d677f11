//! Core types, traits, constants, and error taxonomy.

pub mod constants;
mod error;
mod traits;
mod types;

pub use error::{ChannelError, ManagerError, RouterError};
pub use traits::{AcceptorObserver, ChannelObserver, PeerDirectory, StaticDirectory};
pub use types::{ChannelId, PeerId, VportId, EPHEMERAL_VPORT_BASE, MAX_PEER_ID_LEN};
