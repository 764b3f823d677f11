//! Identity types: peers, virtual ports, and channel ids.

use super::error::RouterError;

/// Maximum peer identity length in bytes.
///
/// The datagram envelope carries the source identity behind a one-byte
/// length prefix, so identities must fit in a u8.
pub const MAX_PEER_ID_LEN: usize = 255;

/// Opaque identifier of a remote endpoint.
///
/// A peer id is an application-chosen byte string, stable for the process
/// lifetime of the remote peer. It is validated at construction: empty and
/// oversized identities are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Create a peer id from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, RouterError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(RouterError::InvalidIdentity("empty peer id".into()));
        }
        if bytes.len() > MAX_PEER_ID_LEN {
            return Err(RouterError::InvalidIdentity(format!(
                "peer id too long: {} bytes (max {})",
                bytes.len(),
                MAX_PEER_ID_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// Get the identity as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the identity in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Peer ids are never empty; provided for completeness.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s}"),
            _ => {
                for b in &self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Virtual port number: a numeric rendezvous point on a peer.
///
/// 0 means "any/ephemeral": an acceptor bound to vport 0 gets an ephemeral
/// port assigned, and a channel opened to vport 0 is routed to any open
/// acceptor on the destination peer.
pub type VportId = u16;

/// Ephemeral vports are allocated from this value upward.
pub const EPHEMERAL_VPORT_BASE: VportId = 0xE000;

/// Process-unique identifier of a channel.
///
/// Assigned at channel creation from a monotonic counter and never reused
/// while the owning manager is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Create a channel id from its raw value.
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_rejects_empty() {
        assert!(PeerId::new(Vec::new()).is_err());
    }

    #[test]
    fn test_peer_id_rejects_oversized() {
        assert!(PeerId::new(vec![0u8; MAX_PEER_ID_LEN + 1]).is_err());
        assert!(PeerId::new(vec![0u8; MAX_PEER_ID_LEN]).is_ok());
    }

    #[test]
    fn test_peer_id_display_utf8() {
        let id = PeerId::new("alice").unwrap();
        assert_eq!(format!("{id}"), "alice");
    }

    #[test]
    fn test_peer_id_display_binary_as_hex() {
        let id = PeerId::new(vec![0x01, 0xFF]).unwrap();
        assert_eq!(format!("{id}"), "01ff");
    }

    #[test]
    fn test_channel_id_roundtrip() {
        let id = ChannelId::from_u64(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(format!("{id}"), "42");
    }
}
