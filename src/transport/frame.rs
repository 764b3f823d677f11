//! Frame encoding and decoding.
//!
//! Every datagram between two peers carries exactly one frame behind a
//! small source-identity envelope:
//!
//! ```text
//! datagram = [ id_len: u8 ][ source peer id ][ frame ]
//! ```
//!
//! Frame wire format (27-byte header, little-endian integers):
//!
//! ```text
//! +------+----------------+----------------+----------------+----------+
//! | Kind | Dst Channel    | Sequence       | Ack            | Length   |
//! | 1 B  | 8 B (LE64)     | 8 B (LE64)     | 8 B (LE64)     | 2 B LE16 |
//! +------+----------------+----------------+----------------+----------+
//! | Payload (Length bytes)                                             |
//! +--------------------------------------------------------------------+
//! ```
//!
//! `Dst Channel` names the channel id on the *receiving* peer (0 in OPEN
//! frames, where the receiver is found by vport instead). `Ack` is the
//! cumulative acknowledgment: the next sequence number the sender expects.
//! `Sequence` is meaningful only on data frames.

use thiserror::Error;

use crate::core::{PeerId, VportId, MAX_PEER_ID_LEN};

/// Frame header size on the wire.
pub const FRAME_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 2;

/// OPEN payload size (initiator channel id + source vport + destination vport).
pub const OPEN_BODY_SIZE: usize = 8 + 2 + 2;

/// ACCEPT payload size (acceptor channel id).
pub const ACCEPT_BODY_SIZE: usize = 8;

/// REJECT payload size (reason code).
pub const REJECT_BODY_SIZE: usize = 2;

/// PROBE / PROBE_ACK payload size (u32 millisecond timestamp).
pub const PROBE_BODY_SIZE: usize = 4;

/// Rejection reason: no acceptor is listening on the requested vport.
pub const REJECT_NO_ACCEPTOR: u16 = 1;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Channel open request (initiator -> acceptor).
    Open = 0x01,
    /// Open accepted (acceptor -> initiator).
    Accept = 0x02,
    /// Open rejected (acceptor side -> initiator).
    Reject = 0x03,
    /// Application data.
    Data = 0x04,
    /// Pure cumulative acknowledgment.
    Ack = 0x05,
    /// RTT probe (keepalive on idle channels).
    Probe = 0x06,
    /// RTT probe echo.
    ProbeAck = 0x07,
    /// Graceful close request.
    Close = 0x08,
    /// Close acknowledgment.
    CloseAck = 0x09,
}

impl FrameKind {
    /// Parse a frame kind from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Accept),
            0x03 => Some(Self::Reject),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Ack),
            0x06 => Some(Self::Probe),
            0x07 => Some(Self::ProbeAck),
            0x08 => Some(Self::Close),
            0x09 => Some(Self::CloseAck),
            _ => None,
        }
    }

    /// Wire byte of this frame kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether frames of this kind carry application payload bytes.
    pub fn is_data(self) -> bool {
        self == Self::Data
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Destination channel id on the receiving peer (0 when unknown).
    pub channel: u64,
    /// Data-frame sequence number (0 on non-data frames).
    pub sequence: u64,
    /// Cumulative ack: next sequence the sender expects from the receiver.
    pub ack: u64,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Serialize the frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&self.channel.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.ack.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a frame from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let kind = FrameKind::from_byte(data[0]).ok_or(FrameError::UnknownKind(data[0]))?;
        let channel = read_u64(&data[1..9]);
        let sequence = read_u64(&data[9..17]);
        let ack = read_u64(&data[17..25]);
        let len = u16::from_le_bytes([data[25], data[26]]) as usize;

        if data.len() < FRAME_HEADER_SIZE + len {
            return Err(FrameError::PayloadLengthMismatch {
                expected: len,
                actual: data.len() - FRAME_HEADER_SIZE,
            });
        }

        Ok(Self {
            kind,
            channel,
            sequence,
            ack,
            payload: data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec(),
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// OPEN frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenBody {
    /// The initiator's channel id (replies address this id).
    pub src_channel: u64,
    /// The initiator's vport.
    pub src_vport: VportId,
    /// The vport being opened on the receiving peer (0 = any open acceptor).
    pub dst_vport: VportId,
}

impl OpenBody {
    /// Serialize the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OPEN_BODY_SIZE);
        buf.extend_from_slice(&self.src_channel.to_le_bytes());
        buf.extend_from_slice(&self.src_vport.to_le_bytes());
        buf.extend_from_slice(&self.dst_vport.to_le_bytes());
        buf
    }

    /// Parse the body.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < OPEN_BODY_SIZE {
            return Err(FrameError::TooShort {
                expected: OPEN_BODY_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            src_channel: read_u64(&data[0..8]),
            src_vport: u16::from_le_bytes([data[8], data[9]]),
            dst_vport: u16::from_le_bytes([data[10], data[11]]),
        })
    }
}

/// ACCEPT frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptBody {
    /// The acceptor-side channel id (subsequent frames address this id).
    pub src_channel: u64,
}

impl AcceptBody {
    /// Serialize the body.
    pub fn encode(&self) -> Vec<u8> {
        self.src_channel.to_le_bytes().to_vec()
    }

    /// Parse the body.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < ACCEPT_BODY_SIZE {
            return Err(FrameError::TooShort {
                expected: ACCEPT_BODY_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            src_channel: read_u64(&data[0..8]),
        })
    }
}

/// Encode a u16 rejection reason body.
pub fn encode_reject_body(code: u16) -> Vec<u8> {
    code.to_le_bytes().to_vec()
}

/// Encode a u32 probe timestamp body.
pub fn encode_probe_body(timestamp_ms: u32) -> Vec<u8> {
    timestamp_ms.to_le_bytes().to_vec()
}

/// Parse a u32 probe timestamp body.
pub fn decode_probe_body(data: &[u8]) -> Result<u32, FrameError> {
    if data.len() < PROBE_BODY_SIZE {
        return Err(FrameError::TooShort {
            expected: PROBE_BODY_SIZE,
            actual: data.len(),
        });
    }
    Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

/// Wrap a frame in the source-identity envelope.
pub fn encode_datagram(source: &PeerId, frame: &Frame) -> Vec<u8> {
    let encoded = frame.encode();
    let mut buf = Vec::with_capacity(1 + source.len() + encoded.len());
    buf.push(source.len() as u8);
    buf.extend_from_slice(source.as_bytes());
    buf.extend_from_slice(&encoded);
    buf
}

/// Split a datagram into its source peer and the raw frame bytes.
pub fn decode_datagram(data: &[u8]) -> Result<(PeerId, &[u8]), FrameError> {
    let Some((&id_len, rest)) = data.split_first() else {
        return Err(FrameError::TooShort {
            expected: 1,
            actual: 0,
        });
    };
    let id_len = id_len as usize;
    if id_len == 0 || id_len > MAX_PEER_ID_LEN || rest.len() < id_len {
        return Err(FrameError::BadSourceId);
    }
    let peer =
        PeerId::new(rest[..id_len].to_vec()).map_err(|_| FrameError::BadSourceId)?;
    Ok((peer, &rest[id_len..]))
}

/// Errors that can occur during frame parsing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer is shorter than the structure it should contain.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Unknown frame kind byte.
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// Declared payload length exceeds the available bytes.
    #[error("payload length mismatch: header says {expected}, but {actual} bytes available")]
    PayloadLengthMismatch {
        /// Expected payload length from the header.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Datagram envelope carries an empty or truncated source identity.
    #[error("bad source peer id in datagram envelope")]
    BadSourceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame() -> Frame {
        Frame {
            kind: FrameKind::Data,
            channel: 7,
            sequence: 100,
            ack: 55,
            payload: vec![0xAA, 0xBB, 0xCC],
        }
    }

    #[test]
    fn test_frame_kind_roundtrip() {
        for k in [
            FrameKind::Open,
            FrameKind::Accept,
            FrameKind::Reject,
            FrameKind::Data,
            FrameKind::Ack,
            FrameKind::Probe,
            FrameKind::ProbeAck,
            FrameKind::Close,
            FrameKind::CloseAck,
        ] {
            assert_eq!(FrameKind::from_byte(k.as_byte()), Some(k));
        }
        assert_eq!(FrameKind::from_byte(0x00), None);
        assert_eq!(FrameKind::from_byte(0xFF), None);
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = data_frame();
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 3);

        let parsed = Frame::decode(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_frame_golden_encoding() {
        let frame = Frame {
            kind: FrameKind::Ack,
            channel: 0x0102030405060708,
            sequence: 0,
            ack: 0x10,
            payload: vec![],
        };
        assert_eq!(
            hex::encode(frame.encode()),
            "050807060504030201000000000000000010000000000000000000"
        );
    }

    #[test]
    fn test_frame_too_short() {
        let err = Frame::decode(&[0x04; 10]).unwrap_err();
        assert!(matches!(err, FrameError::TooShort { .. }));
    }

    #[test]
    fn test_frame_unknown_kind() {
        let mut bytes = data_frame().encode();
        bytes[0] = 0x7F;
        assert_eq!(Frame::decode(&bytes), Err(FrameError::UnknownKind(0x7F)));
    }

    #[test]
    fn test_frame_truncated_payload() {
        let mut bytes = data_frame().encode();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_open_body_roundtrip() {
        let body = OpenBody {
            src_channel: 42,
            src_vport: 0xE001,
            dst_vport: 7,
        };
        let parsed = OpenBody::decode(&body.encode()).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_accept_body_roundtrip() {
        let body = AcceptBody { src_channel: 99 };
        assert_eq!(AcceptBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn test_probe_body_roundtrip() {
        assert_eq!(decode_probe_body(&encode_probe_body(123456)).unwrap(), 123456);
    }

    #[test]
    fn test_datagram_envelope_roundtrip() {
        let peer = PeerId::new("alice").unwrap();
        let frame = data_frame();
        let datagram = encode_datagram(&peer, &frame);

        let (parsed_peer, frame_bytes) = decode_datagram(&datagram).unwrap();
        assert_eq!(parsed_peer, peer);
        assert_eq!(Frame::decode(frame_bytes).unwrap(), frame);
    }

    #[test]
    fn test_datagram_empty_source_rejected() {
        let mut datagram = encode_datagram(&PeerId::new("a").unwrap(), &data_frame());
        datagram[0] = 0;
        assert_eq!(decode_datagram(&datagram), Err(FrameError::BadSourceId));
    }

    #[test]
    fn test_datagram_truncated_source_rejected() {
        assert_eq!(decode_datagram(&[5, b'a', b'b']), Err(FrameError::BadSourceId));
    }
}
