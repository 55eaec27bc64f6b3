//! Packet variants.
//!
//! A "full packet" is any variant carrying a packet number and a frame
//! payload: Initial, Handshake and Short. Retry and Version Negotiation
//! are unnumbered and unencrypted.

use crate::crypto::EncryptionLevel;
use crate::frames::Frame;
use crate::types::{ConnectionId, PacketNumber};
use crate::version::Version;
use bytes::Bytes;

/// Frame payload of a numbered packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub frames: Vec<Frame>,
}

impl Payload {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Encoded length of all frames.
    pub fn encoded_len(&self) -> usize {
        self.frames.iter().map(Frame::encoded_len).sum()
    }

    /// Whether any frame obliges the receiver to acknowledge the packet.
    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }
}

/// Initial packet: carries the address-validation token and Initial-level
/// CRYPTO data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialPacket {
    pub dcid: Option<ConnectionId>,
    pub scid: Option<ConnectionId>,
    pub packet_number: PacketNumber,
    pub version: Version,
    pub token: Option<Bytes>,
    pub payload: Payload,
}

impl InitialPacket {
    pub fn create(
        dcid: Option<ConnectionId>,
        scid: Option<ConnectionId>,
        packet_number: PacketNumber,
        version: Version,
        token: Option<Bytes>,
        frames: Vec<Frame>,
    ) -> Packet {
        Packet::Initial(Self { dcid, scid, packet_number, version, token, payload: Payload::new(frames) })
    }
}

/// Handshake packet: Handshake-level CRYPTO data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub dcid: Option<ConnectionId>,
    pub scid: Option<ConnectionId>,
    pub packet_number: PacketNumber,
    pub version: Version,
    pub payload: Payload,
}

impl HandshakePacket {
    pub fn create(
        dcid: Option<ConnectionId>,
        scid: Option<ConnectionId>,
        packet_number: PacketNumber,
        version: Version,
        frames: Vec<Frame>,
    ) -> Packet {
        Packet::Handshake(Self { dcid, scid, packet_number, version, payload: Payload::new(frames) })
    }
}

/// Short (1-RTT) packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortPacket {
    pub key_phase: bool,
    pub dcid: Option<ConnectionId>,
    pub packet_number: PacketNumber,
    pub payload: Payload,
}

impl ShortPacket {
    pub fn create(
        key_phase: bool,
        dcid: Option<ConnectionId>,
        packet_number: PacketNumber,
        frames: Vec<Frame>,
    ) -> Packet {
        Packet::Short(Self { key_phase, dcid, packet_number, payload: Payload::new(frames) })
    }
}

/// Retry packet: unencrypted address-validation challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPacket {
    pub version: Version,
    pub dcid: Option<ConnectionId>,
    pub scid: Option<ConnectionId>,
    /// The destination connection ID of the Initial this responds to.
    pub original_dcid: ConnectionId,
    pub token: Bytes,
}

/// Version Negotiation packet: unencrypted list of supported versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiationPacket {
    pub dcid: Option<ConnectionId>,
    pub scid: Option<ConnectionId>,
    pub supported_versions: Vec<Version>,
}

/// Discriminated union over all packet variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Initial(InitialPacket),
    Handshake(HandshakePacket),
    Retry(RetryPacket),
    VersionNegotiation(VersionNegotiationPacket),
    Short(ShortPacket),
}

impl Packet {
    pub fn source_connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Packet::Initial(p) => p.scid.as_ref(),
            Packet::Handshake(p) => p.scid.as_ref(),
            Packet::Retry(p) => p.scid.as_ref(),
            Packet::VersionNegotiation(p) => p.scid.as_ref(),
            Packet::Short(_) => None,
        }
    }

    pub fn destination_connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Packet::Initial(p) => p.dcid.as_ref(),
            Packet::Handshake(p) => p.dcid.as_ref(),
            Packet::Retry(p) => p.dcid.as_ref(),
            Packet::VersionNegotiation(p) => p.dcid.as_ref(),
            Packet::Short(p) => p.dcid.as_ref(),
        }
    }

    /// Packet number, for numbered variants.
    pub fn packet_number(&self) -> Option<PacketNumber> {
        match self {
            Packet::Initial(p) => Some(p.packet_number),
            Packet::Handshake(p) => Some(p.packet_number),
            Packet::Short(p) => Some(p.packet_number),
            _ => None,
        }
    }

    /// Frame payload, for numbered variants.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Packet::Initial(p) => Some(&p.payload),
            Packet::Handshake(p) => Some(&p.payload),
            Packet::Short(p) => Some(&p.payload),
            _ => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match self {
            Packet::Initial(p) => Some(&mut p.payload),
            Packet::Handshake(p) => Some(&mut p.payload),
            Packet::Short(p) => Some(&mut p.payload),
            _ => None,
        }
    }

    /// Encryption level of a numbered variant.
    pub fn encryption_level(&self) -> Option<EncryptionLevel> {
        match self {
            Packet::Initial(_) => Some(EncryptionLevel::Initial),
            Packet::Handshake(_) => Some(EncryptionLevel::Handshake),
            Packet::Short(_) => Some(EncryptionLevel::OneRtt),
            _ => None,
        }
    }

    /// Whether this packet carries a numbered frame payload.
    pub fn is_full(&self) -> bool {
        self.payload().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{CryptoFrame, Frame};

    #[test]
    fn full_packet_accessors() {
        let cid = ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap();
        let packet = InitialPacket::create(
            Some(cid.clone()),
            None,
            7,
            Version::DRAFT_18,
            None,
            vec![Frame::Crypto(CryptoFrame::new(0, Bytes::from_static(b"ch")))],
        );
        assert!(packet.is_full());
        assert_eq!(packet.packet_number(), Some(7));
        assert_eq!(packet.encryption_level(), Some(EncryptionLevel::Initial));
        assert_eq!(packet.destination_connection_id(), Some(&cid));
    }

    #[test]
    fn retry_is_not_full() {
        let packet = Packet::Retry(RetryPacket {
            version: Version::DRAFT_18,
            dcid: None,
            scid: None,
            original_dcid: ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap(),
            token: Bytes::from_static(b"token"),
        });
        assert!(!packet.is_full());
        assert!(packet.packet_number().is_none());
    }
}
