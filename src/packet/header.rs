//! Draft-18 packet header codec and payload protection.
//!
//! Long headers carry the connection ID lengths as nibbles with the +3
//! offset, the token (Initial only), and a varint Length covering packet
//! number plus ciphertext. Packet numbers are always emitted in the
//! 4-byte encoding. The header bytes through the packet number form the
//! AEAD associated data.

use super::types::*;
use crate::crypto::{Aead, AeadSet, EncryptionLevel};
use crate::error::{Error, Result};
use crate::frames::{decode_frames, encode_frames};
use crate::types::{get_varint, put_varint, ConnectionId, PacketNumber};
use crate::version::Version;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FORM_LONG: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const LONG_TYPE_INITIAL: u8 = 0x0;
const LONG_TYPE_HANDSHAKE: u8 = 0x2;
const LONG_TYPE_RETRY: u8 = 0x3;
const SHORT_KEY_PHASE: u8 = 0x04;
/// Packet-number length bits: always the 4-byte encoding.
const PN_LEN_BITS: u8 = 0x03;
const PN_LEN: usize = 4;
/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

fn cid_nibble(cid: Option<&ConnectionId>) -> u8 {
    match cid {
        Some(cid) => (cid.len() - 3) as u8,
        None => 0,
    }
}

fn nibble_len(nibble: u8) -> usize {
    if nibble == 0 {
        0
    } else {
        nibble as usize + 3
    }
}

/// Encode and protect a packet. `aead` is required for the numbered
/// variants and ignored by Retry and Version Negotiation.
pub fn encode_packet(packet: &Packet, aead: Option<&Aead>) -> Result<Bytes> {
    match packet {
        Packet::Initial(p) => {
            let aead = aead.ok_or(Error::InvalidState)?;
            let mut header = BytesMut::new();
            header.put_u8(FORM_LONG | FIXED_BIT | (LONG_TYPE_INITIAL << 4) | PN_LEN_BITS);
            header.put_u32(p.version.as_u32());
            put_cids(&mut header, p.dcid.as_ref(), p.scid.as_ref());
            match &p.token {
                Some(token) => {
                    put_varint(&mut header, token.len() as u64);
                    header.put_slice(token);
                }
                None => put_varint(&mut header, 0),
            }
            finish_long(header, p.packet_number, &p.payload, aead)
        }
        Packet::Handshake(p) => {
            let aead = aead.ok_or(Error::InvalidState)?;
            let mut header = BytesMut::new();
            header.put_u8(FORM_LONG | FIXED_BIT | (LONG_TYPE_HANDSHAKE << 4) | PN_LEN_BITS);
            header.put_u32(p.version.as_u32());
            put_cids(&mut header, p.dcid.as_ref(), p.scid.as_ref());
            finish_long(header, p.packet_number, &p.payload, aead)
        }
        Packet::Short(p) => {
            let aead = aead.ok_or(Error::InvalidState)?;
            let mut header = BytesMut::new();
            let key_phase = if p.key_phase { SHORT_KEY_PHASE } else { 0 };
            header.put_u8(FIXED_BIT | key_phase | PN_LEN_BITS);
            if let Some(dcid) = &p.dcid {
                header.put_slice(dcid.as_bytes());
            }
            header.put_u32(p.packet_number as u32);

            let mut frames = BytesMut::new();
            encode_frames(&p.payload.frames, &mut frames);
            let ciphertext = aead.seal(p.packet_number, &header, &frames);

            let mut out = header;
            out.put_slice(&ciphertext);
            Ok(out.freeze())
        }
        Packet::Retry(p) => {
            let mut out = BytesMut::new();
            let odcil = cid_nibble(Some(&p.original_dcid));
            out.put_u8(FORM_LONG | FIXED_BIT | (LONG_TYPE_RETRY << 4) | odcil);
            out.put_u32(p.version.as_u32());
            put_cids(&mut out, p.dcid.as_ref(), p.scid.as_ref());
            out.put_slice(p.original_dcid.as_bytes());
            out.put_slice(&p.token);
            Ok(out.freeze())
        }
        Packet::VersionNegotiation(p) => {
            let mut out = BytesMut::new();
            out.put_u8(FORM_LONG | FIXED_BIT);
            out.put_u32(Version::NEGOTIATION.as_u32());
            put_cids(&mut out, p.dcid.as_ref(), p.scid.as_ref());
            for version in &p.supported_versions {
                out.put_u32(version.as_u32());
            }
            Ok(out.freeze())
        }
    }
}

fn put_cids(buf: &mut BytesMut, dcid: Option<&ConnectionId>, scid: Option<&ConnectionId>) {
    buf.put_u8((cid_nibble(dcid) << 4) | cid_nibble(scid));
    if let Some(dcid) = dcid {
        buf.put_slice(dcid.as_bytes());
    }
    if let Some(scid) = scid {
        buf.put_slice(scid.as_bytes());
    }
}

fn finish_long(
    mut header: BytesMut,
    packet_number: PacketNumber,
    payload: &Payload,
    aead: &Aead,
) -> Result<Bytes> {
    let mut frames = BytesMut::new();
    encode_frames(&payload.frames, &mut frames);

    put_varint(&mut header, (PN_LEN + frames.len() + TAG_LEN) as u64);
    header.put_u32(packet_number as u32);

    let ciphertext = aead.seal(packet_number, &header, &frames);
    let mut out = header;
    out.put_slice(&ciphertext);
    Ok(out.freeze())
}

/// Parse and decrypt one packet from a datagram.
///
/// `dcid_len` is the length of the connection IDs this endpoint issues,
/// needed to delimit the short header.
pub fn decode_packet(datagram: &[u8], aeads: &AeadSet, dcid_len: usize) -> Result<Packet> {
    if datagram.is_empty() {
        return Err(Error::FrameEncoding);
    }
    let first = datagram[0];

    if first & FORM_LONG == 0 {
        return decode_short(datagram, aeads, dcid_len);
    }

    if datagram.len() < 6 {
        return Err(Error::FrameEncoding);
    }
    let version = Version(u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]));
    if version == Version::NEGOTIATION {
        return decode_version_negotiation(datagram);
    }

    match (first >> 4) & 0x3 {
        LONG_TYPE_INITIAL => decode_long(datagram, version, aeads, EncryptionLevel::Initial, true),
        LONG_TYPE_HANDSHAKE => {
            decode_long(datagram, version, aeads, EncryptionLevel::Handshake, false)
        }
        LONG_TYPE_RETRY => decode_retry(datagram, version),
        _ => Err(Error::FrameEncoding), // 0-RTT is out of scope
    }
}

fn decode_cids(buf: &mut &[u8]) -> Result<(Option<ConnectionId>, Option<ConnectionId>)> {
    if buf.is_empty() {
        return Err(Error::FrameEncoding);
    }
    let nibbles = buf[0];
    buf.advance(1);
    let dcid_len = nibble_len(nibbles >> 4);
    let scid_len = nibble_len(nibbles & 0x0f);
    if buf.len() < dcid_len + scid_len {
        return Err(Error::FrameEncoding);
    }
    let dcid =
        if dcid_len > 0 { Some(ConnectionId::from_slice(&buf[..dcid_len])?) } else { None };
    buf.advance(dcid_len);
    let scid =
        if scid_len > 0 { Some(ConnectionId::from_slice(&buf[..scid_len])?) } else { None };
    buf.advance(scid_len);
    Ok((dcid, scid))
}

fn decode_long(
    datagram: &[u8],
    version: Version,
    aeads: &AeadSet,
    level: EncryptionLevel,
    has_token: bool,
) -> Result<Packet> {
    let first = datagram[0];
    let mut buf = &datagram[5..];
    let (dcid, scid) = decode_cids(&mut buf)?;

    let token = if has_token {
        let token_len = get_varint(&mut buf)? as usize;
        if buf.len() < token_len {
            return Err(Error::FrameEncoding);
        }
        let token = if token_len > 0 { Some(Bytes::copy_from_slice(&buf[..token_len])) } else { None };
        buf.advance(token_len);
        token
    } else {
        None
    };

    let length = get_varint(&mut buf)? as usize;
    let pn_len = (first & 0x03) as usize + 1;
    if buf.len() < length || length < pn_len {
        return Err(Error::FrameEncoding);
    }

    let mut pn_bytes = [0u8; 8];
    pn_bytes[8 - pn_len..].copy_from_slice(&buf[..pn_len]);
    let packet_number = u64::from_be_bytes(pn_bytes);

    let header_len = datagram.len() - buf.len() + pn_len;
    let aad = &datagram[..header_len];
    let ciphertext = &buf[pn_len..length];

    let plaintext = aeads.get(level)?.open(packet_number, aad, ciphertext)?;
    let frames = decode_frames(&plaintext)?;

    Ok(match level {
        EncryptionLevel::Initial => Packet::Initial(InitialPacket {
            dcid,
            scid,
            packet_number,
            version,
            token,
            payload: Payload::new(frames),
        }),
        _ => Packet::Handshake(HandshakePacket {
            dcid,
            scid,
            packet_number,
            version,
            payload: Payload::new(frames),
        }),
    })
}

fn decode_short(datagram: &[u8], aeads: &AeadSet, dcid_len: usize) -> Result<Packet> {
    let first = datagram[0];
    if first & FIXED_BIT == 0 {
        return Err(Error::FrameEncoding);
    }
    let pn_len = (first & 0x03) as usize + 1;
    if datagram.len() < 1 + dcid_len + pn_len + TAG_LEN {
        return Err(Error::FrameEncoding);
    }

    let dcid = if dcid_len > 0 {
        Some(ConnectionId::from_slice(&datagram[1..1 + dcid_len])?)
    } else {
        None
    };

    let pn_start = 1 + dcid_len;
    let mut pn_bytes = [0u8; 8];
    pn_bytes[8 - pn_len..].copy_from_slice(&datagram[pn_start..pn_start + pn_len]);
    let packet_number = u64::from_be_bytes(pn_bytes);

    let header_len = pn_start + pn_len;
    let aad = &datagram[..header_len];
    let ciphertext = &datagram[header_len..];

    let plaintext = aeads.get(EncryptionLevel::OneRtt)?.open(packet_number, aad, ciphertext)?;
    let frames = decode_frames(&plaintext)?;

    Ok(Packet::Short(ShortPacket {
        key_phase: first & SHORT_KEY_PHASE != 0,
        dcid,
        packet_number,
        payload: Payload::new(frames),
    }))
}

fn decode_retry(datagram: &[u8], version: Version) -> Result<Packet> {
    let first = datagram[0];
    let odcid_len = nibble_len(first & 0x0f);
    let mut buf = &datagram[5..];
    let (dcid, scid) = decode_cids(&mut buf)?;

    if buf.len() < odcid_len {
        return Err(Error::FrameEncoding);
    }
    let original_dcid = ConnectionId::from_slice(&buf[..odcid_len])?;
    buf.advance(odcid_len);

    Ok(Packet::Retry(RetryPacket {
        version,
        dcid,
        scid,
        original_dcid,
        token: Bytes::copy_from_slice(buf),
    }))
}

fn decode_version_negotiation(datagram: &[u8]) -> Result<Packet> {
    let mut buf = &datagram[5..];
    let (dcid, scid) = decode_cids(&mut buf)?;

    if buf.len() % 4 != 0 {
        return Err(Error::FrameEncoding);
    }
    let mut supported_versions = Vec::with_capacity(buf.len() / 4);
    while buf.has_remaining() {
        supported_versions.push(Version(buf.get_u32()));
    }

    Ok(Packet::VersionNegotiation(VersionNegotiationPacket { dcid, scid, supported_versions }))
}
