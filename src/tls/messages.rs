//! TLS 1.3 handshake message codec.
//!
//! Only the single profile this endpoint negotiates is encoded:
//! TLS_AES_128_GCM_SHA256, X25519 key exchange, Ed25519 signatures.
//! QUIC transport parameters ride through as an opaque extension body;
//! their own codec lives in `transport::parameters`.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Handshake message types (RFC 8446 section 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    ClientHello = 1,
    ServerHello = 2,
    EncryptedExtensions = 8,
    Certificate = 11,
    CertificateVerify = 15,
    Finished = 20,
}

pub const CIPHER_AES_128_GCM_SHA256: u16 = 0x1301;
pub const GROUP_X25519: u16 = 0x001d;
pub const SIGNATURE_ED25519: u16 = 0x0807;

const LEGACY_VERSION: u16 = 0x0303;
const TLS_1_3: u16 = 0x0304;

const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
const EXT_KEY_SHARE: u16 = 0x0033;
const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 0xffa5;

fn decode_error() -> Error {
    Error::Tls { alert: 0x32, reason: "malformed handshake message" }
}

fn illegal_parameter() -> Error {
    Error::Tls { alert: 0x2f, reason: "unsupported handshake parameter" }
}

// ============================================================================
// Message framing
// ============================================================================

/// Pull the next complete handshake message out of a reassembly buffer.
///
/// Returns `(msg_type, full_message, body)` where `full_message` includes
/// the 4-byte header and is what the transcript hash consumes. Returns
/// `None` while the buffer holds only a partial message.
pub fn next_message(buf: &mut BytesMut) -> Result<Option<(u8, Bytes, Bytes)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let msg_type = buf[0];
    let body_len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
    if body_len > 1 << 20 {
        return Err(decode_error());
    }
    if buf.len() < 4 + body_len {
        return Ok(None);
    }
    let full = buf.split_to(4 + body_len).freeze();
    let body = full.slice(4..);
    Ok(Some((msg_type, full, body)))
}

/// Wrap a body in a handshake message header.
fn frame_message(msg_type: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_u8(msg_type);
    out.put_u8((body.len() >> 16) as u8);
    out.put_u8((body.len() >> 8) as u8);
    out.put_u8(body.len() as u8);
    out.put_slice(body);
    out.freeze()
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(decode_error());
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    Ok(take(buf, 1)?[0])
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    let bytes = take(buf, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take_u24(buf: &mut &[u8]) -> Result<usize> {
    let bytes = take(buf, 3)?;
    Ok(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
}

// ============================================================================
// ClientHello
// ============================================================================

/// The ClientHello fields the endpoint consumes.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub random: [u8; 32],
    /// Client's X25519 key share.
    pub key_share: [u8; 32],
    /// Raw QUIC transport parameters extension body.
    pub transport_params: Option<Bytes>,
}

/// Encode a complete ClientHello handshake message.
pub fn encode_client_hello(
    random: &[u8; 32],
    key_share: &[u8; 32],
    transport_params: &[u8],
) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(LEGACY_VERSION);
    body.put_slice(random);
    body.put_u8(0); // legacy_session_id: empty
    body.put_u16(2); // one cipher suite
    body.put_u16(CIPHER_AES_128_GCM_SHA256);
    body.put_u8(1); // legacy compression methods
    body.put_u8(0);

    let mut exts = BytesMut::new();
    put_extension(&mut exts, EXT_SUPPORTED_VERSIONS, |b| {
        b.put_u8(2);
        b.put_u16(TLS_1_3);
    });
    put_extension(&mut exts, EXT_SUPPORTED_GROUPS, |b| {
        b.put_u16(2);
        b.put_u16(GROUP_X25519);
    });
    put_extension(&mut exts, EXT_SIGNATURE_ALGORITHMS, |b| {
        b.put_u16(2);
        b.put_u16(SIGNATURE_ED25519);
    });
    put_extension(&mut exts, EXT_KEY_SHARE, |b| {
        b.put_u16(2 + 2 + 32); // client shares list length
        b.put_u16(GROUP_X25519);
        b.put_u16(32);
        b.put_slice(key_share);
    });
    put_extension(&mut exts, EXT_QUIC_TRANSPORT_PARAMETERS, |b| {
        b.put_slice(transport_params);
    });

    body.put_u16(exts.len() as u16);
    body.put_slice(&exts);

    frame_message(HandshakeType::ClientHello as u8, &body)
}

/// Parse a ClientHello body.
pub fn parse_client_hello(mut body: &[u8]) -> Result<ClientHello> {
    let buf = &mut body;
    if take_u16(buf)? != LEGACY_VERSION {
        return Err(illegal_parameter());
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(take(buf, 32)?);

    let session_id_len = take_u8(buf)? as usize;
    take(buf, session_id_len)?;

    let suites_len = take_u16(buf)? as usize;
    let mut suites = take(buf, suites_len)?;
    let mut cipher_ok = false;
    while suites.len() >= 2 {
        if take_u16(&mut suites)? == CIPHER_AES_128_GCM_SHA256 {
            cipher_ok = true;
        }
    }
    if !cipher_ok {
        return Err(Error::Tls { alert: 0x28, reason: "no shared cipher suite" });
    }

    let compression_len = take_u8(buf)? as usize;
    take(buf, compression_len)?;

    let mut key_share = None;
    let mut transport_params = None;
    let mut version_ok = false;

    let exts_len = take_u16(buf)? as usize;
    let mut exts = take(buf, exts_len)?;
    while !exts.is_empty() {
        let ext_type = take_u16(&mut exts)?;
        let ext_len = take_u16(&mut exts)? as usize;
        let mut ext = take(&mut exts, ext_len)?;
        match ext_type {
            EXT_SUPPORTED_VERSIONS => {
                let list_len = take_u8(&mut ext)? as usize;
                let mut list = take(&mut ext, list_len)?;
                while list.len() >= 2 {
                    if take_u16(&mut list)? == TLS_1_3 {
                        version_ok = true;
                    }
                }
            }
            EXT_KEY_SHARE => {
                let list_len = take_u16(&mut ext)? as usize;
                let mut list = take(&mut ext, list_len)?;
                while !list.is_empty() {
                    let group = take_u16(&mut list)?;
                    let share_len = take_u16(&mut list)? as usize;
                    let share = take(&mut list, share_len)?;
                    if group == GROUP_X25519 && share_len == 32 {
                        let mut ks = [0u8; 32];
                        ks.copy_from_slice(share);
                        key_share = Some(ks);
                    }
                }
            }
            EXT_QUIC_TRANSPORT_PARAMETERS => {
                transport_params = Some(Bytes::copy_from_slice(ext));
            }
            _ => {}
        }
    }

    if !version_ok {
        return Err(Error::Tls { alert: 0x46, reason: "TLS 1.3 not offered" });
    }
    let key_share = key_share.ok_or(Error::Tls { alert: 0x6d, reason: "missing X25519 key share" })?;

    Ok(ClientHello { random, key_share, transport_params })
}

fn put_extension<F: FnOnce(&mut BytesMut)>(out: &mut BytesMut, ext_type: u16, fill: F) {
    out.put_u16(ext_type);
    let mut body = BytesMut::new();
    fill(&mut body);
    out.put_u16(body.len() as u16);
    out.put_slice(&body);
}

// ============================================================================
// ServerHello
// ============================================================================

/// The ServerHello fields the client consumes.
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub random: [u8; 32],
    /// Server's X25519 key share.
    pub key_share: [u8; 32],
}

/// Encode a complete ServerHello handshake message.
pub fn encode_server_hello(random: &[u8; 32], key_share: &[u8; 32]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(LEGACY_VERSION);
    body.put_slice(random);
    body.put_u8(0); // legacy_session_id_echo: empty
    body.put_u16(CIPHER_AES_128_GCM_SHA256);
    body.put_u8(0); // legacy compression

    let mut exts = BytesMut::new();
    put_extension(&mut exts, EXT_SUPPORTED_VERSIONS, |b| {
        b.put_u16(TLS_1_3);
    });
    put_extension(&mut exts, EXT_KEY_SHARE, |b| {
        b.put_u16(GROUP_X25519);
        b.put_u16(32);
        b.put_slice(key_share);
    });

    body.put_u16(exts.len() as u16);
    body.put_slice(&exts);

    frame_message(HandshakeType::ServerHello as u8, &body)
}

/// Parse a ServerHello body.
pub fn parse_server_hello(mut body: &[u8]) -> Result<ServerHello> {
    let buf = &mut body;
    if take_u16(buf)? != LEGACY_VERSION {
        return Err(illegal_parameter());
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(take(buf, 32)?);

    let session_id_len = take_u8(buf)? as usize;
    take(buf, session_id_len)?;

    if take_u16(buf)? != CIPHER_AES_128_GCM_SHA256 {
        return Err(illegal_parameter());
    }
    take_u8(buf)?; // compression

    let mut key_share = None;
    let mut version_ok = false;

    let exts_len = take_u16(buf)? as usize;
    let mut exts = take(buf, exts_len)?;
    while !exts.is_empty() {
        let ext_type = take_u16(&mut exts)?;
        let ext_len = take_u16(&mut exts)? as usize;
        let mut ext = take(&mut exts, ext_len)?;
        match ext_type {
            EXT_SUPPORTED_VERSIONS => {
                version_ok = take_u16(&mut ext)? == TLS_1_3;
            }
            EXT_KEY_SHARE => {
                let group = take_u16(&mut ext)?;
                let share_len = take_u16(&mut ext)? as usize;
                let share = take(&mut ext, share_len)?;
                if group == GROUP_X25519 && share_len == 32 {
                    let mut ks = [0u8; 32];
                    ks.copy_from_slice(share);
                    key_share = Some(ks);
                }
            }
            _ => {}
        }
    }

    if !version_ok {
        return Err(Error::Tls { alert: 0x46, reason: "server did not select TLS 1.3" });
    }
    let key_share =
        key_share.ok_or(Error::Tls { alert: 0x2f, reason: "missing server key share" })?;

    Ok(ServerHello { random, key_share })
}

// ============================================================================
// EncryptedExtensions, Certificate, CertificateVerify, Finished
// ============================================================================

/// Encode EncryptedExtensions carrying the QUIC transport parameters.
pub fn encode_encrypted_extensions(transport_params: &[u8]) -> Bytes {
    let mut exts = BytesMut::new();
    put_extension(&mut exts, EXT_QUIC_TRANSPORT_PARAMETERS, |b| {
        b.put_slice(transport_params);
    });

    let mut body = BytesMut::new();
    body.put_u16(exts.len() as u16);
    body.put_slice(&exts);
    frame_message(HandshakeType::EncryptedExtensions as u8, &body)
}

/// Parse EncryptedExtensions, returning the raw transport parameters.
pub fn parse_encrypted_extensions(mut body: &[u8]) -> Result<Option<Bytes>> {
    let buf = &mut body;
    let exts_len = take_u16(buf)? as usize;
    let mut exts = take(buf, exts_len)?;
    let mut transport_params = None;
    while !exts.is_empty() {
        let ext_type = take_u16(&mut exts)?;
        let ext_len = take_u16(&mut exts)? as usize;
        let ext = take(&mut exts, ext_len)?;
        if ext_type == EXT_QUIC_TRANSPORT_PARAMETERS {
            transport_params = Some(Bytes::copy_from_slice(ext));
        }
    }
    Ok(transport_params)
}

/// Encode a Certificate message from a DER chain, leaf first.
pub fn encode_certificate(chain: &[Bytes]) -> Bytes {
    let mut list = BytesMut::new();
    for cert in chain {
        list.put_u8((cert.len() >> 16) as u8);
        list.put_u8((cert.len() >> 8) as u8);
        list.put_u8(cert.len() as u8);
        list.put_slice(cert);
        list.put_u16(0); // no per-certificate extensions
    }

    let mut body = BytesMut::new();
    body.put_u8(0); // empty certificate_request_context
    body.put_u8((list.len() >> 16) as u8);
    body.put_u8((list.len() >> 8) as u8);
    body.put_u8(list.len() as u8);
    body.put_slice(&list);
    frame_message(HandshakeType::Certificate as u8, &body)
}

/// Parse a Certificate message into the DER chain, leaf first.
pub fn parse_certificate(mut body: &[u8]) -> Result<Vec<Bytes>> {
    let buf = &mut body;
    let context_len = take_u8(buf)? as usize;
    take(buf, context_len)?;

    let list_len = take_u24(buf)?;
    let mut list = take(buf, list_len)?;
    let mut chain = Vec::new();
    while !list.is_empty() {
        let cert_len = take_u24(&mut list)?;
        let cert = take(&mut list, cert_len)?;
        chain.push(Bytes::copy_from_slice(cert));
        let ext_len = take_u16(&mut list)? as usize;
        take(&mut list, ext_len)?;
    }
    if chain.is_empty() {
        return Err(Error::Tls { alert: 0x2a, reason: "empty certificate chain" });
    }
    Ok(chain)
}

/// Encode a CertificateVerify with an Ed25519 signature.
pub fn encode_certificate_verify(signature: &[u8; 64]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(SIGNATURE_ED25519);
    body.put_u16(64);
    body.put_slice(signature);
    frame_message(HandshakeType::CertificateVerify as u8, &body)
}

/// Parse a CertificateVerify into `(algorithm, signature)`.
pub fn parse_certificate_verify(mut body: &[u8]) -> Result<(u16, Bytes)> {
    let buf = &mut body;
    let algorithm = take_u16(buf)?;
    let sig_len = take_u16(buf)? as usize;
    let signature = take(buf, sig_len)?;
    Ok((algorithm, Bytes::copy_from_slice(signature)))
}

/// Encode a Finished message.
pub fn encode_finished(verify_data: &[u8; 32]) -> Bytes {
    frame_message(HandshakeType::Finished as u8, verify_data)
}

/// Parse a Finished body into its verify_data.
pub fn parse_finished(body: &[u8]) -> Result<[u8; 32]> {
    if body.len() != 32 {
        return Err(decode_error());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_round_trip() {
        let random = [0x11; 32];
        let key_share = [0x22; 32];
        let msg = encode_client_hello(&random, &key_share, b"params");

        let mut buf = BytesMut::from(&msg[..]);
        let (ty, full, body) = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(ty, HandshakeType::ClientHello as u8);
        assert_eq!(full, msg);
        assert!(buf.is_empty());

        let ch = parse_client_hello(&body).unwrap();
        assert_eq!(ch.random, random);
        assert_eq!(ch.key_share, key_share);
        assert_eq!(ch.transport_params.as_deref(), Some(&b"params"[..]));
    }

    #[test]
    fn server_hello_round_trip() {
        let msg = encode_server_hello(&[0x33; 32], &[0x44; 32]);
        let mut buf = BytesMut::from(&msg[..]);
        let (ty, _, body) = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(ty, HandshakeType::ServerHello as u8);
        let sh = parse_server_hello(&body).unwrap();
        assert_eq!(sh.random, [0x33; 32]);
        assert_eq!(sh.key_share, [0x44; 32]);
    }

    #[test]
    fn certificate_round_trip() {
        let chain = vec![Bytes::from_static(b"leaf-cert"), Bytes::from_static(b"root-cert")];
        let msg = encode_certificate(&chain);
        let mut buf = BytesMut::from(&msg[..]);
        let (_, _, body) = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(parse_certificate(&body).unwrap(), chain);
    }

    #[test]
    fn finished_round_trip() {
        let msg = encode_finished(&[0x55; 32]);
        let mut buf = BytesMut::from(&msg[..]);
        let (ty, _, body) = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(ty, HandshakeType::Finished as u8);
        assert_eq!(parse_finished(&body).unwrap(), [0x55; 32]);
    }

    #[test]
    fn partial_message_waits_for_more_bytes() {
        let msg = encode_server_hello(&[0x33; 32], &[0x44; 32]);
        let mut buf = BytesMut::from(&msg[..msg.len() - 1]);
        assert!(next_message(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&msg[msg.len() - 1..]);
        assert!(next_message(&mut buf).unwrap().is_some());
    }

    #[test]
    fn encrypted_extensions_round_trip() {
        let msg = encode_encrypted_extensions(b"tp-bytes");
        let mut buf = BytesMut::from(&msg[..]);
        let (_, _, body) = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(parse_encrypted_extensions(&body).unwrap().as_deref(), Some(&b"tp-bytes"[..]));
    }
}
