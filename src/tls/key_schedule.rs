//! TLS 1.3 key schedule (RFC 8446 section 7.1) and the QUIC packet-key
//! derivations layered on it.
//!
//! ```text
//!             0
//!             |
//!             v
//!   PSK ->  HKDF-Extract = Early Secret
//!             |
//!             v
//!   ECDHE -> HKDF-Extract = Handshake Secret
//!             |
//!             +-> Derive-Secret(., "c hs traffic", CH..SH)
//!             +-> Derive-Secret(., "s hs traffic", CH..SH)
//!             |
//!             v
//!     0  ->  HKDF-Extract = Master Secret
//!             |
//!             +-> Derive-Secret(., "c ap traffic", CH..SF)
//!             +-> Derive-Secret(., "s ap traffic", CH..SF)
//! ```

use crate::crypto::{Aead, DirectionalKeys};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// HKDF-Expand-Label (RFC 8446 section 7.1) against an extracted PRK.
///
/// Builds the HkdfLabel structure ("tls13 " prefix, label, context) and
/// expands it to `out.len()` bytes.
pub fn hkdf_expand_label(hk: &Hkdf<Sha256>, label: &[u8], context: &[u8], out: &mut [u8]) {
    let mut info = Vec::with_capacity(4 + 6 + label.len() + context.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    hk.expand(&info, out).expect("output length within HKDF bounds");
}

/// HKDF-Expand-Label with a raw 32-byte secret as the PRK.
pub fn expand_label(secret: &[u8], label: &[u8], context: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::from_prk(secret).expect("secret is a full-length PRK");
    hkdf_expand_label(&hk, label, context, out);
}

/// Derive QUIC packet protection material from a traffic secret:
/// AEAD key ("quic key"), IV ("quic iv") and the header protection key
/// ("quic hp"). Applying header protection is the datagram layer's
/// concern; the key is derived here so the full material for a level
/// comes from one place.
pub fn derive_packet_keys(secret: &[u8; 32]) -> ([u8; 16], [u8; 12], [u8; 16]) {
    let mut key = [0u8; 16];
    let mut iv = [0u8; 12];
    let mut hp = [0u8; 16];
    expand_label(secret, b"quic key", &[], &mut key);
    expand_label(secret, b"quic iv", &[], &mut iv);
    expand_label(secret, b"quic hp", &[], &mut hp);
    (key, iv, hp)
}

/// Build an AEAD pair from a pair of traffic secrets.
pub fn traffic_aead(write_secret: &[u8; 32], read_secret: &[u8; 32]) -> Aead {
    let (wk, wi, _) = derive_packet_keys(write_secret);
    let (rk, ri, _) = derive_packet_keys(read_secret);
    Aead::new(DirectionalKeys { key: wk, iv: wi }, DirectionalKeys { key: rk, iv: ri })
}

/// Derive a Finished key from a handshake traffic secret.
pub fn derive_finished_key(traffic_secret: &[u8; 32]) -> [u8; 32] {
    let mut key = [0u8; 32];
    expand_label(traffic_secret, b"finished", &[], &mut key);
    key
}

/// Finished verify_data = HMAC-SHA256(finished_key, transcript_hash).
pub fn finished_verify_data(finished_key: &[u8; 32], transcript_hash: &[u8; 32]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(finished_key).expect("HMAC accepts 32-byte keys");
    mac.update(transcript_hash);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn empty_transcript_hash() -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::new().finalize());
    out
}

/// TLS 1.3 key schedule state, SHA-256 suite.
pub struct KeySchedule {
    early_secret: [u8; 32],
    handshake_secret: [u8; 32],
    master_secret: [u8; 32],
}

impl KeySchedule {
    /// Initialize with no PSK: Early Secret = HKDF-Extract(0, 0).
    pub fn new() -> Self {
        let zeros = [0u8; 32];
        let (prk, _) = Hkdf::<Sha256>::extract(Some(&zeros), &zeros);
        let mut early_secret = [0u8; 32];
        early_secret.copy_from_slice(&prk);
        Self { early_secret, handshake_secret: [0u8; 32], master_secret: [0u8; 32] }
    }

    /// Mix in the ECDHE shared secret:
    /// Handshake Secret = HKDF-Extract(Derive-Secret(Early, "derived", ""), ECDHE).
    pub fn derive_handshake_secret(&mut self, shared_secret: &[u8]) {
        let mut salt = [0u8; 32];
        expand_label(&self.early_secret, b"derived", &empty_transcript_hash(), &mut salt);
        let (prk, _) = Hkdf::<Sha256>::extract(Some(&salt), shared_secret);
        self.handshake_secret.copy_from_slice(&prk);
    }

    /// Client and server handshake traffic secrets over
    /// Transcript-Hash(CH..SH).
    pub fn handshake_traffic_secrets(&self, transcript_hash: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        let mut client = [0u8; 32];
        let mut server = [0u8; 32];
        expand_label(&self.handshake_secret, b"c hs traffic", transcript_hash, &mut client);
        expand_label(&self.handshake_secret, b"s hs traffic", transcript_hash, &mut server);
        (client, server)
    }

    /// Master Secret = HKDF-Extract(Derive-Secret(HS, "derived", ""), 0).
    pub fn derive_master_secret(&mut self) {
        let mut salt = [0u8; 32];
        expand_label(&self.handshake_secret, b"derived", &empty_transcript_hash(), &mut salt);
        let zeros = [0u8; 32];
        let (prk, _) = Hkdf::<Sha256>::extract(Some(&salt), &zeros);
        self.master_secret.copy_from_slice(&prk);
    }

    /// Client and server application traffic secrets over
    /// Transcript-Hash(CH..server Finished).
    pub fn app_traffic_secrets(&self, transcript_hash: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        let mut client = [0u8; 32];
        let mut server = [0u8; 32];
        expand_label(&self.master_secret, b"c ap traffic", transcript_hash, &mut client);
        expand_label(&self.master_secret, b"s ap traffic", transcript_hash, &mut server);
        (client, server)
    }
}

impl Default for KeySchedule {
    fn default() -> Self {
        Self::new()
    }
}
