//! Initial packet protection keys.
//!
//! Initial keys are deterministic: both endpoints derive them from the
//! client's destination connection ID and the per-version initial salt,
//! so the very first packets can be protected before any TLS exchange.

use super::{Aead, DirectionalKeys};
use crate::tls::key_schedule::{derive_packet_keys, hkdf_expand_label};
use crate::types::{ConnectionId, Side};
use hkdf::Hkdf;
use sha2::Sha256;

/// Initial salt for draft-18 (shared by drafts 17 through 20).
pub const INITIAL_SALT: [u8; 20] = [
    0xef, 0x4f, 0xb0, 0xab, 0xb4, 0x74, 0x70, 0xc4, 0x1b, 0xef, 0xcf, 0x80, 0x31, 0x33, 0x4f,
    0xae, 0x48, 0x5e, 0x09, 0xa0,
];

/// Derive the Initial AEAD for one side of a connection.
///
/// `cid` is the destination connection ID of the client's first Initial
/// packet. The client writes with the "client in" secret and reads with
/// "server in"; the server is the mirror image.
pub fn initial_aead(cid: &ConnectionId, side: Side) -> Aead {
    let (_, hk) = Hkdf::<Sha256>::extract(Some(&INITIAL_SALT), cid.as_bytes());

    let mut client_secret = [0u8; 32];
    let mut server_secret = [0u8; 32];
    hkdf_expand_label(&hk, b"client in", &[], &mut client_secret);
    hkdf_expand_label(&hk, b"server in", &[], &mut server_secret);

    let client_keys = keys_from_secret(&client_secret);
    let server_keys = keys_from_secret(&server_secret);

    match side {
        Side::Client => Aead::new(client_keys, server_keys),
        Side::Server => Aead::new(server_keys, client_keys),
    }
}

fn keys_from_secret(secret: &[u8; 32]) -> DirectionalKeys {
    let (key, iv, _hp) = derive_packet_keys(secret);
    DirectionalKeys { key, iv }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_matching_keys() {
        let cid = ConnectionId::from_slice(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08])
            .unwrap();
        let client = initial_aead(&cid, Side::Client);
        let server = initial_aead(&cid, Side::Server);

        let sealed = client.seal(1, b"hdr", b"client hello");
        assert_eq!(server.open(1, b"hdr", &sealed).unwrap(), b"client hello");

        let sealed = server.seal(1, b"hdr", b"server hello");
        assert_eq!(client.open(1, b"hdr", &sealed).unwrap(), b"server hello");
    }

    #[test]
    fn different_cids_give_different_keys() {
        let a = ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap();
        let b = ConnectionId::from_slice(&[5, 6, 7, 8]).unwrap();
        let client = initial_aead(&a, Side::Client);
        let server = initial_aead(&b, Side::Server);

        let sealed = client.seal(1, b"hdr", b"data");
        assert!(server.open(1, b"hdr", &sealed).is_err());
    }
}
