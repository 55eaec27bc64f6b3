//! Packet protection primitives: encryption levels, the AES-128-GCM
//! AEAD pair used per level, and the per-connection AEAD set.

pub mod initial;

use crate::error::{Error, Result};
use crate::types::PacketNumber;
use aes_gcm::aead::{Aead as _, Payload};
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};

/// Encryption levels. Each has its own packet-number space and AEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    OneRtt,
}

/// Key and IV protecting one direction of one encryption level.
#[derive(Clone)]
pub struct DirectionalKeys {
    pub key: [u8; 16],
    pub iv: [u8; 12],
}

/// AEAD pair for one encryption level: keys for what we send and keys
/// for what the peer sends.
#[derive(Clone)]
pub struct Aead {
    write: DirectionalKeys,
    read: DirectionalKeys,
}

impl Aead {
    pub fn new(write: DirectionalKeys, read: DirectionalKeys) -> Self {
        Self { write, read }
    }

    /// Seal a payload. The packet number seeds the nonce; the packet
    /// header bytes are the associated data.
    pub fn seal(&self, packet_number: PacketNumber, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes128Gcm::new_from_slice(&self.write.key).expect("fixed 16-byte key");
        let nonce = nonce_for(&self.write.iv, packet_number);
        cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .expect("AES-GCM encryption is infallible for in-memory buffers")
    }

    /// Open a sealed payload.
    pub fn open(
        &self,
        packet_number: PacketNumber,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let cipher = Aes128Gcm::new_from_slice(&self.read.key).expect("fixed 16-byte key");
        let nonce = nonce_for(&self.read.iv, packet_number);
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| Error::DecryptionFailure)
    }
}

/// Nonce = IV xor the packet number in the low 8 bytes.
fn nonce_for(iv: &[u8; 12], packet_number: PacketNumber) -> [u8; 12] {
    let mut nonce = *iv;
    for (i, byte) in packet_number.to_be_bytes().iter().enumerate() {
        nonce[4 + i] ^= byte;
    }
    nonce
}

/// The per-connection AEAD set, one slot per encryption level.
///
/// The Initial AEAD is deterministic from the connection ID and present
/// from construction; Handshake and 1-RTT slots fill exactly once as the
/// TLS session derives them.
pub struct AeadSet {
    initial: Aead,
    handshake: Option<Aead>,
    one_rtt: Option<Aead>,
}

impl AeadSet {
    pub fn new(initial: Aead) -> Self {
        Self { initial, handshake: None, one_rtt: None }
    }

    /// Replace the Initial AEAD. Only valid while no later level is
    /// installed (the client Retry path).
    pub fn reset_initial(&mut self, initial: Aead) -> Result<()> {
        if self.handshake.is_some() || self.one_rtt.is_some() {
            return Err(Error::InvalidState);
        }
        self.initial = initial;
        Ok(())
    }

    pub fn set_handshake(&mut self, aead: Aead) -> Result<()> {
        if self.handshake.is_some() {
            return Err(Error::InvalidState);
        }
        self.handshake = Some(aead);
        Ok(())
    }

    pub fn set_one_rtt(&mut self, aead: Aead) -> Result<()> {
        if self.one_rtt.is_some() {
            return Err(Error::InvalidState);
        }
        self.one_rtt = Some(aead);
        Ok(())
    }

    pub fn available(&self, level: EncryptionLevel) -> bool {
        match level {
            EncryptionLevel::Initial => true,
            EncryptionLevel::Handshake => self.handshake.is_some(),
            EncryptionLevel::OneRtt => self.one_rtt.is_some(),
        }
    }

    pub fn get(&self, level: EncryptionLevel) -> Result<&Aead> {
        match level {
            EncryptionLevel::Initial => Ok(&self.initial),
            EncryptionLevel::Handshake => self.handshake.as_ref().ok_or(Error::InvalidState),
            EncryptionLevel::OneRtt => self.one_rtt.as_ref().ok_or(Error::InvalidState),
        }
    }

    /// The highest level with an installed AEAD; outbound application
    /// frames always use this.
    pub fn highest_level(&self) -> EncryptionLevel {
        if self.one_rtt.is_some() {
            EncryptionLevel::OneRtt
        } else if self.handshake.is_some() {
            EncryptionLevel::Handshake
        } else {
            EncryptionLevel::Initial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_aead() -> Aead {
        let write = DirectionalKeys { key: [1; 16], iv: [2; 12] };
        let read = DirectionalKeys { key: [1; 16], iv: [2; 12] };
        Aead::new(write, read)
    }

    #[test]
    fn seal_open_round_trip() {
        let aead = test_aead();
        let sealed = aead.seal(7, b"header", b"payload");
        assert_ne!(&sealed[..7.min(sealed.len())], b"payload");
        let opened = aead.open(7, b"header", &sealed).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn open_rejects_wrong_packet_number() {
        let aead = test_aead();
        let sealed = aead.seal(7, b"header", b"payload");
        assert_eq!(aead.open(8, b"header", &sealed), Err(Error::DecryptionFailure));
    }

    #[test]
    fn open_rejects_tampered_aad() {
        let aead = test_aead();
        let sealed = aead.seal(7, b"header", b"payload");
        assert_eq!(aead.open(7, b"headex", &sealed), Err(Error::DecryptionFailure));
    }

    #[test]
    fn aead_set_is_monotonic() {
        let mut set = AeadSet::new(test_aead());
        assert_eq!(set.highest_level(), EncryptionLevel::Initial);

        set.set_handshake(test_aead()).unwrap();
        assert_eq!(set.highest_level(), EncryptionLevel::Handshake);
        assert!(set.set_handshake(test_aead()).is_err());

        // Initial can no longer be replaced once a later level exists.
        assert!(set.reset_initial(test_aead()).is_err());

        set.set_one_rtt(test_aead()).unwrap();
        assert_eq!(set.highest_level(), EncryptionLevel::OneRtt);
        assert!(set.available(EncryptionLevel::OneRtt));
    }
}
