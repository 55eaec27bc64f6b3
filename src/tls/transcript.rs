//! Running transcript hash over TLS handshake messages.

use sha2::{Digest, Sha256};

/// Running SHA-256 over every handshake message exchanged so far.
/// Intermediate hashes are taken by cloning the state.
#[derive(Clone)]
pub struct TranscriptHash {
    hasher: Sha256,
}

impl TranscriptHash {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    /// Feed a complete handshake message (header included).
    pub fn update(&mut self, message: &[u8]) {
        self.hasher.update(message);
    }

    /// Current hash without consuming the state.
    pub fn current(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.hasher.clone().finalize());
        out
    }
}

impl Default for TranscriptHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_does_not_consume() {
        let mut t = TranscriptHash::new();
        t.update(b"client hello");
        assert_eq!(t.current(), t.current());

        let before = t.current();
        t.update(b"server hello");
        assert_ne!(before, t.current());
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut t = TranscriptHash::new();
        t.update(b"hello ");
        t.update(b"world");

        let mut h = Sha256::new();
        h.update(b"hello world");
        let mut expected = [0u8; 32];
        expected.copy_from_slice(&h.finalize());
        assert_eq!(t.current(), expected);
    }
}
