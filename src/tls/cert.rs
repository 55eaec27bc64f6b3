//! Certificate handling: Ed25519 CertificateVerify signatures, public
//! key extraction from DER certificates, and the chain-validation
//! capability handed to the client.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Context string for the server CertificateVerify (RFC 8446 §4.4.3).
const SERVER_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";

/// Ed25519 OID (1.3.101.112) in DER: 06 03 2b 65 70.
const ED25519_OID: &[u8] = &[0x06, 0x03, 0x2b, 0x65, 0x70];

fn bad_certificate(reason: &'static str) -> Error {
    Error::Tls { alert: 0x2a, reason }
}

/// Capability that validates a peer certificate chain (DER, leaf first).
///
/// Chain building and trust-anchor policy live outside the endpoint
/// core; the TLS session only hands the chain over and maps a rejection
/// to a fatal TLS error.
pub trait CertificateValidator: Send {
    fn validate(&self, chain: &[Bytes]) -> Result<()>;
}

/// Validator that accepts any chain. For tests and closed deployments.
pub struct NoopCertificateValidator;

impl CertificateValidator for NoopCertificateValidator {
    fn validate(&self, _chain: &[Bytes]) -> Result<()> {
        Ok(())
    }
}

/// Build the CertificateVerify signed content (RFC 8446 §4.4.3):
/// 64 spaces, the context string, a zero byte, then the transcript hash.
fn signed_content(transcript_hash: &[u8; 32]) -> Vec<u8> {
    let mut content = Vec::with_capacity(64 + SERVER_CONTEXT.len() + 1 + 32);
    content.extend_from_slice(&[0x20; 64]);
    content.extend_from_slice(SERVER_CONTEXT);
    content.push(0x00);
    content.extend_from_slice(transcript_hash);
    content
}

/// Sign the server CertificateVerify content with an Ed25519 seed.
pub fn sign_certificate_verify(seed: &[u8; 32], transcript_hash: &[u8; 32]) -> [u8; 64] {
    use ed25519_dalek::{Signer, SigningKey};
    let key = SigningKey::from_bytes(seed);
    key.sign(&signed_content(transcript_hash)).to_bytes()
}

/// Verify a server CertificateVerify signature against the public key
/// taken from the leaf certificate.
pub fn verify_certificate_verify(
    leaf_cert: &[u8],
    signature: &[u8],
    transcript_hash: &[u8; 32],
) -> Result<()> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let public_key = extract_ed25519_public_key(leaf_cert)?;
    let key = VerifyingKey::from_bytes(&public_key)
        .map_err(|_| bad_certificate("invalid Ed25519 public key"))?;

    if signature.len() != 64 {
        return Err(Error::Tls { alert: 0x33, reason: "bad CertificateVerify signature length" });
    }
    let mut sig = [0u8; 64];
    sig.copy_from_slice(signature);

    key.verify(&signed_content(transcript_hash), &Signature::from_bytes(&sig))
        .map_err(|_| Error::Tls { alert: 0x33, reason: "CertificateVerify signature mismatch" })
}

/// Extract an Ed25519 public key from a DER certificate.
///
/// Minimal ASN.1 scan: locate the Ed25519 algorithm OID inside the
/// SubjectPublicKeyInfo and read the BIT STRING that follows it.
pub fn extract_ed25519_public_key(cert_der: &[u8]) -> Result<[u8; 32]> {
    let oid_pos = find_subsequence(cert_der, ED25519_OID)
        .ok_or_else(|| bad_certificate("certificate key is not Ed25519"))?;

    // After the OID: BIT STRING tag (0x03), length 0x21, unused-bits 0x00,
    // then the 32-byte key. A small window tolerates the enclosing
    // SEQUENCE ending between the two.
    let tail = &cert_der[oid_pos + ED25519_OID.len()..];
    for i in 0..tail.len().min(4) {
        if tail[i..].len() >= 35 && tail[i] == 0x03 && tail[i + 1] == 0x21 && tail[i + 2] == 0x00 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&tail[i + 3..i + 35]);
            return Ok(key);
        }
    }
    Err(bad_certificate("malformed SubjectPublicKeyInfo"))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Build a minimal DER certificate shell around an Ed25519 public key.
///
/// Not a standards-complete X.509 encoder: it produces exactly the
/// SubjectPublicKeyInfo structure `extract_ed25519_public_key` reads,
/// wrapped in an outer SEQUENCE. Used by tests and closed deployments
/// where the validator does not inspect issuer fields.
pub fn build_ed25519_certificate(public_key: &[u8; 32]) -> Bytes {
    let mut spki = BytesMut::new();
    // AlgorithmIdentifier SEQUENCE { OID 1.3.101.112 }
    spki.put_u8(0x30);
    spki.put_u8(ED25519_OID.len() as u8);
    spki.put_slice(ED25519_OID);
    // subjectPublicKey BIT STRING
    spki.put_u8(0x03);
    spki.put_u8(0x21);
    spki.put_u8(0x00);
    spki.put_slice(public_key);

    let mut cert = BytesMut::new();
    cert.put_u8(0x30); // outer SEQUENCE
    cert.put_u8((2 + spki.len()) as u8);
    cert.put_u8(0x30); // SubjectPublicKeyInfo SEQUENCE
    cert.put_u8(spki.len() as u8);
    cert.put_slice(&spki);
    cert.freeze()
}

/// Derive the Ed25519 public key for a 32-byte seed.
pub fn public_key_from_seed(seed: &[u8; 32]) -> [u8; 32] {
    use ed25519_dalek::SigningKey;
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}
