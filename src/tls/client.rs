//! Client-side TLS 1.3 session.
//!
//! ```text
//! start_handshake          -> ClientHello bytes
//! handle_server_hello      -> Handshake AEAD
//! handle_handshake (EE, Certificate, CertificateVerify, Finished)
//!                          -> client Finished bytes + 1-RTT AEAD
//! reset                    -> discard everything (Retry)
//! ```

use super::cert::{verify_certificate_verify, CertificateValidator};
use super::key_schedule::{
    derive_finished_key, finished_verify_data, traffic_aead, KeySchedule,
};
use super::messages::{self, HandshakeType};
use super::transcript::TranscriptHash;
use crate::crypto::Aead;
use crate::error::{Error, Result};
use crate::transport::TransportParameters;
use crate::version::Version;
use bytes::{Bytes, BytesMut};
use rand::RngCore;
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};

/// Yielded once the server Finished has been consumed.
pub struct HandshakeResult {
    /// Client Finished handshake message, to be sent in a CRYPTO frame.
    pub finished: Bytes,
    /// 1-RTT AEAD.
    pub one_rtt: Aead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Fresh,
    WaitServerHello,
    WaitEncryptedExtensions,
    WaitCertificate,
    WaitCertificateVerify,
    WaitFinished,
    Complete,
}

pub struct ClientTlsSession {
    version: Version,
    params: TransportParameters,
    validator: Arc<dyn CertificateValidator>,

    state: ClientState,
    secret: StaticSecret,
    transcript: TranscriptHash,
    key_schedule: KeySchedule,

    client_hs_secret: [u8; 32],
    server_hs_secret: [u8; 32],

    recv_buffer: BytesMut,
    certificate_chain: Vec<Bytes>,
    peer_params: Option<TransportParameters>,
}

impl ClientTlsSession {
    pub fn new(
        version: Version,
        params: TransportParameters,
        validator: Arc<dyn CertificateValidator>,
    ) -> Self {
        Self {
            version,
            params,
            validator,
            state: ClientState::Fresh,
            secret: StaticSecret::random_from_rng(rand::thread_rng()),
            transcript: TranscriptHash::new(),
            key_schedule: KeySchedule::new(),
            client_hs_secret: [0u8; 32],
            server_hs_secret: [0u8; 32],
            recv_buffer: BytesMut::new(),
            certificate_chain: Vec::new(),
            peer_params: None,
        }
    }

    /// Build the ClientHello. Valid exactly once per session.
    pub fn start_handshake(&mut self) -> Result<Bytes> {
        if self.state != ClientState::Fresh {
            return Err(Error::InvalidState);
        }

        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);

        let key_share = PublicKey::from(&self.secret).to_bytes();
        let tp = self.params.encode_for_client_hello(self.version);
        let hello = messages::encode_client_hello(&random, &key_share, &tp);

        self.transcript.update(&hello);
        self.state = ClientState::WaitServerHello;
        Ok(hello)
    }

    /// Consume the ServerHello, deriving the Handshake AEAD.
    pub fn handle_server_hello(&mut self, data: &[u8]) -> Result<Aead> {
        if self.state != ClientState::WaitServerHello {
            return Err(Error::InvalidState);
        }

        let mut buf = BytesMut::from(data);
        let (msg_type, full, body) = messages::next_message(&mut buf)?
            .ok_or(Error::Tls { alert: 0x32, reason: "truncated ServerHello" })?;
        if msg_type != HandshakeType::ServerHello as u8 {
            return Err(Error::Tls { alert: 0x0a, reason: "expected ServerHello" });
        }

        let hello = messages::parse_server_hello(&body)?;
        self.transcript.update(&full);

        let shared = self.secret.diffie_hellman(&PublicKey::from(hello.key_share));
        self.key_schedule.derive_handshake_secret(shared.as_bytes());

        let hash = self.transcript.current();
        let (client_hs, server_hs) = self.key_schedule.handshake_traffic_secrets(&hash);
        self.client_hs_secret = client_hs;
        self.server_hs_secret = server_hs;

        self.state = ClientState::WaitEncryptedExtensions;
        Ok(traffic_aead(&client_hs, &server_hs))
    }

    /// Consume server handshake-level CRYPTO bytes. Returns the client
    /// Finished and the 1-RTT AEAD once the server Finished has been
    /// verified; `None` while the flight is still incomplete.
    pub fn handle_handshake(&mut self, data: &[u8]) -> Result<Option<HandshakeResult>> {
        match self.state {
            ClientState::WaitEncryptedExtensions
            | ClientState::WaitCertificate
            | ClientState::WaitCertificateVerify
            | ClientState::WaitFinished => {}
            _ => return Err(Error::InvalidState),
        }

        self.recv_buffer.extend_from_slice(data);

        while let Some((msg_type, full, body)) = messages::next_message(&mut self.recv_buffer)? {
            match (self.state, msg_type) {
                (ClientState::WaitEncryptedExtensions, t)
                    if t == HandshakeType::EncryptedExtensions as u8 =>
                {
                    if let Some(tp) = messages::parse_encrypted_extensions(&body)? {
                        let (_, params) =
                            TransportParameters::decode_from_encrypted_extensions(&tp)?;
                        self.peer_params = Some(params);
                    }
                    self.transcript.update(&full);
                    self.state = ClientState::WaitCertificate;
                }
                (ClientState::WaitCertificate, t) if t == HandshakeType::Certificate as u8 => {
                    let chain = messages::parse_certificate(&body)?;
                    self.validator.validate(&chain)?;
                    self.certificate_chain = chain;
                    self.transcript.update(&full);
                    self.state = ClientState::WaitCertificateVerify;
                }
                (ClientState::WaitCertificateVerify, t)
                    if t == HandshakeType::CertificateVerify as u8 =>
                {
                    let (algorithm, signature) = messages::parse_certificate_verify(&body)?;
                    if algorithm != messages::SIGNATURE_ED25519 {
                        return Err(Error::Tls {
                            alert: 0x2f,
                            reason: "unsupported CertificateVerify algorithm",
                        });
                    }
                    // The signature covers the transcript up to Certificate.
                    let hash = self.transcript.current();
                    verify_certificate_verify(&self.certificate_chain[0], &signature, &hash)?;
                    self.transcript.update(&full);
                    self.state = ClientState::WaitFinished;
                }
                (ClientState::WaitFinished, t) if t == HandshakeType::Finished as u8 => {
                    let received = messages::parse_finished(&body)?;
                    let finished_key = derive_finished_key(&self.server_hs_secret);
                    let expected = finished_verify_data(&finished_key, &self.transcript.current());
                    if received != expected {
                        return Err(Error::Tls {
                            alert: 0x33,
                            reason: "server Finished verification failed",
                        });
                    }
                    self.transcript.update(&full);
                    return Ok(Some(self.complete()));
                }
                (_, t) => {
                    tracing::warn!(msg_type = t, "unexpected handshake message");
                    return Err(Error::Tls { alert: 0x0a, reason: "unexpected handshake message" });
                }
            }
        }

        Ok(None)
    }

    fn complete(&mut self) -> HandshakeResult {
        // Application secrets cover CH..server Finished.
        self.key_schedule.derive_master_secret();
        let hash = self.transcript.current();
        let (client_app, server_app) = self.key_schedule.app_traffic_secrets(&hash);

        // The client Finished also covers CH..server Finished.
        let finished_key = derive_finished_key(&self.client_hs_secret);
        let verify = finished_verify_data(&finished_key, &hash);
        let finished = messages::encode_finished(&verify);
        self.transcript.update(&finished);

        self.state = ClientState::Complete;
        HandshakeResult { finished, one_rtt: traffic_aead(&client_app, &server_app) }
    }

    /// Discard all handshake state. Used when a Retry forces the client
    /// to start over; a fresh key share is generated.
    pub fn reset(&mut self) {
        self.state = ClientState::Fresh;
        self.secret = StaticSecret::random_from_rng(rand::thread_rng());
        self.transcript = TranscriptHash::new();
        self.key_schedule = KeySchedule::new();
        self.client_hs_secret = [0u8; 32];
        self.server_hs_secret = [0u8; 32];
        self.recv_buffer.clear();
        self.certificate_chain.clear();
        self.peer_params = None;
    }

    /// The peer's transport parameters, available once
    /// EncryptedExtensions has been processed.
    pub fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::NoopCertificateValidator;

    fn session() -> ClientTlsSession {
        ClientTlsSession::new(
            Version::DRAFT_18,
            TransportParameters::default(),
            Arc::new(NoopCertificateValidator),
        )
    }

    #[test]
    fn start_handshake_only_once() {
        let mut tls = session();
        let hello = tls.start_handshake().unwrap();
        assert_eq!(hello[0], HandshakeType::ClientHello as u8);
        assert_eq!(tls.start_handshake(), Err(Error::InvalidState));
    }

    #[test]
    fn reset_allows_new_handshake() {
        let mut tls = session();
        let first = tls.start_handshake().unwrap();
        tls.reset();
        let second = tls.start_handshake().unwrap();
        // New key share and random: the hellos differ.
        assert_ne!(first, second);
    }

    #[test]
    fn server_hello_out_of_order_is_rejected() {
        let mut tls = session();
        assert!(matches!(tls.handle_server_hello(b"junk"), Err(Error::InvalidState)));
    }
}
