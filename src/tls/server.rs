//! Server-side TLS 1.3 session.
//!
//! The whole server flight is produced in one step: consuming the
//! ClientHello yields the ServerHello (sent at the Initial level), the
//! Handshake AEAD, the EncryptedExtensions..Finished flight (sent at the
//! Handshake level) and the 1-RTT AEAD. The session then waits for the
//! client Finished.

use super::cert::sign_certificate_verify;
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
use x25519_dalek::{PublicKey, StaticSecret};

/// Everything the server emits in response to a ClientHello.
pub struct ServerHelloAndHandshake {
    /// ServerHello message, sent in an Initial packet.
    pub server_hello: Bytes,
    /// Handshake-level AEAD, installed after the ServerHello is sent.
    pub handshake_aead: Aead,
    /// EncryptedExtensions, Certificate, CertificateVerify and Finished,
    /// sent in a Handshake packet.
    pub server_handshake: Bytes,
    /// 1-RTT AEAD, installed after the flight is sent.
    pub one_rtt_aead: Aead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    WaitClientHello,
    WaitClientFinished,
    Complete,
}

pub struct ServerTlsSession {
    version: Version,
    params: TransportParameters,
    certificate_chain: Vec<Bytes>,
    private_key: [u8; 32],

    state: ServerState,
    transcript: TranscriptHash,
    key_schedule: KeySchedule,

    client_hs_secret: [u8; 32],
    client_finished_transcript: [u8; 32],

    peer_params: Option<TransportParameters>,
    peer_version: Option<Version>,
}

impl ServerTlsSession {
    /// Create a session. `certificate_chain` is DER, leaf first;
    /// `private_key` is the Ed25519 seed matching the leaf.
    pub fn new(
        version: Version,
        params: TransportParameters,
        certificate_chain: Vec<Bytes>,
        private_key: [u8; 32],
    ) -> Self {
        Self {
            version,
            params,
            certificate_chain,
            private_key,
            state: ServerState::WaitClientHello,
            transcript: TranscriptHash::new(),
            key_schedule: KeySchedule::new(),
            client_hs_secret: [0u8; 32],
            client_finished_transcript: [0u8; 32],
            peer_params: None,
            peer_version: None,
        }
    }

    /// Consume the ClientHello and produce the full server response.
    pub fn handle_client_hello(&mut self, data: &[u8]) -> Result<ServerHelloAndHandshake> {
        if self.state != ServerState::WaitClientHello {
            return Err(Error::InvalidState);
        }

        let mut buf = BytesMut::from(data);
        let (msg_type, full, body) = messages::next_message(&mut buf)?
            .ok_or(Error::Tls { alert: 0x32, reason: "truncated ClientHello" })?;
        if msg_type != HandshakeType::ClientHello as u8 {
            return Err(Error::Tls { alert: 0x0a, reason: "expected ClientHello" });
        }

        let hello = messages::parse_client_hello(&body)?;
        self.transcript.update(&full);

        if let Some(tp) = &hello.transport_params {
            let (peer_version, params) = TransportParameters::decode_from_client_hello(tp)?;
            self.peer_version = Some(peer_version);
            self.peer_params = Some(params);
        }

        // ServerHello with a fresh X25519 share.
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);
        let server_hello =
            messages::encode_server_hello(&random, &PublicKey::from(&secret).to_bytes());
        self.transcript.update(&server_hello);

        // Handshake traffic secrets over CH..SH.
        let shared = secret.diffie_hellman(&PublicKey::from(hello.key_share));
        self.key_schedule.derive_handshake_secret(shared.as_bytes());
        let hash = self.transcript.current();
        let (client_hs, server_hs) = self.key_schedule.handshake_traffic_secrets(&hash);
        self.client_hs_secret = client_hs;
        let handshake_aead = traffic_aead(&server_hs, &client_hs);

        // EncryptedExtensions .. Finished.
        let tp = self.params.encode_for_encrypted_extensions(self.version);
        let encrypted_extensions = messages::encode_encrypted_extensions(&tp);
        self.transcript.update(&encrypted_extensions);

        let certificate = messages::encode_certificate(&self.certificate_chain);
        self.transcript.update(&certificate);

        // The signature covers the transcript up to Certificate.
        let signature = sign_certificate_verify(&self.private_key, &self.transcript.current());
        let certificate_verify = messages::encode_certificate_verify(&signature);
        self.transcript.update(&certificate_verify);

        let finished_key = derive_finished_key(&server_hs);
        let verify = finished_verify_data(&finished_key, &self.transcript.current());
        let finished = messages::encode_finished(&verify);
        self.transcript.update(&finished);

        // Application secrets and the client Finished expectation both
        // cover CH..server Finished.
        self.key_schedule.derive_master_secret();
        let hash = self.transcript.current();
        self.client_finished_transcript = hash;
        let (client_app, server_app) = self.key_schedule.app_traffic_secrets(&hash);
        let one_rtt_aead = traffic_aead(&server_app, &client_app);

        let mut server_handshake = BytesMut::with_capacity(
            encrypted_extensions.len()
                + certificate.len()
                + certificate_verify.len()
                + finished.len(),
        );
        server_handshake.extend_from_slice(&encrypted_extensions);
        server_handshake.extend_from_slice(&certificate);
        server_handshake.extend_from_slice(&certificate_verify);
        server_handshake.extend_from_slice(&finished);

        self.state = ServerState::WaitClientFinished;
        Ok(ServerHelloAndHandshake {
            server_hello,
            handshake_aead,
            server_handshake: server_handshake.freeze(),
            one_rtt_aead,
        })
    }

    /// Verify the client Finished, completing the handshake.
    pub fn handle_client_finished(&mut self, data: &[u8]) -> Result<()> {
        if self.state != ServerState::WaitClientFinished {
            return Err(Error::InvalidState);
        }

        let mut buf = BytesMut::from(data);
        let (msg_type, full, body) = messages::next_message(&mut buf)?
            .ok_or(Error::Tls { alert: 0x32, reason: "truncated Finished" })?;
        if msg_type != HandshakeType::Finished as u8 {
            return Err(Error::Tls { alert: 0x0a, reason: "expected Finished" });
        }

        let received = messages::parse_finished(&body)?;
        let finished_key = derive_finished_key(&self.client_hs_secret);
        let expected = finished_verify_data(&finished_key, &self.client_finished_transcript);
        if received != expected {
            return Err(Error::Tls { alert: 0x33, reason: "client Finished verification failed" });
        }
        self.transcript.update(&full);

        self.state = ServerState::Complete;
        Ok(())
    }

    /// The client's transport parameters, once the ClientHello has been
    /// processed.
    pub fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    /// The initial version the client claimed in its parameters.
    pub fn peer_version(&self) -> Option<Version> {
        self.peer_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cert::{build_ed25519_certificate, public_key_from_seed};
    use crate::tls::client::ClientTlsSession;
    use crate::tls::NoopCertificateValidator;
    use std::sync::Arc;

    fn server_session() -> ServerTlsSession {
        let seed = [42u8; 32];
        let chain = vec![build_ed25519_certificate(&public_key_from_seed(&seed))];
        ServerTlsSession::new(
            Version::DRAFT_18,
            TransportParameters {
                initial_max_data: 1 << 20,
                ..TransportParameters::default()
            },
            chain,
            seed,
        )
    }

    fn client_session() -> ClientTlsSession {
        ClientTlsSession::new(
            Version::DRAFT_18,
            TransportParameters {
                initial_max_data: 1 << 16,
                ..TransportParameters::default()
            },
            Arc::new(NoopCertificateValidator),
        )
    }

    /// Drive a full handshake between the two session implementations.
    #[test]
    fn full_handshake_interop() {
        let mut client = client_session();
        let mut server = server_session();

        let client_hello = client.start_handshake().unwrap();
        let shah = server.handle_client_hello(&client_hello).unwrap();

        let _handshake_aead = client.handle_server_hello(&shah.server_hello).unwrap();
        let result = client.handle_handshake(&shah.server_handshake).unwrap().unwrap();

        server.handle_client_finished(&result.finished).unwrap();

        // Transport parameters crossed both ways.
        assert_eq!(client.peer_transport_parameters().unwrap().initial_max_data, 1 << 20);
        assert_eq!(server.peer_transport_parameters().unwrap().initial_max_data, 1 << 16);
        assert_eq!(server.peer_version(), Some(Version::DRAFT_18));

        // The derived 1-RTT AEADs interoperate.
        let sealed = result.one_rtt.seal(9, b"hdr", b"application data");
        assert_eq!(shah.one_rtt_aead.open(9, b"hdr", &sealed).unwrap(), b"application data");
    }

    /// The server flight split across multiple CRYPTO chunks still
    /// completes.
    #[test]
    fn fragmented_server_flight() {
        let mut client = client_session();
        let mut server = server_session();

        let client_hello = client.start_handshake().unwrap();
        let shah = server.handle_client_hello(&client_hello).unwrap();
        client.handle_server_hello(&shah.server_hello).unwrap();

        let split = shah.server_handshake.len() / 2;
        assert!(client.handle_handshake(&shah.server_handshake[..split]).unwrap().is_none());
        let result =
            client.handle_handshake(&shah.server_handshake[split..]).unwrap().unwrap();
        server.handle_client_finished(&result.finished).unwrap();
    }

    #[test]
    fn tampered_finished_is_rejected() {
        let mut client = client_session();
        let mut server = server_session();

        let client_hello = client.start_handshake().unwrap();
        let shah = server.handle_client_hello(&client_hello).unwrap();
        client.handle_server_hello(&shah.server_hello).unwrap();
        let result = client.handle_handshake(&shah.server_handshake).unwrap().unwrap();

        let mut bad = result.finished.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(server.handle_client_finished(&bad).is_err());
    }

    #[test]
    fn rejected_certificate_chain_fails_the_handshake() {
        use crate::tls::cert::CertificateValidator;

        struct RejectEverything;
        impl CertificateValidator for RejectEverything {
            fn validate(&self, _chain: &[bytes::Bytes]) -> crate::error::Result<()> {
                Err(Error::Tls { alert: 0x2a, reason: "untrusted certificate" })
            }
        }

        let mut client = ClientTlsSession::new(
            Version::DRAFT_18,
            TransportParameters::default(),
            Arc::new(RejectEverything),
        );
        let mut server = server_session();

        let client_hello = client.start_handshake().unwrap();
        let shah = server.handle_client_hello(&client_hello).unwrap();
        client.handle_server_hello(&shah.server_hello).unwrap();

        assert!(matches!(
            client.handle_handshake(&shah.server_handshake),
            Err(Error::Tls { alert: 0x2a, .. })
        ));
    }

    #[test]
    fn client_hello_twice_is_rejected() {
        let mut client = client_session();
        let mut server = server_session();
        let client_hello = client.start_handshake().unwrap();
        server.handle_client_hello(&client_hello).unwrap();
        assert!(matches!(server.handle_client_hello(&client_hello), Err(Error::InvalidState)));
    }
}
