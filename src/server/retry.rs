//! Address validation with Retry tokens.
//!
//! Token format: `HMAC-SHA256(serverKey, ip || port || issuedAt) ||
//! issuedAt`, with `issuedAt` as seconds since the Unix epoch in eight
//! big-endian bytes. Validation recomputes the MAC, checks the peer
//! address matches and the token is inside the validity window. An
//! invalid token is treated exactly like a missing one.

use crate::connection::State;
use crate::packet::{Packet, RetryPacket};
use crate::pipeline::{Disposition, InboundHandler, PipelineContext};
use crate::types::ConnectionId;
use crate::version::Version;
use bytes::Bytes;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const MAC_LEN: usize = 32;
const TIMESTAMP_LEN: usize = 8;

/// Issues and validates Retry tokens; sits first on the server's
/// inbound pipeline.
pub struct RetryHandler {
    key: [u8; 32],
    validity: Duration,
    /// When false, Initial packets pass through unvalidated.
    require_validation: bool,
    version: Version,
    local_cid: ConnectionId,
}

impl RetryHandler {
    /// Derive the token key from the server's private key material so
    /// tokens stay valid across restarts with the same identity.
    pub fn new(
        private_key: &[u8],
        version: Version,
        local_cid: ConnectionId,
        require_validation: bool,
    ) -> Self {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(b"quiver retry token"), private_key);
        let mut key = [0u8; 32];
        key.copy_from_slice(&prk);
        Self {
            key,
            validity: Duration::from_secs(30 * 60),
            require_validation,
            version,
            local_cid,
        }
    }

    /// Override the 30-minute validity window.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Mint a token bound to `peer` at `issued_at`.
    pub fn generate_token(&self, peer: &SocketAddr, issued_at: SystemTime) -> Bytes {
        let issued_secs =
            issued_at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let mut token = Vec::with_capacity(MAC_LEN + TIMESTAMP_LEN);
        token.extend_from_slice(&self.mac(peer, issued_secs));
        token.extend_from_slice(&issued_secs.to_be_bytes());
        Bytes::from(token)
    }

    /// Check a token against the peer address and the validity window.
    pub fn validate_token(&self, peer: &SocketAddr, token: &[u8], now: SystemTime) -> bool {
        if token.len() != MAC_LEN + TIMESTAMP_LEN {
            return false;
        }
        let mut issued_bytes = [0u8; TIMESTAMP_LEN];
        issued_bytes.copy_from_slice(&token[MAC_LEN..]);
        let issued_secs = u64::from_be_bytes(issued_bytes);

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key");
        mac.update(&self.token_payload(peer, issued_secs));
        if mac.verify_slice(&token[..MAC_LEN]).is_err() {
            return false;
        }

        let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        now_secs >= issued_secs && now_secs - issued_secs <= self.validity.as_secs()
    }

    fn mac(&self, peer: &SocketAddr, issued_secs: u64) -> [u8; 32] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key");
        mac.update(&self.token_payload(peer, issued_secs));
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn token_payload(&self, peer: &SocketAddr, issued_secs: u64) -> Vec<u8> {
        let mut payload = Vec::new();
        match peer.ip() {
            std::net::IpAddr::V4(ip) => payload.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => payload.extend_from_slice(&ip.octets()),
        }
        payload.extend_from_slice(&peer.port().to_be_bytes());
        payload.extend_from_slice(&issued_secs.to_be_bytes());
        payload
    }
}

impl InboundHandler for RetryHandler {
    fn on_receive_packet(&mut self, packet: &Packet, ctx: &mut PipelineContext) -> Disposition {
        if ctx.state() != State::Started || !self.require_validation {
            return Disposition::Continue;
        }
        let Packet::Initial(initial) = packet else {
            return Disposition::Continue;
        };

        let valid = initial
            .token
            .as_ref()
            .map(|token| self.validate_token(&ctx.peer_address(), token, SystemTime::now()))
            .unwrap_or(false);
        if valid {
            return Disposition::Continue;
        }

        let Some(original_dcid) = initial.dcid.clone() else {
            debug!("initial without destination connection ID, dropping");
            return Disposition::Stop;
        };

        debug!("address not validated, sending retry");
        let token = self.generate_token(&ctx.peer_address(), SystemTime::now());
        ctx.send_packet(Packet::Retry(RetryPacket {
            version: self.version,
            dcid: initial.scid.clone(),
            scid: Some(self.local_cid.clone()),
            original_dcid,
            token,
        }));
        Disposition::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{CryptoFrame, Frame};
    use crate::packet::InitialPacket;
    use crate::pipeline::Action;

    fn handler(require: bool) -> RetryHandler {
        RetryHandler::new(
            b"server private key",
            Version::DRAFT_18,
            ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap(),
            require,
        )
    }

    fn addr() -> SocketAddr {
        "192.0.2.7:4433".parse().unwrap()
    }

    #[test]
    fn token_round_trip() {
        let h = handler(true);
        let issued = SystemTime::now();
        let token = h.generate_token(&addr(), issued);
        assert!(h.validate_token(&addr(), &token, issued + Duration::from_secs(60)));
    }

    #[test]
    fn token_bound_to_address() {
        let h = handler(true);
        let token = h.generate_token(&addr(), SystemTime::now());
        let other: SocketAddr = "192.0.2.8:4433".parse().unwrap();
        assert!(!h.validate_token(&other, &token, SystemTime::now()));
    }

    #[test]
    fn token_expires() {
        let h = handler(true);
        let issued = SystemTime::now();
        let token = h.generate_token(&addr(), issued);
        assert!(!h.validate_token(&addr(), &token, issued + Duration::from_secs(31 * 60)));
    }

    #[test]
    fn garbage_token_is_invalid() {
        let h = handler(true);
        assert!(!h.validate_token(&addr(), b"short", SystemTime::now()));
        assert!(!h.validate_token(&addr(), &[0u8; 40], SystemTime::now()));
    }

    fn initial_packet(token: Option<Bytes>) -> Packet {
        InitialPacket::create(
            Some(ConnectionId::from_slice(&[9, 9, 9, 9]).unwrap()),
            Some(ConnectionId::from_slice(&[8, 8, 8, 8]).unwrap()),
            1,
            Version::DRAFT_18,
            token,
            vec![Frame::Crypto(CryptoFrame::new(0, Bytes::from_static(b"ch")))],
        )
    }

    #[test]
    fn tokenless_initial_triggers_retry() {
        let mut h = handler(true);
        let mut ctx = PipelineContext::new(State::Started, addr());

        let disposition = h.on_receive_packet(&initial_packet(None), &mut ctx);
        assert_eq!(disposition, Disposition::Stop);

        let actions = ctx.take_actions();
        assert!(matches!(
            &actions[0],
            Action::SendPacket(Packet::Retry(retry)) if !retry.token.is_empty()
        ));
    }

    #[test]
    fn valid_token_passes_through() {
        let mut h = handler(true);
        let mut ctx = PipelineContext::new(State::Started, addr());
        let token = h.generate_token(&addr(), SystemTime::now());

        let disposition = h.on_receive_packet(&initial_packet(Some(token)), &mut ctx);
        assert_eq!(disposition, Disposition::Continue);
        assert!(ctx.take_actions().is_empty());
    }

    #[test]
    fn validation_disabled_passes_everything() {
        let mut h = handler(false);
        let mut ctx = PipelineContext::new(State::Started, addr());
        let disposition = h.on_receive_packet(&initial_packet(None), &mut ctx);
        assert_eq!(disposition, Disposition::Continue);
    }
}
