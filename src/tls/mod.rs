//! TLS 1.3 handshake sessions for QUIC.
//!
//! QUIC carries raw TLS handshake messages in CRYPTO frames and does its
//! own packet protection, so there is no record layer here: the sessions
//! consume and produce opaque handshake bytes and derive the AEADs the
//! packet layer installs per encryption level.

pub mod cert;
pub mod client;
pub mod key_schedule;
pub mod messages;
pub mod server;
pub mod transcript;

pub use cert::{CertificateValidator, NoopCertificateValidator};
pub use client::{ClientTlsSession, HandshakeResult};
pub use server::{ServerHelloAndHandshake, ServerTlsSession};
