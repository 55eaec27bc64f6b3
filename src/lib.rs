//! # quiver: a QUIC (draft-18) transport endpoint core
//!
//! The per-connection machinery of a QUIC endpoint: state machines for
//! the client and server roles, a TLS 1.3 handshake session driving key
//! installation, a packet buffer that retains sent packets and
//! generates acknowledgments, and a stream manager delivering ordered
//! bytes. UDP datagram I/O, timers and certificate policy stay outside:
//! they plug in through the [`connection::PacketSender`],
//! [`stream::StreamListener`] and [`tls::CertificateValidator`]
//! capabilities.
//!
//! ```text
//! quiver/
//! ├── error        - transport error codes and the crate error enum
//! ├── types        - connection IDs, packet numbers, stream IDs, varints
//! ├── version      - protocol version (draft-18)
//! ├── frames       - frame types and their wire codec
//! ├── packet       - packet variants, header codec, sent/received buffer
//! ├── crypto       - encryption levels, AEAD set, Initial key derivation
//! ├── tls          - TLS 1.3 client/server sessions and key schedule
//! ├── transport    - transport parameters
//! ├── stream       - reassembly and stream management
//! ├── flow_control - credit accounting hooks
//! ├── pipeline     - inbound/outbound handler composition
//! ├── connection   - client and server connection shells
//! └── server       - address validation (Retry)
//! ```
//!
//! Inbound packets traverse retry → TLS/state machine → packet buffer →
//! stream manager → flow control; outbound packets traverse flow
//! control → packet buffer. One connection is one single-threaded
//! cooperative unit: the embedder serializes `on_packet` calls, and
//! multiple connections run on separate tasks.
//!
//! ## Usage sketch
//!
//! ```rust,ignore
//! let mut connection = ClientConnection::new(
//!     Configuration::default(),
//!     ConnectionId::random(8),
//!     listener,
//!     sender,
//!     Box::new(MockFlowControlHandler),
//!     peer_address,
//!     Arc::new(NoopCertificateValidator),
//! );
//! let handshake = connection.handshake()?;
//! // feed datagrams: connection.on_datagram(&bytes);
//! // once Ready: connection.write_stream(stream_id, data, fin)?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod pipeline;
pub mod server;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod types;
pub mod version;

pub use config::Configuration;
pub use connection::{ClientConnection, HandshakeFuture, PacketSender, ServerConnection, State};
pub use crypto::{Aead, AeadSet, EncryptionLevel};
pub use error::{Error, Result, TransportError};
pub use frames::Frame;
pub use packet::{Packet, PacketBuffer};
pub use stream::{StreamListener, StreamManager};
pub use tls::{CertificateValidator, ClientTlsSession, NoopCertificateValidator, ServerTlsSession};
pub use transport::TransportParameters;
pub use types::{ConnectionId, PacketNumber, Side, StreamDirection, StreamId};
pub use version::Version;
