//! Connection end-to-end tests: the full client handshake against a
//! real server TLS session (including the Retry round), stream
//! delivery and acknowledgment behavior, close paths, and a complete
//! client-server exchange.

#![cfg(test)]

use super::{ClientConnection, PacketSender, ServerConnection, State};
use crate::config::Configuration;
use crate::crypto::Aead;
use crate::error::{Error, Result};
use crate::flow_control::MockFlowControlHandler;
use crate::frames::{
    AckBlock, ConnectionCloseFrame, Frame, ResetStreamFrame, StreamFrame,
    FRAME_TYPE_STREAM_BASE,
};
use crate::packet::{
    HandshakePacket, InitialPacket, Packet, RetryPacket, ShortPacket, VersionNegotiationPacket,
};
use crate::stream::StreamListener;
use crate::tls::cert::{build_ed25519_certificate, public_key_from_seed};
use crate::tls::{NoopCertificateValidator, ServerTlsSession};
use crate::types::{ConnectionId, StreamDirection, StreamId};
use crate::version::Version;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;

const DATA: &[u8] = b"Hello";
const DATA2: &[u8] = b"world";
const SERVER_KEY_SEED: [u8; 32] = [42u8; 32];

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Clone, Default)]
struct MockPacketSender {
    sent: Arc<Mutex<Vec<Packet>>>,
    destroyed: Arc<AtomicBool>,
}

impl MockPacketSender {
    fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn nth(&self, index: usize) -> Packet {
        self.sent.lock().unwrap()[index].clone()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl PacketSender for MockPacketSender {
    fn send(&self, packet: &Packet, _aead: &Aead) -> Result<()> {
        self.sent.lock().unwrap().push(packet.clone());
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    data: Mutex<Vec<(StreamId, Bytes, bool)>>,
    resets: Mutex<Vec<(StreamId, u64)>>,
}

impl RecordingListener {
    fn data(&self) -> Vec<(StreamId, Bytes, bool)> {
        self.data.lock().unwrap().clone()
    }
}

impl StreamListener for RecordingListener {
    fn on_data(&self, stream_id: StreamId, data: Bytes, fin: bool) {
        self.data.lock().unwrap().push((stream_id, data, fin));
    }
    fn on_reset(&self, stream_id: StreamId, error_code: u64) {
        self.resets.lock().unwrap().push((stream_id, error_code));
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    connection: ClientConnection,
    sender: MockPacketSender,
    listener: Arc<RecordingListener>,
    server_tls: ServerTlsSession,
    dest_cid: ConnectionId,
    srv_cid: ConnectionId,
    /// Fixture-side packet number counter, shared across levels the way
    /// the test drives them.
    peer_packet_number: u64,
    stream_id: StreamId,
}

fn peer_address() -> SocketAddr {
    "192.0.2.1:4433".parse().unwrap()
}

fn server_certificate_chain() -> Vec<Bytes> {
    vec![build_ed25519_certificate(&public_key_from_seed(&SERVER_KEY_SEED))]
}

impl Fixture {
    fn new() -> Self {
        let dest_cid = ConnectionId::random(8);
        let srv_cid = ConnectionId::random(8);
        let sender = MockPacketSender::default();
        let listener = Arc::new(RecordingListener::default());

        let connection = ClientConnection::new(
            Configuration::default(),
            dest_cid.clone(),
            listener.clone(),
            Box::new(sender.clone()),
            Box::new(MockFlowControlHandler),
            peer_address(),
            Arc::new(NoopCertificateValidator),
        );

        let server_tls = ServerTlsSession::new(
            Version::DRAFT_18,
            Configuration::default().transport_parameters(),
            server_certificate_chain(),
            SERVER_KEY_SEED,
        );

        Self {
            connection,
            sender,
            listener,
            server_tls,
            dest_cid,
            srv_cid,
            peer_packet_number: 0,
            stream_id: StreamId::build(3, true, true),
        }
    }

    fn next_peer_packet_number(&mut self) -> u64 {
        self.peer_packet_number += 1;
        self.peer_packet_number
    }

    fn short_packet(&mut self, frames: Vec<Frame>) -> Packet {
        let pn = self.next_peer_packet_number();
        ShortPacket::create(false, Some(self.connection.local_connection_id().clone()), pn, frames)
    }

    /// Drive the full handshake, including the Retry round. Mirrors the
    /// wire sequence the server would produce, with a real server TLS
    /// session generating the CRYPTO payloads.
    fn handshake(&mut self) -> crate::connection::HandshakeFuture {
        let mut future = self.connection.handshake().unwrap();

        // First flight: padded Initial, no token yet.
        let initial = match self.sender.nth(0) {
            Packet::Initial(p) => p,
            other => panic!("expected Initial, got {other:?}"),
        };
        assert_eq!(initial.packet_number, 1);
        assert_eq!(initial.dcid.as_ref(), Some(&self.dest_cid));
        assert!(initial.scid.is_some());
        assert!(initial.token.is_none());
        assert_eq!(initial.version, Version::DRAFT_18);
        assert!(matches!(initial.payload.frames[0], Frame::Crypto(_)));
        assert!(initial.payload.encoded_len() >= 1200);

        assert!(matches!(future.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(self.connection.state(), State::BeforeHello);

        let generated_scid = initial.scid.clone().unwrap();
        let retry_token = Bytes::from_static(b"address validation token");

        // The Initial carried no token: the server answers with Retry.
        self.connection.on_packet(Packet::Retry(RetryPacket {
            version: Version::DRAFT_18,
            dcid: None,
            scid: Some(self.srv_cid.clone()),
            original_dcid: self.dest_cid.clone(),
            token: retry_token.clone(),
        }));

        // Second flight: packet number reset, token echoed, new remote.
        let initial2 = match self.sender.nth(1) {
            Packet::Initial(p) => p,
            other => panic!("expected Initial, got {other:?}"),
        };
        assert_eq!(initial2.packet_number, 1);
        assert_eq!(initial2.dcid.as_ref(), Some(&self.srv_cid));
        assert_eq!(initial2.scid.as_ref(), Some(&generated_scid));
        assert_eq!(initial2.token.as_ref(), Some(&retry_token));
        assert!(initial2.payload.encoded_len() >= 1200);
        assert_eq!(self.connection.state(), State::BeforeHello);

        let client_hello = crypto_data(&initial2.payload.frames);
        let shah = self.server_tls.handle_client_hello(&client_hello).unwrap();

        // ServerHello arrives in an Initial packet.
        let pn = self.next_peer_packet_number();
        self.connection.on_packet(InitialPacket::create(
            Some(generated_scid.clone()),
            Some(self.srv_cid.clone()),
            pn,
            Version::DRAFT_18,
            None,
            vec![Frame::Crypto(crate::frames::CryptoFrame::new(0, shah.server_hello.clone()))],
        ));

        // No packet goes out for the ServerHello alone.
        assert_eq!(self.sender.sent_count(), 2);
        assert!(matches!(future.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(self.connection.state(), State::BeforeHandshake);

        // The server handshake flight completes the exchange.
        let pn = self.next_peer_packet_number();
        self.connection.on_packet(HandshakePacket::create(
            Some(generated_scid),
            Some(self.srv_cid.clone()),
            pn,
            Version::DRAFT_18,
            vec![Frame::Crypto(crate::frames::CryptoFrame::new(
                0,
                shah.server_handshake.clone(),
            ))],
        ));

        // The client Finished goes out in a Handshake packet that also
        // acknowledges the server's Handshake packet.
        let fin = match self.sender.nth(2) {
            Packet::Handshake(p) => p,
            other => panic!("expected Handshake, got {other:?}"),
        };
        assert_eq!(fin.packet_number, 2);
        assert_eq!(fin.dcid.as_ref(), Some(&self.srv_cid));
        assert!(matches!(
            &fin.payload.frames[0],
            Frame::Ack(ack) if ack.blocks == vec![AckBlock::new(2, 2)]
        ));
        let finished = crypto_data(&fin.payload.frames);

        // The real server accepts the client Finished.
        self.server_tls.handle_client_finished(&finished).unwrap();

        assert_eq!(self.connection.state(), State::Ready);
        assert!(matches!(future.try_recv(), Ok(Ok(()))));
        future
    }

    fn assert_ack(&self, index: usize, packet_number: u64, smallest: u64, largest: u64) {
        let packet = match self.sender.nth(index) {
            Packet::Short(p) => p,
            other => panic!("expected Short packet, got {other:?}"),
        };
        assert_eq!(packet.packet_number, packet_number);
        assert_eq!(packet.dcid.as_ref(), Some(&self.srv_cid));
        assert!(matches!(
            &packet.payload.frames[0],
            Frame::Ack(ack) if ack.blocks == vec![AckBlock::new(smallest, largest)]
        ));
    }
}

fn crypto_data(frames: &[Frame]) -> Bytes {
    frames
        .iter()
        .find_map(|f| match f {
            Frame::Crypto(c) => Some(c.data.clone()),
            _ => None,
        })
        .expect("payload carries a CRYPTO frame")
}

// ============================================================================
// Client scenarios
// ============================================================================

#[test]
fn handshake_with_retry() {
    Fixture::new().handshake();
}

#[test]
fn handshake_twice_fails() {
    let mut fx = Fixture::new();
    fx.handshake();
    assert!(matches!(fx.connection.handshake(), Err(Error::InvalidState)));
}

#[test]
fn second_retry_is_ignored() {
    let mut fx = Fixture::new();
    fx.handshake();

    let before = fx.sender.sent_count();
    fx.connection.on_packet(Packet::Retry(RetryPacket {
        version: Version::DRAFT_18,
        dcid: None,
        scid: Some(ConnectionId::random(8)),
        original_dcid: fx.dest_cid.clone(),
        token: Bytes::from_static(b"second token"),
    }));

    assert_eq!(fx.sender.sent_count(), before);
    assert_eq!(fx.connection.remote_connection_id(), Some(&fx.srv_cid));
}

#[test]
fn stream_frame() {
    let mut fx = Fixture::new();
    fx.handshake();
    let sid = fx.stream_id;

    let packet =
        fx.short_packet(vec![Frame::Stream(StreamFrame::new(sid, 0, true, Bytes::from(DATA)))]);
    fx.connection.on_packet(packet);

    assert_eq!(fx.listener.data(), vec![(sid, Bytes::from(DATA), true)]);
    fx.assert_ack(3, 3, 3, 3);
}

#[test]
fn stream_frames_in_order() {
    let mut fx = Fixture::new();
    fx.handshake();
    let sid = fx.stream_id;

    let first =
        fx.short_packet(vec![Frame::Stream(StreamFrame::new(sid, 0, false, Bytes::from(DATA)))]);
    fx.connection.on_packet(first);
    let second = fx.short_packet(vec![Frame::Stream(StreamFrame::new(
        sid,
        DATA.len() as u64,
        true,
        Bytes::from(DATA2),
    ))]);
    fx.connection.on_packet(second);

    assert_eq!(
        fx.listener.data(),
        vec![(sid, Bytes::from(DATA), false), (sid, Bytes::from(DATA2), true)]
    );
    fx.assert_ack(3, 3, 3, 3);
    fx.assert_ack(4, 4, 4, 4);
}

#[test]
fn stream_frames_out_of_order() {
    let mut fx = Fixture::new();
    fx.handshake();
    let sid = fx.stream_id;

    let first = fx.short_packet(vec![Frame::Stream(StreamFrame::new(
        sid,
        DATA.len() as u64,
        true,
        Bytes::from(DATA2),
    ))]);
    fx.connection.on_packet(first);
    let second =
        fx.short_packet(vec![Frame::Stream(StreamFrame::new(sid, 0, false, Bytes::from(DATA)))]);
    fx.connection.on_packet(second);

    assert_eq!(
        fx.listener.data(),
        vec![(sid, Bytes::from(DATA), false), (sid, Bytes::from(DATA2), true)]
    );
    fx.assert_ack(3, 3, 3, 3);
    fx.assert_ack(4, 4, 4, 4);
}

#[test]
fn reset_stream_frame() {
    let mut fx = Fixture::new();
    fx.handshake();
    let sid = fx.stream_id;

    let packet = fx.short_packet(vec![Frame::ResetStream(ResetStreamFrame {
        stream_id: sid,
        error_code: 123,
        final_size: 0,
    })]);
    fx.connection.on_packet(packet);

    assert_eq!(*fx.listener.resets.lock().unwrap(), vec![(sid, 123)]);
    fx.assert_ack(3, 3, 3, 3);
}

#[test]
fn ping_is_acked_without_callback() {
    let mut fx = Fixture::new();
    fx.handshake();

    let packet = fx.short_packet(vec![Frame::Ping]);
    fx.connection.on_packet(packet);

    assert!(fx.listener.data().is_empty());
    fx.assert_ack(3, 3, 3, 3);
}

#[test]
fn duplicate_packet_acked_once() {
    let mut fx = Fixture::new();
    fx.handshake();

    let packet = fx.short_packet(vec![Frame::Ping]);
    fx.connection.on_packet(packet.clone());
    fx.assert_ack(3, 3, 3, 3);

    // The duplicate owes nothing new.
    let before = fx.sender.sent_count();
    fx.connection.on_packet(packet);
    assert_eq!(fx.sender.sent_count(), before);
}

#[test]
fn peer_close_connection() {
    let mut fx = Fixture::new();
    fx.handshake();

    let packet = fx.short_packet(vec![Frame::ConnectionClose(ConnectionCloseFrame::transport(
        123,
        FRAME_TYPE_STREAM_BASE,
        "Closed",
    ))]);
    fx.connection.on_packet(packet);

    // The closing packet itself gets a final acknowledgment.
    fx.assert_ack(3, 3, 3, 3);
    assert_eq!(fx.connection.state(), State::Closed);
    assert!(fx.sender.is_destroyed());

    assert!(matches!(fx.connection.send(vec![Frame::Ping]), Err(Error::InvalidState)));
}

#[test]
fn immediate_close() {
    let mut fx = Fixture::new();
    fx.handshake();

    fx.connection.close().unwrap();
    assert_eq!(fx.connection.state(), State::Closed);
    assert!(fx.sender.is_destroyed());

    let last = fx.sender.nth(fx.sender.sent_count() - 1);
    let close = match &last {
        Packet::Short(p) => &p.payload.frames[0],
        other => panic!("expected Short close packet, got {other:?}"),
    };
    assert!(matches!(close, Frame::ConnectionClose(f) if f.error_code == 0));

    assert!(matches!(fx.connection.send(vec![Frame::Ping]), Err(Error::InvalidState)));
}

#[test]
fn version_negotiation_closes_without_sending() {
    let mut fx = Fixture::new();
    let mut future = fx.connection.handshake().unwrap();
    assert_eq!(fx.sender.sent_count(), 1);

    fx.connection.on_packet(Packet::VersionNegotiation(VersionNegotiationPacket {
        dcid: Some(fx.connection.local_connection_id().clone()),
        scid: Some(fx.srv_cid.clone()),
        supported_versions: vec![Version(0x0000_0001)],
    }));

    // No further sends; the sender is torn down.
    assert_eq!(fx.sender.sent_count(), 1);
    assert!(fx.sender.is_destroyed());
    assert_eq!(fx.connection.state(), State::Closed);
    assert!(matches!(future.try_recv(), Ok(Err(Error::ConnectionClosed))));
}

#[test]
fn frames_before_handshake_are_dropped() {
    let mut fx = Fixture::new();

    fx.connection
        .on_packet(ShortPacket::create(false, Some(fx.dest_cid.clone()), 1, vec![Frame::Ping]));

    assert_eq!(fx.sender.sent_count(), 0);
    assert_eq!(fx.connection.state(), State::BeforeInitial);
}

#[test]
fn write_stream_assigns_offsets_and_fin() {
    let mut fx = Fixture::new();
    fx.handshake();

    let sid = fx.connection.open_stream(StreamDirection::Bidirectional).unwrap();
    fx.connection.write_stream(sid, Bytes::from(DATA), false).unwrap();
    fx.connection.write_stream(sid, Bytes::from(DATA2), true).unwrap();

    let first = match fx.sender.nth(3) {
        Packet::Short(p) => p,
        other => panic!("expected Short, got {other:?}"),
    };
    assert!(matches!(
        &first.payload.frames[0],
        Frame::Stream(f) if f.offset == 0 && !f.fin && f.data == Bytes::from(DATA)
    ));

    let second = match fx.sender.nth(4) {
        Packet::Short(p) => p,
        other => panic!("expected Short, got {other:?}"),
    };
    assert!(matches!(
        &second.payload.frames[0],
        Frame::Stream(f) if f.offset == DATA.len() as u64 && f.fin
    ));

    // The send side is sealed.
    assert!(fx.connection.write_stream(sid, Bytes::from_static(b"x"), false).is_err());
}

#[test]
fn idle_timeout_closes_silently() {
    let mut fx = Fixture::new();
    fx.handshake();
    let before = fx.sender.sent_count();

    fx.connection.on_timeout(Instant::now() + Duration::from_secs(31));

    assert_eq!(fx.connection.state(), State::Closed);
    assert!(fx.sender.is_destroyed());
    // Silent: no CONNECTION_CLOSE went out.
    assert_eq!(fx.sender.sent_count(), before);
}

#[test]
fn retransmit_reemits_unacked_frames() {
    let mut fx = Fixture::new();
    fx.handshake();

    let sid = fx.connection.open_stream(StreamDirection::Bidirectional).unwrap();
    fx.connection.write_stream(sid, Bytes::from(DATA), false).unwrap();

    fx.connection.retransmit_unacked().unwrap();
    let last = fx.sender.nth(fx.sender.sent_count() - 1);
    let frames = &last.payload().unwrap().frames;
    assert!(frames
        .iter()
        .any(|f| matches!(f, Frame::Stream(s) if s.stream_id == sid && s.data == Bytes::from(DATA))));
}

// ============================================================================
// Client against ServerConnection
// ============================================================================

struct Pipe {
    sender: MockPacketSender,
    fed: usize,
}

impl Pipe {
    fn new(sender: MockPacketSender) -> Self {
        Self { sender, fed: 0 }
    }

    /// Packets sent since the last drain.
    fn drain(&mut self) -> Vec<Packet> {
        let sent = self.sender.sent();
        let new = sent[self.fed..].to_vec();
        self.fed = sent.len();
        new
    }
}

#[test]
fn client_and_server_complete_a_connection() {
    let client_listener = Arc::new(RecordingListener::default());
    let server_listener = Arc::new(RecordingListener::default());
    let client_sender = MockPacketSender::default();
    let server_sender = MockPacketSender::default();

    let server_cid = ConnectionId::random(8);

    let mut client = ClientConnection::new(
        Configuration::default(),
        server_cid.clone(),
        client_listener.clone(),
        Box::new(client_sender.clone()),
        Box::new(MockFlowControlHandler),
        "192.0.2.2:4433".parse().unwrap(),
        Arc::new(NoopCertificateValidator),
    );
    let mut server = ServerConnection::new(
        Configuration::default(),
        server_cid,
        server_listener.clone(),
        Box::new(server_sender.clone()),
        Box::new(MockFlowControlHandler),
        "192.0.2.3:9000".parse().unwrap(),
        server_certificate_chain(),
        SERVER_KEY_SEED,
        true,
    );

    let mut to_server = Pipe::new(client_sender.clone());
    let mut to_client = Pipe::new(server_sender.clone());

    let mut future = client.handshake().unwrap();

    // Initial (no token) -> Retry -> Initial (token) -> server flight ->
    // client Finished. Loop packets until both sides settle.
    for _ in 0..6 {
        for packet in to_server.drain() {
            server.on_packet(packet);
        }
        for packet in to_client.drain() {
            client.on_packet(packet);
        }
    }

    assert_eq!(client.state(), State::Ready);
    assert_eq!(server.state(), State::Ready);
    assert!(matches!(future.try_recv(), Ok(Ok(()))));

    // Client-to-server stream data.
    let sid = client.open_stream(StreamDirection::Bidirectional).unwrap();
    client.write_stream(sid, Bytes::from_static(b"request"), true).unwrap();
    for packet in to_server.drain() {
        server.on_packet(packet);
    }
    assert_eq!(server_listener.data(), vec![(sid, Bytes::from_static(b"request"), true)]);

    // Server-to-client stream data on its own stream.
    let server_sid = server.open_stream(StreamDirection::Bidirectional).unwrap();
    assert!(server_sid.is_server_initiated());
    server.write_stream(server_sid, Bytes::from_static(b"response"), true).unwrap();
    for packet in to_client.drain() {
        client.on_packet(packet);
    }
    assert_eq!(
        client_listener.data(),
        vec![(server_sid, Bytes::from_static(b"response"), true)]
    );

    // Client close reaches the server.
    client.close().unwrap();
    for packet in to_server.drain() {
        server.on_packet(packet);
    }
    assert_eq!(client.state(), State::Closed);
    assert_eq!(server.state(), State::Closed);
    assert!(client_sender.is_destroyed());
    assert!(server_sender.is_destroyed());
}

#[test]
fn server_without_validation_skips_retry() {
    let server_listener = Arc::new(RecordingListener::default());
    let client_listener = Arc::new(RecordingListener::default());
    let client_sender = MockPacketSender::default();
    let server_sender = MockPacketSender::default();

    let server_cid = ConnectionId::random(8);

    let mut client = ClientConnection::new(
        Configuration::default(),
        server_cid.clone(),
        client_listener,
        Box::new(client_sender.clone()),
        Box::new(MockFlowControlHandler),
        "192.0.2.2:4433".parse().unwrap(),
        Arc::new(NoopCertificateValidator),
    );
    let mut server = ServerConnection::new(
        Configuration::default(),
        server_cid,
        server_listener,
        Box::new(server_sender.clone()),
        Box::new(MockFlowControlHandler),
        "192.0.2.3:9000".parse().unwrap(),
        server_certificate_chain(),
        SERVER_KEY_SEED,
        false,
    );

    let _future = client.handshake().unwrap();

    let mut to_server = Pipe::new(client_sender.clone());
    let mut to_client = Pipe::new(server_sender.clone());
    for _ in 0..4 {
        for packet in to_server.drain() {
            server.on_packet(packet);
        }
        for packet in to_client.drain() {
            client.on_packet(packet);
        }
    }

    assert_eq!(client.state(), State::Ready);
    assert_eq!(server.state(), State::Ready);

    // No Retry appeared on the wire.
    assert!(!server_sender.sent().iter().any(|p| matches!(p, Packet::Retry(_))));
}
