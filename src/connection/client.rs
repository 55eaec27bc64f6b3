//! Client connection and state machine.

use super::{ConnectionCore, HandshakeFuture, PacketSender, State};
use crate::config::Configuration;
use crate::crypto::EncryptionLevel;
use crate::error::{Error, Result};
use crate::flow_control::FlowControlHandler;
use crate::frames::{
    CryptoFrame, Frame, ResetStreamFrame, StreamFrame, FRAME_TYPE_CRYPTO,
};
use crate::packet::Packet;
use crate::pipeline::{Disposition, InboundHandler, PipelineContext};
use crate::stream::{StreamListener, StreamManager};
use crate::tls::{CertificateValidator, ClientTlsSession};
use crate::types::{ConnectionId, Side, StreamDirection, StreamId};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Minimum size of the client's first flight, enforced with PADDING.
const MIN_INITIAL_PAYLOAD: usize = 1200;

/// Client endpoint for one connection.
///
/// `on_packet` must be called from a single task; inbound packets are
/// processed in arrival order.
pub struct ClientConnection {
    core: ConnectionCore,
    machine: ClientStateMachine,
    streams: StreamManager,
}

impl ClientConnection {
    /// `remote_cid` is the destination connection ID for the first
    /// Initial packet; the Initial AEAD is derived from it.
    pub fn new(
        config: Configuration,
        remote_cid: ConnectionId,
        stream_listener: Arc<dyn StreamListener>,
        sender: Box<dyn PacketSender>,
        flow_control: Box<dyn FlowControlHandler>,
        peer_address: SocketAddr,
        certificate_validator: Arc<dyn CertificateValidator>,
    ) -> Self {
        let local_cid = ConnectionId::random(8);
        let tls = ClientTlsSession::new(
            config.version,
            config.transport_parameters(),
            certificate_validator,
        );
        let core = ConnectionCore::new(
            Side::Client,
            config.version,
            local_cid,
            Some(remote_cid.clone()),
            &remote_cid,
            sender,
            flow_control,
            peer_address,
            config.max_idle_timeout,
            State::BeforeInitial,
        );
        Self {
            core,
            machine: ClientStateMachine::new(tls),
            streams: StreamManager::new(Side::Client, stream_listener),
        }
    }

    /// Start the handshake: send the padded Initial with the ClientHello
    /// and return a future resolved on Ready.
    pub fn handshake(&mut self) -> Result<HandshakeFuture> {
        if self.core.state != State::BeforeInitial {
            return Err(Error::InvalidState);
        }
        let (tx, rx) = oneshot::channel();
        self.core.handshake_tx = Some(tx);

        let mut ctx = PipelineContext::new(self.core.state, self.core.peer_address);
        self.machine.start(&mut ctx)?;
        self.core.process_actions(&mut ctx);
        Ok(rx)
    }

    /// Inbound entry point for a parsed packet.
    pub fn on_packet(&mut self, packet: Packet) {
        self.core.last_activity = Instant::now();
        let mut ctx = PipelineContext::new(self.core.state, self.core.peer_address);

        let mut disposition = self.machine.on_receive_packet(&packet, &mut ctx);
        if disposition == Disposition::Continue {
            disposition = self.core.packet_buffer.on_receive_packet(&packet, &mut ctx);
        }
        if disposition == Disposition::Continue {
            disposition = self.streams.on_receive_packet(&packet, &mut ctx);
        }
        if disposition == Disposition::Continue {
            self.core.flow_control.on_receive_packet(&packet, &mut ctx);
        }

        self.core.process_actions(&mut ctx);
    }

    /// Inbound entry point for a raw datagram. Parse or decryption
    /// failures drop the datagram silently.
    pub fn on_datagram(&mut self, datagram: &[u8]) {
        match crate::packet::decode_packet(datagram, &self.core.aeads, self.core.local_cid.len()) {
            Ok(packet) => self.on_packet(packet),
            Err(err) => debug!(%err, "dropping undecodable datagram"),
        }
    }

    /// Send frames at the highest available encryption level.
    pub fn send(&mut self, frames: Vec<Frame>) -> Result<()> {
        self.core.check_send_allowed()?;
        let mut ctx = PipelineContext::new(self.core.state, self.core.peer_address);
        ctx.send_frames(frames);
        self.core.process_actions(&mut ctx);
        Ok(())
    }

    /// Open a locally-initiated stream.
    pub fn open_stream(&mut self, direction: StreamDirection) -> Result<StreamId> {
        self.core.check_send_allowed()?;
        Ok(self.streams.open_stream(direction))
    }

    /// Write bytes on a stream; `fin` seals the send side.
    pub fn write_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        self.core.check_send_allowed()?;
        let offset = self.streams.reserve_send(id, data.len(), fin)?;
        self.send(vec![Frame::Stream(StreamFrame::new(id, offset, fin, data))])
    }

    /// Abort the send side of a stream.
    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        self.core.check_send_allowed()?;
        let final_size = self.streams.send_offset(id).unwrap_or(0);
        self.send(vec![Frame::ResetStream(ResetStreamFrame {
            stream_id: id,
            error_code,
            final_size,
        })])
    }

    /// Close locally with CONNECTION_CLOSE(NO_ERROR).
    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    /// Drive the idle timeout; closes silently on expiry.
    pub fn on_timeout(&mut self, now: Instant) {
        self.core.on_timeout(now);
    }

    /// Re-emit unacknowledged frames (retransmission hook).
    pub fn retransmit_unacked(&mut self) -> Result<()> {
        self.core.retransmit_unacked()
    }

    pub fn state(&self) -> State {
        self.core.state
    }

    pub fn local_connection_id(&self) -> &ConnectionId {
        &self.core.local_cid
    }

    pub fn remote_connection_id(&self) -> Option<&ConnectionId> {
        self.core.remote_cid.as_ref()
    }

    pub fn token(&self) -> Option<&Bytes> {
        self.core.token.as_ref()
    }
}

/// The client handshake state machine: owns the TLS session and drives
/// `BeforeInitial -> BeforeHello -> BeforeHandshake -> Ready`.
struct ClientStateMachine {
    tls: ClientTlsSession,
    /// Only the first Retry is honored.
    retried: bool,
}

impl ClientStateMachine {
    fn new(tls: ClientTlsSession) -> Self {
        Self { tls, retried: false }
    }

    /// Send the first Initial packet.
    fn start(&mut self, ctx: &mut PipelineContext) -> Result<()> {
        let hello = self.tls.start_handshake()?;
        ctx.send_frames_at(initial_flight(hello), EncryptionLevel::Initial);
        ctx.set_state(State::BeforeHello);
        info!("client initial sent");
        Ok(())
    }

    fn on_server_hello(&mut self, packet_scid: Option<&ConnectionId>, payload_frames: &[Frame], ctx: &mut PipelineContext) {
        let Some(scid) = packet_scid else {
            warn!("initial packet without source connection ID");
            return;
        };
        // The server's source connection ID becomes the permanent remote.
        ctx.set_remote_connection_id(scid.clone());

        for frame in payload_frames {
            if let Frame::Crypto(crypto) = frame {
                match self.tls.handle_server_hello(&crypto.data) {
                    Ok(aead) => {
                        ctx.install_handshake_aead(aead);
                        ctx.set_state(State::BeforeHandshake);
                    }
                    Err(err) => {
                        warn!(%err, "ServerHello processing failed");
                        ctx.close_connection(
                            err.transport_error(),
                            FRAME_TYPE_CRYPTO,
                            "TLS handshake failure",
                        );
                        return;
                    }
                }
            }
        }
    }

    fn on_retry(&mut self, scid: Option<&ConnectionId>, token: &Bytes, ctx: &mut PipelineContext) {
        if self.retried {
            debug!("ignoring second retry");
            return;
        }
        let Some(scid) = scid else {
            warn!("retry packet without source connection ID");
            return;
        };
        self.retried = true;

        ctx.set_remote_connection_id(scid.clone());
        ctx.reset_send_packet_number();
        ctx.set_token(token.clone());
        ctx.reset_initial_aead();

        self.tls.reset();
        match self.tls.start_handshake() {
            Ok(hello) => ctx.send_frames_at(initial_flight(hello), EncryptionLevel::Initial),
            Err(err) => {
                warn!(%err, "TLS restart after retry failed");
                ctx.close_connection(err.transport_error(), FRAME_TYPE_CRYPTO, "TLS failure");
            }
        }
    }

    fn on_handshake(&mut self, payload_frames: &[Frame], ctx: &mut PipelineContext) {
        for frame in payload_frames {
            if let Frame::Crypto(crypto) = frame {
                match self.tls.handle_handshake(&crypto.data) {
                    Ok(Some(result)) => {
                        ctx.install_one_rtt_aead(result.one_rtt);
                        ctx.send_frames_at(
                            vec![Frame::Crypto(CryptoFrame::new(0, result.finished))],
                            EncryptionLevel::Handshake,
                        );
                        ctx.set_state(State::Ready);
                        if let Some(params) = self.tls.peer_transport_parameters() {
                            ctx.peer_parameters(params.clone());
                        }
                        ctx.complete_handshake();
                        info!("client handshake complete");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, "server handshake processing failed");
                        ctx.close_connection(
                            err.transport_error(),
                            FRAME_TYPE_CRYPTO,
                            "TLS handshake failure",
                        );
                        return;
                    }
                }
            }
        }
    }

    fn on_application_frames(&mut self, payload_frames: &[Frame], ctx: &mut PipelineContext) {
        for frame in payload_frames {
            match frame {
                Frame::Ping => {} // acknowledged by the packet buffer
                Frame::ConnectionClose(close) => {
                    debug!(error_code = close.error_code, "peer closed connection");
                    ctx.set_state(State::Closing);
                    ctx.set_state(State::Closed);
                    ctx.close_silently();
                }
                _ => {}
            }
        }
    }
}

impl InboundHandler for ClientStateMachine {
    fn on_receive_packet(&mut self, packet: &Packet, ctx: &mut PipelineContext) -> Disposition {
        match ctx.state() {
            State::BeforeHello => match packet {
                Packet::Initial(p) => {
                    self.on_server_hello(p.scid.as_ref(), &p.payload.frames, ctx)
                }
                Packet::Retry(p) => self.on_retry(p.scid.as_ref(), &p.token, ctx),
                Packet::VersionNegotiation(p) => {
                    // This endpoint speaks exactly one version.
                    debug!(
                        offered = p.supported_versions.len(),
                        "incompatible versions, closing connection"
                    );
                    ctx.set_state(State::Closing);
                    ctx.set_state(State::Closed);
                    ctx.close_silently();
                    return Disposition::Stop;
                }
                other => {
                    warn!(?other, "unexpected packet in BeforeHello");
                }
            },
            State::BeforeHandshake => match packet {
                Packet::Handshake(p) => self.on_handshake(&p.payload.frames, ctx),
                other => {
                    warn!(?other, "unexpected packet in BeforeHandshake");
                }
            },
            State::Ready | State::Closing | State::Closed => {
                if let Some(payload) = packet.payload() {
                    self.on_application_frames(&payload.frames, ctx);
                }
            }
            state => {
                warn!(?state, "dropping packet in unexpected state");
                return Disposition::Stop;
            }
        }
        Disposition::Continue
    }
}

/// CRYPTO(ClientHello) padded so the Initial payload reaches the
/// 1200-byte anti-amplification floor.
fn initial_flight(hello: Bytes) -> Vec<Frame> {
    let crypto = Frame::Crypto(CryptoFrame::new(0, hello));
    let padding = MIN_INITIAL_PAYLOAD.saturating_sub(crypto.encoded_len());
    vec![crypto, Frame::Padding(padding)]
}
