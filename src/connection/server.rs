//! Server connection and state machine.

use super::{ConnectionCore, PacketSender, State};
use crate::config::Configuration;
use crate::crypto::EncryptionLevel;
use crate::error::Result;
use crate::flow_control::FlowControlHandler;
use crate::frames::{CryptoFrame, Frame, ResetStreamFrame, StreamFrame, FRAME_TYPE_CRYPTO};
use crate::packet::Packet;
use crate::pipeline::{Disposition, InboundHandler, PipelineContext};
use crate::server::RetryHandler;
use crate::stream::{StreamListener, StreamManager};
use crate::tls::ServerTlsSession;
use crate::types::{ConnectionId, Side, StreamDirection, StreamId};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Server endpoint for one connection.
///
/// Created when the datagram reader routes the first Initial for a new
/// connection ID here. `local_cid` is the ID the client addresses, so
/// the Initial AEAD derives from it.
pub struct ServerConnection {
    core: ConnectionCore,
    retry: RetryHandler,
    machine: ServerStateMachine,
    streams: StreamManager,
}

impl ServerConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Configuration,
        local_cid: ConnectionId,
        stream_listener: Arc<dyn StreamListener>,
        sender: Box<dyn PacketSender>,
        flow_control: Box<dyn FlowControlHandler>,
        peer_address: SocketAddr,
        certificate_chain: Vec<Bytes>,
        private_key: [u8; 32],
        require_address_validation: bool,
    ) -> Self {
        let tls = ServerTlsSession::new(
            config.version,
            config.transport_parameters(),
            certificate_chain,
            private_key,
        );
        let retry = RetryHandler::new(
            &private_key,
            config.version,
            local_cid.clone(),
            require_address_validation,
        );
        let core = ConnectionCore::new(
            Side::Server,
            config.version,
            local_cid.clone(),
            None,
            &local_cid,
            sender,
            flow_control,
            peer_address,
            config.max_idle_timeout,
            State::Started,
        );
        Self {
            core,
            retry,
            machine: ServerStateMachine::new(tls),
            streams: StreamManager::new(Side::Server, stream_listener),
        }
    }

    /// Inbound entry point for a parsed packet.
    pub fn on_packet(&mut self, packet: Packet) {
        self.core.last_activity = Instant::now();
        let mut ctx = PipelineContext::new(self.core.state, self.core.peer_address);

        let mut disposition = self.retry.on_receive_packet(&packet, &mut ctx);
        if disposition == Disposition::Continue {
            disposition = self.machine.on_receive_packet(&packet, &mut ctx);
        }
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

    /// Inbound entry point for a raw datagram.
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

    pub fn open_stream(&mut self, direction: StreamDirection) -> Result<StreamId> {
        self.core.check_send_allowed()?;
        Ok(self.streams.open_stream(direction))
    }

    pub fn write_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        self.core.check_send_allowed()?;
        let offset = self.streams.reserve_send(id, data.len(), fin)?;
        self.send(vec![Frame::Stream(StreamFrame::new(id, offset, fin, data))])
    }

    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        self.core.check_send_allowed()?;
        let final_size = self.streams.send_offset(id).unwrap_or(0);
        self.send(vec![Frame::ResetStream(ResetStreamFrame {
            stream_id: id,
            error_code,
            final_size,
        })])
    }

    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    pub fn on_timeout(&mut self, now: Instant) {
        self.core.on_timeout(now);
    }

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
}

/// The server handshake state machine:
/// `Started -> BeforeReady -> Ready`.
struct ServerStateMachine {
    tls: ServerTlsSession,
}

impl ServerStateMachine {
    fn new(tls: ServerTlsSession) -> Self {
        Self { tls }
    }

    fn on_client_hello(
        &mut self,
        packet_scid: Option<&ConnectionId>,
        payload_frames: &[Frame],
        ctx: &mut PipelineContext,
    ) {
        // The client's source connection ID is fixed as the remote for
        // the rest of the connection.
        if let Some(scid) = packet_scid {
            ctx.set_remote_connection_id(scid.clone());
        }

        for frame in payload_frames {
            if let Frame::Crypto(crypto) = frame {
                match self.tls.handle_client_hello(&crypto.data) {
                    Ok(shah) => {
                        // ServerHello leaves at the Initial level before
                        // the handshake keys exist; the flight follows
                        // once they are installed.
                        ctx.send_frames_at(
                            vec![Frame::Crypto(CryptoFrame::new(0, shah.server_hello))],
                            EncryptionLevel::Initial,
                        );
                        ctx.install_handshake_aead(shah.handshake_aead);
                        ctx.send_frames_at(
                            vec![Frame::Crypto(CryptoFrame::new(0, shah.server_handshake))],
                            EncryptionLevel::Handshake,
                        );
                        ctx.install_one_rtt_aead(shah.one_rtt_aead);
                        ctx.set_state(State::BeforeReady);
                        info!("server hello and handshake flight sent");
                    }
                    Err(err) => {
                        warn!(%err, "ClientHello processing failed");
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

    fn on_client_finished(&mut self, payload_frames: &[Frame], ctx: &mut PipelineContext) {
        for frame in payload_frames {
            if let Frame::Crypto(crypto) = frame {
                match self.tls.handle_client_finished(&crypto.data) {
                    Ok(()) => {
                        ctx.set_state(State::Ready);
                        if let Some(params) = self.tls.peer_transport_parameters() {
                            ctx.peer_parameters(params.clone());
                        }
                        info!("server handshake complete");
                    }
                    Err(err) => {
                        warn!(%err, "client Finished processing failed");
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
                Frame::Ping => {}
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

impl InboundHandler for ServerStateMachine {
    fn on_receive_packet(&mut self, packet: &Packet, ctx: &mut PipelineContext) -> Disposition {
        match ctx.state() {
            State::Started => match packet {
                Packet::Initial(p) => {
                    self.on_client_hello(p.scid.as_ref(), &p.payload.frames, ctx)
                }
                other => {
                    warn!(?other, "unexpected packet in Started");
                    return Disposition::Stop;
                }
            },
            State::BeforeReady => {
                if let Some(payload) = packet.payload() {
                    self.on_client_finished(&payload.frames, ctx);
                } else {
                    warn!("unnumbered packet in BeforeReady");
                    return Disposition::Stop;
                }
            }
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
