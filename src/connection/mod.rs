//! Connection shells for the client and server roles.
//!
//! Both roles share [`ConnectionCore`]: identifiers, the AEAD set, the
//! packet buffer, flow control, the outbound send path and the action
//! applier. The role-specific state machines live in [`client`] and
//! [`server`].
//!
//! Concurrency: a connection is a single-threaded cooperative unit. The
//! caller must serialize `on_packet` invocations; no internal locking is
//! performed.

pub mod client;
pub mod server;

#[cfg(test)]
mod tests;

pub use client::ClientConnection;
pub use server::ServerConnection;

use crate::crypto::initial::initial_aead;
use crate::crypto::{Aead, AeadSet, EncryptionLevel};
use crate::error::{Error, Result, TransportError};
use crate::frames::{ConnectionCloseFrame, Frame};
use crate::packet::{HandshakePacket, InitialPacket, Packet, ShortPacket};
use crate::pipeline::{Action, Disposition, OutboundHandler, PipelineContext};
use crate::flow_control::FlowControlHandler;
use crate::packet::PacketBuffer;
use crate::types::{next_packet_number, ConnectionId, PacketNumber, Side, PACKET_NUMBER_INITIAL};
use crate::version::Version;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Connection states. The union of the client path
/// (`BeforeInitial -> BeforeHello -> BeforeHandshake -> Ready`) and the
/// server path (`Started -> BeforeReady -> Ready`), converging on
/// `Ready -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    BeforeInitial,
    BeforeHello,
    BeforeHandshake,
    Started,
    BeforeReady,
    Ready,
    Closing,
    Closed,
}

/// Capability that writes an encrypted packet towards the peer.
///
/// May be shared across connections; implementations must tolerate
/// concurrent `send` calls.
pub trait PacketSender: Send + Sync {
    fn send(&self, packet: &Packet, aead: &Aead) -> Result<()>;
    fn destroy(&self) -> Result<()>;
}

/// One-shot handle resolved when the handshake reaches Ready, or failed
/// when the connection closes first.
pub type HandshakeFuture = oneshot::Receiver<Result<()>>;

/// Role-independent connection machinery.
pub(crate) struct ConnectionCore {
    pub side: Side,
    pub version: Version,
    pub local_cid: ConnectionId,
    pub remote_cid: Option<ConnectionId>,
    pub token: Option<Bytes>,
    pub state: State,
    pub aeads: AeadSet,
    pub peer_address: SocketAddr,
    pub sender: Box<dyn PacketSender>,
    pub packet_buffer: PacketBuffer,
    pub flow_control: Box<dyn FlowControlHandler>,
    pub handshake_tx: Option<oneshot::Sender<Result<()>>>,
    pub idle_timeout: Duration,
    pub last_activity: Instant,
    send_packet_number: PacketNumber,
    destroyed: bool,
}

impl ConnectionCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        side: Side,
        version: Version,
        local_cid: ConnectionId,
        remote_cid: Option<ConnectionId>,
        initial_aead_cid: &ConnectionId,
        sender: Box<dyn PacketSender>,
        flow_control: Box<dyn FlowControlHandler>,
        peer_address: SocketAddr,
        idle_timeout: Duration,
        state: State,
    ) -> Self {
        Self {
            side,
            version,
            local_cid,
            remote_cid,
            token: None,
            state,
            aeads: AeadSet::new(initial_aead(initial_aead_cid, side)),
            peer_address,
            sender,
            packet_buffer: PacketBuffer::new(),
            flow_control,
            handshake_tx: None,
            idle_timeout,
            last_activity: Instant::now(),
            send_packet_number: PACKET_NUMBER_INITIAL,
            destroyed: false,
        }
    }

    pub fn next_send_packet_number(&mut self) -> PacketNumber {
        self.send_packet_number = next_packet_number(self.send_packet_number);
        self.send_packet_number
    }

    /// Apply every action handlers queued during a pipeline pass.
    /// Outbound interception may queue further actions; the loop runs
    /// until the queue is dry. Sender teardown is terminal and happens
    /// last regardless of queue position.
    pub fn process_actions(&mut self, ctx: &mut PipelineContext) {
        let mut destroy = false;
        loop {
            let actions = ctx.take_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.apply(action, ctx, &mut destroy);
            }
        }
        if destroy && !self.destroyed {
            self.destroyed = true;
            if let Err(err) = self.sender.destroy() {
                warn!(%err, "packet sender teardown failed");
            }
        }
    }

    fn apply(&mut self, action: Action, ctx: &mut PipelineContext, destroy: &mut bool) {
        match action {
            Action::SendFrames { frames, level } => {
                self.send_frames(frames, level, ctx);
            }
            Action::SendPacket(packet) => {
                self.send_unbuffered(&packet);
            }
            Action::InstallHandshakeAead(aead) => {
                if self.aeads.set_handshake(aead).is_err() {
                    warn!("handshake keys already installed");
                }
            }
            Action::InstallOneRttAead(aead) => {
                if self.aeads.set_one_rtt(aead).is_err() {
                    warn!("1-RTT keys already installed");
                }
            }
            Action::ResetInitialAead => match &self.remote_cid {
                Some(cid) => {
                    if self.aeads.reset_initial(initial_aead(cid, self.side)).is_err() {
                        warn!("initial keys can no longer be replaced");
                    }
                }
                None => warn!("no remote connection ID to derive initial keys from"),
            },
            Action::SetState(state) => self.set_state(state),
            Action::SetRemoteConnectionId(cid) => self.remote_cid = Some(cid),
            Action::SetToken(token) => self.token = Some(token),
            Action::ResetSendPacketNumber => self.send_packet_number = PACKET_NUMBER_INITIAL,
            Action::PeerParameters(params) => {
                self.flow_control.set_peer_parameters(&params);
                if params.max_idle_timeout > 0 {
                    let peer = Duration::from_millis(params.max_idle_timeout);
                    self.idle_timeout = self.idle_timeout.min(peer);
                }
            }
            Action::CompleteHandshake => {
                if let Some(tx) = self.handshake_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Action::Close { error, frame_type, reason } => {
                if self.state != State::Closed {
                    let close = Frame::ConnectionClose(ConnectionCloseFrame::transport(
                        error.to_wire(),
                        frame_type,
                        &reason,
                    ));
                    self.send_frames(vec![close], None, ctx);
                    self.set_state(State::Closing);
                    self.set_state(State::Closed);
                }
                *destroy = true;
            }
            Action::CloseSilently => {
                if self.state != State::Closed {
                    self.set_state(State::Closing);
                    self.set_state(State::Closed);
                }
                *destroy = true;
            }
            Action::FlushAcks(level) => {
                if self.packet_buffer.has_pending_acks(level) {
                    self.send_frames(vec![], Some(level), ctx);
                }
            }
        }
    }

    fn set_state(&mut self, state: State) {
        debug!(?state, "connection state transition");
        self.state = state;
        if state == State::Closed {
            if let Some(tx) = self.handshake_tx.take() {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
    }

    /// Wrap frames at `level` (or the highest installed level), run the
    /// outbound interceptors and hand the packet to the sender.
    pub fn send_frames(
        &mut self,
        frames: Vec<Frame>,
        level: Option<EncryptionLevel>,
        ctx: &mut PipelineContext,
    ) {
        let level = level.unwrap_or_else(|| self.aeads.highest_level());
        let packet_number = self.next_send_packet_number();

        let mut packet = match level {
            EncryptionLevel::Initial => InitialPacket::create(
                self.remote_cid.clone(),
                Some(self.local_cid.clone()),
                packet_number,
                self.version,
                self.token.clone(),
                frames,
            ),
            EncryptionLevel::Handshake => HandshakePacket::create(
                self.remote_cid.clone(),
                Some(self.local_cid.clone()),
                packet_number,
                self.version,
                frames,
            ),
            EncryptionLevel::OneRtt => {
                ShortPacket::create(false, self.remote_cid.clone(), packet_number, frames)
            }
        };

        // Outbound pipeline: flow control, then the packet buffer (which
        // injects pending acknowledgments and retains the packet).
        if self.flow_control.before_send_packet(&mut packet, ctx) == Disposition::Stop {
            debug!(packet_number, "outbound packet deferred by flow control");
            return;
        }
        if self.packet_buffer.before_send_packet(&mut packet, ctx) == Disposition::Stop {
            return;
        }

        if packet.payload().map_or(true, |p| p.frames.is_empty()) {
            return;
        }
        self.send_unbuffered(&packet);
    }

    /// Hand a packet to the sender without interception (Retry, Version
    /// Negotiation, and packets already intercepted).
    fn send_unbuffered(&mut self, packet: &Packet) {
        let level = packet.encryption_level().unwrap_or(EncryptionLevel::Initial);
        let aead = match self.aeads.get(level) {
            Ok(aead) => aead,
            Err(_) => {
                warn!(?level, "no keys installed for outbound packet");
                return;
            }
        };
        if let Err(err) = self.sender.send(packet, aead) {
            warn!(%err, "packet sender failed");
        }
    }

    /// Public send-path state gate.
    pub fn check_send_allowed(&self) -> Result<()> {
        match self.state {
            State::Closing | State::Closed => Err(Error::InvalidState),
            _ => Ok(()),
        }
    }

    /// Idle-timeout check; closes silently on expiry without emitting
    /// CONNECTION_CLOSE.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == State::Closed {
            return;
        }
        if now.saturating_duration_since(self.last_activity) >= self.idle_timeout {
            debug!("idle timeout expired");
            let mut ctx = PipelineContext::new(self.state, self.peer_address);
            ctx.close_silently();
            self.process_actions(&mut ctx);
        }
    }

    /// Local close: CONNECTION_CLOSE(NO_ERROR), Closing then Closed.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Err(Error::InvalidState);
        }
        let mut ctx = PipelineContext::new(self.state, self.peer_address);
        ctx.close_connection(TransportError::NoError, 0, "Closing connection");
        self.process_actions(&mut ctx);
        Ok(())
    }

    /// Re-emit the frames of every unacknowledged buffered packet at the
    /// current highest encryption level. The retransmission clock that
    /// decides when to call this is the embedder's.
    pub fn retransmit_unacked(&mut self) -> Result<()> {
        self.check_send_allowed()?;
        let frames = self.packet_buffer.unacked_frames();
        if frames.is_empty() {
            return Ok(());
        }
        let mut ctx = PipelineContext::new(self.state, self.peer_address);
        ctx.send_frames(frames);
        self.process_actions(&mut ctx);
        Ok(())
    }
}
