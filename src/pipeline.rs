//! The per-connection handler pipeline.
//!
//! Inbound packets traverse an ordered sequence of handlers; outbound
//! packets traverse the reverse subset that intercepts sends. Handlers
//! never touch the connection directly: they queue actions on the
//! context, and the connection applies them in order after the handler
//! runs. That keeps every handler a plain `&mut self` method while still
//! letting a stage emit packets, install keys, or change state
//! mid-traversal.

use crate::connection::State;
use crate::crypto::{Aead, EncryptionLevel};
use crate::error::TransportError;
use crate::frames::Frame;
use crate::packet::Packet;
use crate::types::ConnectionId;
use bytes::Bytes;
use std::net::SocketAddr;

/// Whether the packet continues down the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The handler consumed the packet; later stages do not see it.
    Stop,
}

/// Connection mutations queued by handlers.
pub enum Action {
    /// Wrap frames in a packet and send it. `level` pins the encryption
    /// level; `None` selects the highest level available when applied.
    SendFrames { frames: Vec<Frame>, level: Option<EncryptionLevel> },
    /// Send a pre-built unencrypted packet (Retry, Version Negotiation).
    SendPacket(Packet),
    InstallHandshakeAead(Aead),
    InstallOneRttAead(Aead),
    /// Re-derive the Initial AEAD from the current remote connection ID
    /// (after a Retry changed it).
    ResetInitialAead,
    SetState(State),
    SetRemoteConnectionId(ConnectionId),
    SetToken(Bytes),
    ResetSendPacketNumber,
    /// Hand the peer's transport parameters to the connection (flow
    /// control limits, idle timeout).
    PeerParameters(crate::transport::TransportParameters),
    /// Resolve the handshake future with success.
    CompleteHandshake,
    /// Send CONNECTION_CLOSE and tear the connection down.
    Close { error: TransportError, frame_type: u64, reason: String },
    /// Tear down without sending CONNECTION_CLOSE (peer already closed,
    /// or an unrecoverable local condition).
    CloseSilently,
    /// Emit an ACK-only packet at `level` if acknowledgments are pending
    /// there once all earlier actions have been applied.
    FlushAcks(EncryptionLevel),
}

/// Context handed to every handler invocation.
pub struct PipelineContext {
    state: State,
    peer_address: SocketAddr,
    actions: Vec<Action>,
}

impl PipelineContext {
    pub fn new(state: State, peer_address: SocketAddr) -> Self {
        Self { state, peer_address, actions: Vec::new() }
    }

    /// Connection state as seen by this pipeline pass, including changes
    /// made by earlier handlers in the same pass.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
        self.actions.push(Action::SetState(state));
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    /// Queue frames for sending at the highest available level.
    pub fn send_frames(&mut self, frames: Vec<Frame>) {
        self.actions.push(Action::SendFrames { frames, level: None });
    }

    /// Queue frames for sending at a pinned level.
    pub fn send_frames_at(&mut self, frames: Vec<Frame>, level: EncryptionLevel) {
        self.actions.push(Action::SendFrames { frames, level: Some(level) });
    }

    /// Queue a pre-built unencrypted packet.
    pub fn send_packet(&mut self, packet: Packet) {
        self.actions.push(Action::SendPacket(packet));
    }

    /// Close the connection with a CONNECTION_CLOSE frame.
    pub fn close_connection(&mut self, error: TransportError, frame_type: u64, reason: &str) {
        self.actions.push(Action::Close { error, frame_type, reason: reason.to_owned() });
    }

    /// Close the connection without sending anything.
    pub fn close_silently(&mut self) {
        self.actions.push(Action::CloseSilently);
    }

    pub fn install_handshake_aead(&mut self, aead: Aead) {
        self.actions.push(Action::InstallHandshakeAead(aead));
    }

    pub fn install_one_rtt_aead(&mut self, aead: Aead) {
        self.actions.push(Action::InstallOneRttAead(aead));
    }

    pub fn reset_initial_aead(&mut self) {
        self.actions.push(Action::ResetInitialAead);
    }

    pub fn set_remote_connection_id(&mut self, cid: ConnectionId) {
        self.actions.push(Action::SetRemoteConnectionId(cid));
    }

    pub fn set_token(&mut self, token: Bytes) {
        self.actions.push(Action::SetToken(token));
    }

    pub fn reset_send_packet_number(&mut self) {
        self.actions.push(Action::ResetSendPacketNumber);
    }

    pub fn peer_parameters(&mut self, params: crate::transport::TransportParameters) {
        self.actions.push(Action::PeerParameters(params));
    }

    pub fn complete_handshake(&mut self) {
        self.actions.push(Action::CompleteHandshake);
    }

    pub fn flush_acks(&mut self, level: EncryptionLevel) {
        self.actions.push(Action::FlushAcks(level));
    }

    /// Drain the queued actions for the connection to apply.
    pub(crate) fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

/// A stage on the inbound path.
///
/// Errors never propagate to the datagram reader: a handler that hits a
/// fatal condition queues a close on the context instead.
pub trait InboundHandler {
    fn on_receive_packet(&mut self, packet: &Packet, ctx: &mut PipelineContext) -> Disposition;
}

/// A stage on the outbound path. The packet is mutable so stages can
/// inject frames (flow-control updates, pending acknowledgments).
pub trait OutboundHandler {
    fn before_send_packet(&mut self, packet: &mut Packet, ctx: &mut PipelineContext)
        -> Disposition;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> PipelineContext {
        PipelineContext::new(State::Ready, "127.0.0.1:4433".parse().unwrap())
    }

    #[test]
    fn set_state_is_visible_to_later_handlers() {
        let mut ctx = test_ctx();
        ctx.set_state(State::Closing);
        assert_eq!(ctx.state(), State::Closing);
        assert_eq!(ctx.take_actions().len(), 1);
    }

    #[test]
    fn actions_preserve_order() {
        let mut ctx = test_ctx();
        ctx.send_frames(vec![Frame::Ping]);
        ctx.set_state(State::Closed);
        ctx.close_silently();

        let actions = ctx.take_actions();
        assert!(matches!(actions[0], Action::SendFrames { .. }));
        assert!(matches!(actions[1], Action::SetState(State::Closed)));
        assert!(matches!(actions[2], Action::CloseSilently));
        assert!(ctx.take_actions().is_empty());
    }
}
