//! Flow-control hooks.
//!
//! The pipeline invokes `before_send_packet` ahead of every outbound
//! packet and `on_receive_packet` after every inbound one. The windowed
//! implementation does plain credit accounting; the mock is a no-op for
//! tests and for embeddings that do their own accounting.

use crate::frames::{Frame, MaxDataFrame, MaxStreamDataFrame};
use crate::packet::Packet;
use crate::pipeline::{Disposition, InboundHandler, OutboundHandler, PipelineContext};
use crate::transport::TransportParameters;
use crate::types::StreamId;
use std::collections::BTreeMap;
use tracing::warn;

/// Credit accounting hook invoked around every packet.
pub trait FlowControlHandler: InboundHandler + OutboundHandler + Send {
    /// Adopt the peer's advertised limits once the handshake delivers
    /// its transport parameters.
    fn set_peer_parameters(&mut self, params: &TransportParameters) {
        let _ = params;
    }
}

/// No-op flow control.
#[derive(Default)]
pub struct MockFlowControlHandler;

impl InboundHandler for MockFlowControlHandler {
    fn on_receive_packet(&mut self, _packet: &Packet, _ctx: &mut PipelineContext) -> Disposition {
        Disposition::Continue
    }
}

impl OutboundHandler for MockFlowControlHandler {
    fn before_send_packet(&mut self, _packet: &mut Packet, _ctx: &mut PipelineContext)
        -> Disposition {
        Disposition::Continue
    }
}

impl FlowControlHandler for MockFlowControlHandler {}

/// Windowed credit accounting.
///
/// Receive side: counts stream bytes and re-opens the connection and
/// stream windows with MAX_DATA / MAX_STREAM_DATA once half the window
/// is consumed. Send side: refuses packets that would overrun the
/// peer's advertised credit.
pub struct WindowedFlowControlHandler {
    /// Connection-level window we grant the peer.
    local_max_data: u64,
    /// Window size used when replenishing.
    window: u64,
    /// Stream-level window we grant per stream.
    local_max_stream_data: u64,
    /// Total stream bytes received.
    received: u64,
    received_per_stream: BTreeMap<StreamId, u64>,
    /// Peer's connection-level grant to us.
    peer_max_data: u64,
    peer_max_stream_data: BTreeMap<StreamId, u64>,
    peer_default_stream_window: u64,
    /// Total stream bytes sent.
    sent: u64,
}

impl WindowedFlowControlHandler {
    pub fn new(local_params: &TransportParameters) -> Self {
        Self {
            local_max_data: local_params.initial_max_data,
            window: local_params.initial_max_data,
            local_max_stream_data: local_params.initial_max_stream_data_bidi_remote,
            received: 0,
            received_per_stream: BTreeMap::new(),
            peer_max_data: 0,
            peer_max_stream_data: BTreeMap::new(),
            peer_default_stream_window: 0,
            sent: 0,
        }
    }
}

impl FlowControlHandler for WindowedFlowControlHandler {
    fn set_peer_parameters(&mut self, params: &TransportParameters) {
        self.peer_max_data = params.initial_max_data;
        self.peer_default_stream_window = params.initial_max_stream_data_bidi_remote;
    }
}

impl InboundHandler for WindowedFlowControlHandler {
    fn on_receive_packet(&mut self, packet: &Packet, ctx: &mut PipelineContext) -> Disposition {
        let Some(payload) = packet.payload() else {
            return Disposition::Continue;
        };

        let mut updates = Vec::new();
        for frame in &payload.frames {
            match frame {
                Frame::Stream(stream) => {
                    self.received += stream.data.len() as u64;
                    let per_stream =
                        self.received_per_stream.entry(stream.stream_id).or_insert(0);
                    *per_stream += stream.data.len() as u64;

                    if self.local_max_data > 0 && self.received * 2 >= self.local_max_data {
                        self.local_max_data += self.window;
                        updates.push(Frame::MaxData(MaxDataFrame {
                            maximum_data: self.local_max_data,
                        }));
                    }
                    if self.local_max_stream_data > 0
                        && *per_stream * 2 >= self.local_max_stream_data
                    {
                        updates.push(Frame::MaxStreamData(MaxStreamDataFrame {
                            stream_id: stream.stream_id,
                            maximum_stream_data: *per_stream + self.local_max_stream_data,
                        }));
                    }
                }
                Frame::MaxData(max) => {
                    if max.maximum_data > self.peer_max_data {
                        self.peer_max_data = max.maximum_data;
                    }
                }
                Frame::MaxStreamData(max) => {
                    let entry = self
                        .peer_max_stream_data
                        .entry(max.stream_id)
                        .or_insert(self.peer_default_stream_window);
                    if max.maximum_stream_data > *entry {
                        *entry = max.maximum_stream_data;
                    }
                }
                _ => {}
            }
        }

        if !updates.is_empty() {
            ctx.send_frames(updates);
        }
        Disposition::Continue
    }
}

impl OutboundHandler for WindowedFlowControlHandler {
    fn before_send_packet(&mut self, packet: &mut Packet, _ctx: &mut PipelineContext)
        -> Disposition {
        let Some(payload) = packet.payload() else {
            return Disposition::Continue;
        };

        let outgoing: u64 = payload
            .frames
            .iter()
            .filter_map(|f| match f {
                Frame::Stream(s) => Some(s.data.len() as u64),
                _ => None,
            })
            .sum();

        if outgoing > 0 && self.sent + outgoing > self.peer_max_data {
            warn!(
                sent = self.sent,
                outgoing,
                peer_max_data = self.peer_max_data,
                "flow control credit exhausted, deferring packet"
            );
            return Disposition::Stop;
        }

        self.sent += outgoing;
        Disposition::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::State;
    use crate::frames::StreamFrame;
    use crate::packet::ShortPacket;
    use bytes::Bytes;

    fn ctx() -> PipelineContext {
        PipelineContext::new(State::Ready, "127.0.0.1:4433".parse().unwrap())
    }

    fn handler(window: u64, peer_window: u64) -> WindowedFlowControlHandler {
        let local = TransportParameters { initial_max_data: window, ..Default::default() };
        let peer = TransportParameters { initial_max_data: peer_window, ..Default::default() };
        let mut h = WindowedFlowControlHandler::new(&local);
        h.set_peer_parameters(&peer);
        h
    }

    fn stream_packet(len: usize) -> Packet {
        ShortPacket::create(
            false,
            None,
            1,
            vec![Frame::Stream(StreamFrame::new(
                StreamId::new(0),
                0,
                false,
                Bytes::from(vec![0u8; len]),
            ))],
        )
    }

    #[test]
    fn max_data_emitted_at_half_window() {
        let mut h = handler(100, 1000);
        let mut c = ctx();

        h.on_receive_packet(&stream_packet(10), &mut c);
        assert!(c.take_actions().is_empty());

        h.on_receive_packet(&stream_packet(45), &mut c);
        let actions = c.take_actions();
        assert!(!actions.is_empty());
    }

    #[test]
    fn send_blocked_beyond_peer_credit() {
        let mut h = handler(1000, 20);
        let mut c = ctx();

        let mut ok = stream_packet(15);
        assert_eq!(h.before_send_packet(&mut ok, &mut c), Disposition::Continue);

        let mut blocked = stream_packet(10);
        assert_eq!(h.before_send_packet(&mut blocked, &mut c), Disposition::Stop);
    }

    #[test]
    fn peer_max_data_raises_credit() {
        let mut h = handler(1000, 20);
        let mut c = ctx();

        let raise = ShortPacket::create(
            false,
            None,
            2,
            vec![Frame::MaxData(MaxDataFrame { maximum_data: 50 })],
        );
        h.on_receive_packet(&raise, &mut c);

        let mut packet = stream_packet(40);
        assert_eq!(h.before_send_packet(&mut packet, &mut c), Disposition::Continue);
    }

    #[test]
    fn mock_is_a_no_op() {
        let mut h = MockFlowControlHandler;
        let mut c = ctx();
        let mut packet = stream_packet(1_000_000);
        assert_eq!(h.before_send_packet(&mut packet, &mut c), Disposition::Continue);
        h.on_receive_packet(&packet, &mut c);
        assert!(c.take_actions().is_empty());
    }
}
