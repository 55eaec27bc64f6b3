//! Stream lifecycle and delivery.

use super::buffer::ReceiveBuffer;
use super::StreamListener;
use crate::connection::State;
use crate::error::{Error, Result, TransportError};
use crate::frames::{Frame, ResetStreamFrame, StreamFrame, FRAME_TYPE_STREAM_BASE};
use crate::packet::Packet;
use crate::pipeline::{Disposition, InboundHandler, PipelineContext};
use crate::types::{Side, StreamDirection, StreamId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Per-stream state: reassembly on the receive side, an offset counter
/// on the send side.
pub struct Stream {
    id: StreamId,
    recv: ReceiveBuffer,
    send_offset: u64,
    fin_sent: bool,
    fin_delivered: bool,
    /// Error code from a RESET_STREAM, if the peer aborted.
    aborted: Option<u64>,
}

impl Stream {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            recv: ReceiveBuffer::new(),
            send_offset: 0,
            fin_sent: false,
            fin_delivered: false,
            aborted: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Reserve `len` bytes of send offset, sealing the stream if `fin`.
    fn reserve_send(&mut self, len: usize, fin: bool) -> Result<u64> {
        if self.fin_sent || self.aborted.is_some() {
            return Err(Error::InvalidState);
        }
        let offset = self.send_offset;
        self.send_offset += len as u64;
        if fin {
            self.fin_sent = true;
        }
        Ok(offset)
    }

    /// The stream is finished once FIN has been delivered or it was
    /// aborted; it stays addressable for outbound accounting only.
    pub fn is_terminated(&self) -> bool {
        self.fin_delivered || self.aborted.is_some()
    }
}

/// Owns the `StreamId -> Stream` map; creates streams on first
/// reference, reassembles STREAM frames and delivers ordered bytes to
/// the listener.
pub struct StreamManager {
    side: Side,
    listener: Arc<dyn StreamListener>,
    streams: BTreeMap<StreamId, Stream>,
    next_bidi_index: u64,
    next_uni_index: u64,
}

impl StreamManager {
    pub fn new(side: Side, listener: Arc<dyn StreamListener>) -> Self {
        Self { side, listener, streams: BTreeMap::new(), next_bidi_index: 0, next_uni_index: 0 }
    }

    /// Open a locally-initiated stream with the initiator/type bits set
    /// for this side.
    pub fn open_stream(&mut self, direction: StreamDirection) -> StreamId {
        let bidirectional = direction == StreamDirection::Bidirectional;
        let index = if bidirectional {
            let i = self.next_bidi_index;
            self.next_bidi_index += 1;
            i
        } else {
            let i = self.next_uni_index;
            self.next_uni_index += 1;
            i
        };
        let id = StreamId::build(index, self.side.is_client(), bidirectional);
        self.streams.insert(id, Stream::new(id));
        id
    }

    /// Reserve the send offset for outbound bytes on `id`, creating the
    /// stream if this is its first reference.
    pub fn reserve_send(&mut self, id: StreamId, len: usize, fin: bool) -> Result<u64> {
        self.streams.entry(id).or_insert_with(|| Stream::new(id)).reserve_send(len, fin)
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Current send offset of a stream (the final size when resetting).
    pub fn send_offset(&self, id: StreamId) -> Option<u64> {
        self.streams.get(&id).map(|s| s.send_offset)
    }

    fn handle_stream_frame(&mut self, frame: &StreamFrame, ctx: &mut PipelineContext) {
        let stream =
            self.streams.entry(frame.stream_id).or_insert_with(|| Stream::new(frame.stream_id));

        if stream.aborted.is_some() {
            debug!(stream_id = frame.stream_id.value(), "dropping data for reset stream");
            return;
        }

        if let Err(err) = stream.recv.insert(frame.offset, frame.data.clone(), frame.fin) {
            debug!(stream_id = frame.stream_id.value(), %err, "stream reassembly failed");
            ctx.close_connection(
                TransportError::ProtocolViolation,
                FRAME_TYPE_STREAM_BASE,
                "invalid stream data",
            );
            return;
        }

        for (data, fin) in stream.recv.drain() {
            if fin {
                stream.fin_delivered = true;
            }
            self.listener.on_data(frame.stream_id, data, fin);
        }

        // A bare FIN at the delivery offset carries no bytes but still
        // ends the stream.
        if frame.fin && !stream.fin_delivered && stream.recv.is_finished() {
            stream.fin_delivered = true;
            self.listener.on_data(frame.stream_id, bytes::Bytes::new(), true);
        }
    }

    fn handle_reset(&mut self, frame: &ResetStreamFrame) {
        let stream =
            self.streams.entry(frame.stream_id).or_insert_with(|| Stream::new(frame.stream_id));
        if stream.aborted.is_some() {
            return;
        }
        stream.aborted = Some(frame.error_code);
        stream.recv.clear();
        self.listener.on_reset(frame.stream_id, frame.error_code);
    }
}

impl InboundHandler for StreamManager {
    fn on_receive_packet(&mut self, packet: &Packet, ctx: &mut PipelineContext) -> Disposition {
        // Stream frames only flow once the handshake is done.
        if ctx.state() != State::Ready {
            return Disposition::Continue;
        }
        let Some(payload) = packet.payload() else {
            return Disposition::Continue;
        };

        for frame in &payload.frames {
            match frame {
                Frame::Stream(stream_frame) => self.handle_stream_frame(stream_frame, ctx),
                Frame::ResetStream(reset) => self.handle_reset(reset),
                _ => {}
            }
        }
        Disposition::Continue
    }
}
