//! Frame variants carried inside numbered packets.
//!
//! Frames own their data as `Bytes` so packets can be retained in the
//! send buffer for retransmission without borrowing from datagram
//! buffers.

use crate::types::{varint_len, PacketNumber, StreamId, VarInt};
use bytes::Bytes;

/// Frame type constants (draft-18 wire values).
pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_TYPE_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;

/// STREAM frame flag bits, encoded in the low bits of the type byte.
pub const STREAM_BIT_FIN: u64 = 0x01;
pub const STREAM_BIT_LEN: u64 = 0x02;
pub const STREAM_BIT_OFF: u64 = 0x04;

/// Inclusive range `[smallest, largest]` of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub smallest: PacketNumber,
    pub largest: PacketNumber,
}

impl AckBlock {
    pub fn new(smallest: PacketNumber, largest: PacketNumber) -> Self {
        debug_assert!(smallest <= largest);
        Self { smallest, largest }
    }

    pub fn contains(&self, pn: PacketNumber) -> bool {
        pn >= self.smallest && pn <= self.largest
    }
}

/// ACK frame: blocks ordered descending, the block holding the largest
/// acknowledged number first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Delay since the largest acknowledged packet was received, in the
    /// units selected by the ack delay exponent.
    pub ack_delay: VarInt,
    /// Acknowledged ranges, descending by `largest`.
    pub blocks: Vec<AckBlock>,
}

impl AckFrame {
    /// Compress an ascending iterator of received packet numbers into
    /// descending ACK blocks.
    pub fn from_packet_numbers<I: IntoIterator<Item = PacketNumber>>(
        ack_delay: VarInt,
        numbers: I,
    ) -> Option<Self> {
        let mut ascending: Vec<AckBlock> = Vec::new();
        for pn in numbers {
            match ascending.last_mut() {
                Some(block) if pn == block.largest + 1 => block.largest = pn,
                _ => ascending.push(AckBlock::new(pn, pn)),
            }
        }
        if ascending.is_empty() {
            return None;
        }
        ascending.reverse();
        Some(Self { ack_delay, blocks: ascending })
    }

    /// Largest packet number acknowledged by this frame.
    pub fn largest_acknowledged(&self) -> PacketNumber {
        self.blocks[0].largest
    }

    /// Whether `pn` is covered by any block.
    pub fn acknowledges(&self, pn: PacketNumber) -> bool {
        self.blocks.iter().any(|b| b.contains(pn))
    }
}

/// CRYPTO frame: TLS handshake bytes at an offset within the level's
/// crypto stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: VarInt,
    pub data: Bytes,
}

impl CryptoFrame {
    pub fn new(offset: VarInt, data: Bytes) -> Self {
        Self { offset, data }
    }
}

/// STREAM frame carrying application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: VarInt,
    pub fin: bool,
    pub data: Bytes,
}

impl StreamFrame {
    pub fn new(stream_id: StreamId, offset: VarInt, fin: bool, data: Bytes) -> Self {
        Self { stream_id, offset, fin, data }
    }
}

/// RESET_STREAM: abrupt termination of the sending side of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
    pub final_size: VarInt,
}

/// MAX_DATA: connection-level flow control credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub maximum_data: VarInt,
}

/// MAX_STREAM_DATA: stream-level flow control credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_stream_data: VarInt,
}

/// MAX_STREAMS: stream count credit for one stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub maximum_streams: VarInt,
    pub bidirectional: bool,
}

/// CONNECTION_CLOSE with the error, the triggering frame type and a
/// reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: VarInt,
    /// Frame type that triggered the close; absent on the application
    /// flavor (0x1d).
    pub frame_type: Option<VarInt>,
    pub reason: Bytes,
}

impl ConnectionCloseFrame {
    /// Transport-level close (type 0x1c).
    pub fn transport(error_code: VarInt, frame_type: VarInt, reason: &str) -> Self {
        Self {
            error_code,
            frame_type: Some(frame_type),
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }
}

/// Discriminated union of the frame types the endpoint core handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// PADDING run of the given length.
    Padding(usize),
    Ping,
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    Crypto(CryptoFrame),
    Stream(StreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    ConnectionClose(ConnectionCloseFrame),
    /// Unrecognized frame type, skipped after the packet is ACKed.
    Unknown(u64),
}

impl Frame {
    /// Whether receipt of this frame obliges the peer to acknowledge the
    /// packet. ACK, PADDING and CONNECTION_CLOSE do not.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Padding(_) | Frame::Ack(_))
    }

    /// Encoded size in bytes, used when padding Initial packets up to the
    /// 1200-byte floor.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding(len) => *len,
            Frame::Ping => 1,
            Frame::Ack(ack) => {
                let largest = ack.largest_acknowledged();
                let first = &ack.blocks[0];
                let mut len = 1
                    + varint_len(largest)
                    + varint_len(ack.ack_delay)
                    + varint_len(ack.blocks.len() as u64 - 1)
                    + varint_len(largest - first.smallest);
                let mut prev_smallest = first.smallest;
                for block in &ack.blocks[1..] {
                    len += varint_len(prev_smallest - block.largest - 2);
                    len += varint_len(block.largest - block.smallest);
                    prev_smallest = block.smallest;
                }
                len
            }
            Frame::ResetStream(f) => {
                1 + varint_len(f.stream_id.value())
                    + varint_len(f.error_code)
                    + varint_len(f.final_size)
            }
            Frame::Crypto(f) => {
                1 + varint_len(f.offset) + varint_len(f.data.len() as u64) + f.data.len()
            }
            Frame::Stream(f) => {
                1 + varint_len(f.stream_id.value())
                    + varint_len(f.offset)
                    + varint_len(f.data.len() as u64)
                    + f.data.len()
            }
            Frame::MaxData(f) => 1 + varint_len(f.maximum_data),
            Frame::MaxStreamData(f) => {
                1 + varint_len(f.stream_id.value()) + varint_len(f.maximum_stream_data)
            }
            Frame::MaxStreams(f) => 1 + varint_len(f.maximum_streams),
            Frame::ConnectionClose(f) => {
                1 + varint_len(f.error_code)
                    + f.frame_type.map(varint_len).unwrap_or(0)
                    + varint_len(f.reason.len() as u64)
                    + f.reason.len()
            }
            Frame::Unknown(ty) => varint_len(*ty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_block_compression() {
        let ack = AckFrame::from_packet_numbers(0, [1, 2, 3, 5, 9, 10]).unwrap();
        assert_eq!(
            ack.blocks,
            vec![AckBlock::new(9, 10), AckBlock::new(5, 5), AckBlock::new(1, 3)]
        );
        assert_eq!(ack.largest_acknowledged(), 10);
        assert!(ack.acknowledges(2));
        assert!(!ack.acknowledges(4));
    }

    #[test]
    fn ack_from_empty_set_is_none() {
        assert!(AckFrame::from_packet_numbers(0, []).is_none());
    }

    #[test]
    fn ack_eliciting() {
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::Crypto(CryptoFrame::new(0, Bytes::from_static(b"x"))).is_ack_eliciting());
        assert!(!Frame::Padding(7).is_ack_eliciting());
        assert!(!Frame::Ack(AckFrame::from_packet_numbers(0, [1]).unwrap()).is_ack_eliciting());
    }
}
