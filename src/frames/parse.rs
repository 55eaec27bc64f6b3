//! Frame wire codec (draft-18).
//!
//! Decoding operates on a decrypted payload slice and yields owned
//! frames. Unknown frame types terminate the payload scan: without a
//! registered length there is nothing left to parse, so the remainder is
//! skipped and the packet is still acknowledged.

use super::types::*;
use crate::error::{Error, Result};
use crate::types::{get_varint, put_varint, StreamId};
use bytes::{Buf, BufMut, Bytes};
use tracing::warn;

/// Encode a single frame into `buf`.
pub fn encode_frame<B: BufMut>(frame: &Frame, buf: &mut B) {
    match frame {
        Frame::Padding(len) => {
            for _ in 0..*len {
                buf.put_u8(0x00);
            }
        }
        Frame::Ping => put_varint(buf, FRAME_TYPE_PING),
        Frame::Ack(ack) => encode_ack(ack, buf),
        Frame::ResetStream(f) => {
            put_varint(buf, FRAME_TYPE_RESET_STREAM);
            put_varint(buf, f.stream_id.value());
            put_varint(buf, f.error_code);
            put_varint(buf, f.final_size);
        }
        Frame::Crypto(f) => {
            put_varint(buf, FRAME_TYPE_CRYPTO);
            put_varint(buf, f.offset);
            put_varint(buf, f.data.len() as u64);
            buf.put_slice(&f.data);
        }
        Frame::Stream(f) => {
            // Always emitted with explicit offset and length.
            let ty = FRAME_TYPE_STREAM_BASE
                | STREAM_BIT_OFF
                | STREAM_BIT_LEN
                | if f.fin { STREAM_BIT_FIN } else { 0 };
            put_varint(buf, ty);
            put_varint(buf, f.stream_id.value());
            put_varint(buf, f.offset);
            put_varint(buf, f.data.len() as u64);
            buf.put_slice(&f.data);
        }
        Frame::MaxData(f) => {
            put_varint(buf, FRAME_TYPE_MAX_DATA);
            put_varint(buf, f.maximum_data);
        }
        Frame::MaxStreamData(f) => {
            put_varint(buf, FRAME_TYPE_MAX_STREAM_DATA);
            put_varint(buf, f.stream_id.value());
            put_varint(buf, f.maximum_stream_data);
        }
        Frame::MaxStreams(f) => {
            put_varint(
                buf,
                if f.bidirectional { FRAME_TYPE_MAX_STREAMS_BIDI } else { FRAME_TYPE_MAX_STREAMS_UNI },
            );
            put_varint(buf, f.maximum_streams);
        }
        Frame::ConnectionClose(f) => {
            match f.frame_type {
                Some(frame_type) => {
                    put_varint(buf, FRAME_TYPE_CONNECTION_CLOSE);
                    put_varint(buf, f.error_code);
                    put_varint(buf, frame_type);
                }
                None => {
                    put_varint(buf, FRAME_TYPE_CONNECTION_CLOSE_APP);
                    put_varint(buf, f.error_code);
                }
            }
            put_varint(buf, f.reason.len() as u64);
            buf.put_slice(&f.reason);
        }
        Frame::Unknown(ty) => put_varint(buf, *ty),
    }
}

/// Encode a sequence of frames.
pub fn encode_frames<B: BufMut>(frames: &[Frame], buf: &mut B) {
    for frame in frames {
        encode_frame(frame, buf);
    }
}

fn encode_ack<B: BufMut>(ack: &AckFrame, buf: &mut B) {
    debug_assert!(!ack.blocks.is_empty());
    let first = &ack.blocks[0];
    put_varint(buf, FRAME_TYPE_ACK);
    put_varint(buf, first.largest);
    put_varint(buf, ack.ack_delay);
    put_varint(buf, ack.blocks.len() as u64 - 1);
    put_varint(buf, first.largest - first.smallest);

    let mut prev_smallest = first.smallest;
    for block in &ack.blocks[1..] {
        put_varint(buf, prev_smallest - block.largest - 2);
        put_varint(buf, block.largest - block.smallest);
        prev_smallest = block.smallest;
    }
}

/// Decode every frame in a decrypted payload.
pub fn decode_frames(payload: &[u8]) -> Result<Vec<Frame>> {
    let mut buf = payload;
    let mut frames = Vec::new();
    while buf.has_remaining() {
        match decode_frame(&mut buf)? {
            Frame::Unknown(ty) => {
                warn!(frame_type = ty, "skipping unknown frame type");
                frames.push(Frame::Unknown(ty));
                break;
            }
            frame => frames.push(frame),
        }
    }
    Ok(frames)
}

fn decode_frame(buf: &mut &[u8]) -> Result<Frame> {
    let ty = get_varint(buf)?;

    if ty == FRAME_TYPE_PADDING {
        let mut len = 1usize;
        while buf.has_remaining() && buf.chunk()[0] == 0x00 {
            buf.advance(1);
            len += 1;
        }
        return Ok(Frame::Padding(len));
    }

    match ty {
        FRAME_TYPE_PING => Ok(Frame::Ping),
        FRAME_TYPE_ACK => decode_ack(buf).map(Frame::Ack),
        FRAME_TYPE_RESET_STREAM => {
            let stream_id = StreamId::new(get_varint(buf)?);
            let error_code = get_varint(buf)?;
            let final_size = get_varint(buf)?;
            Ok(Frame::ResetStream(ResetStreamFrame { stream_id, error_code, final_size }))
        }
        FRAME_TYPE_CRYPTO => {
            let offset = get_varint(buf)?;
            let data = get_bytes(buf)?;
            Ok(Frame::Crypto(CryptoFrame { offset, data }))
        }
        ty if (FRAME_TYPE_STREAM_BASE..=FRAME_TYPE_STREAM_BASE + 0x07).contains(&ty) => {
            decode_stream(ty, buf).map(Frame::Stream)
        }
        FRAME_TYPE_MAX_DATA => {
            Ok(Frame::MaxData(MaxDataFrame { maximum_data: get_varint(buf)? }))
        }
        FRAME_TYPE_MAX_STREAM_DATA => {
            let stream_id = StreamId::new(get_varint(buf)?);
            let maximum_stream_data = get_varint(buf)?;
            Ok(Frame::MaxStreamData(MaxStreamDataFrame { stream_id, maximum_stream_data }))
        }
        FRAME_TYPE_MAX_STREAMS_BIDI | FRAME_TYPE_MAX_STREAMS_UNI => {
            Ok(Frame::MaxStreams(MaxStreamsFrame {
                maximum_streams: get_varint(buf)?,
                bidirectional: ty == FRAME_TYPE_MAX_STREAMS_BIDI,
            }))
        }
        FRAME_TYPE_CONNECTION_CLOSE | FRAME_TYPE_CONNECTION_CLOSE_APP => {
            let error_code = get_varint(buf)?;
            let frame_type = if ty == FRAME_TYPE_CONNECTION_CLOSE {
                Some(get_varint(buf)?)
            } else {
                None
            };
            let reason = get_bytes(buf)?;
            Ok(Frame::ConnectionClose(ConnectionCloseFrame { error_code, frame_type, reason }))
        }
        other => Ok(Frame::Unknown(other)),
    }
}

fn decode_ack(buf: &mut &[u8]) -> Result<AckFrame> {
    let largest = get_varint(buf)?;
    let ack_delay = get_varint(buf)?;
    let block_count = get_varint(buf)?;
    let first_len = get_varint(buf)?;

    if first_len > largest {
        return Err(Error::FrameEncoding);
    }
    let mut blocks = vec![AckBlock::new(largest - first_len, largest)];

    let mut prev_smallest = largest - first_len;
    for _ in 0..block_count {
        let gap = get_varint(buf)?;
        let len = get_varint(buf)?;
        let block_largest = prev_smallest
            .checked_sub(gap + 2)
            .ok_or(Error::FrameEncoding)?;
        let block_smallest = block_largest.checked_sub(len).ok_or(Error::FrameEncoding)?;
        blocks.push(AckBlock::new(block_smallest, block_largest));
        prev_smallest = block_smallest;
    }

    Ok(AckFrame { ack_delay, blocks })
}

fn decode_stream(ty: u64, buf: &mut &[u8]) -> Result<StreamFrame> {
    let fin = ty & STREAM_BIT_FIN != 0;
    let has_len = ty & STREAM_BIT_LEN != 0;
    let has_off = ty & STREAM_BIT_OFF != 0;

    let stream_id = StreamId::new(get_varint(buf)?);
    let offset = if has_off { get_varint(buf)? } else { 0 };
    let data = if has_len {
        get_bytes(buf)?
    } else {
        // Extends to the end of the payload.
        let data = Bytes::copy_from_slice(buf);
        buf.advance(buf.len());
        data
    };

    Ok(StreamFrame { stream_id, offset, fin, data })
}

fn get_bytes(buf: &mut &[u8]) -> Result<Bytes> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::FrameEncoding);
    }
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(frame: Frame) -> Vec<Frame> {
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);
        assert_eq!(buf.len(), frame.encoded_len(), "encoded_len mismatch for {frame:?}");
        decode_frames(&buf).unwrap()
    }

    #[test]
    fn ping_round_trip() {
        assert_eq!(round_trip(Frame::Ping), vec![Frame::Ping]);
    }

    #[test]
    fn stream_round_trip() {
        let frame = Frame::Stream(StreamFrame::new(
            StreamId::new(8),
            5,
            true,
            Bytes::from_static(b"world"),
        ));
        assert_eq!(round_trip(frame.clone()), vec![frame]);
    }

    #[test]
    fn crypto_round_trip() {
        let frame = Frame::Crypto(CryptoFrame::new(16, Bytes::from_static(b"client hello")));
        assert_eq!(round_trip(frame.clone()), vec![frame]);
    }

    #[test]
    fn ack_round_trip_multiple_blocks() {
        let ack = AckFrame::from_packet_numbers(3, [1, 2, 5, 6, 9]).unwrap();
        let frame = Frame::Ack(ack);
        assert_eq!(round_trip(frame.clone()), vec![frame]);
    }

    #[test]
    fn connection_close_round_trip() {
        let frame = Frame::ConnectionClose(ConnectionCloseFrame::transport(
            123,
            FRAME_TYPE_STREAM_BASE,
            "Closed",
        ));
        assert_eq!(round_trip(frame.clone()), vec![frame]);
    }

    #[test]
    fn padding_coalesces() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::Padding(10), &mut buf);
        encode_frame(&Frame::Ping, &mut buf);
        let frames = decode_frames(&buf).unwrap();
        assert_eq!(frames, vec![Frame::Padding(10), Frame::Ping]);
    }

    #[test]
    fn unknown_frame_skips_rest() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 0x1e); // HANDSHAKE_DONE, post-draft-18
        buf.put_slice(b"trailing");
        let frames = decode_frames(&buf).unwrap();
        assert_eq!(frames, vec![Frame::Unknown(0x1e)]);
    }

    #[test]
    fn truncated_crypto_frame_is_error() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, FRAME_TYPE_CRYPTO);
        put_varint(&mut buf, 0);
        put_varint(&mut buf, 100); // length beyond the buffer
        assert!(decode_frames(&buf).is_err());
    }
}
