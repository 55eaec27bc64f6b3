//! QUIC frame types and their draft-18 wire codec.

pub mod parse;
pub mod types;

pub use parse::{decode_frames, encode_frame, encode_frames};
pub use types::{
    AckBlock, AckFrame, ConnectionCloseFrame, CryptoFrame, Frame, MaxDataFrame,
    MaxStreamDataFrame, MaxStreamsFrame, ResetStreamFrame, StreamFrame, FRAME_TYPE_ACK,
    FRAME_TYPE_CONNECTION_CLOSE, FRAME_TYPE_CRYPTO, FRAME_TYPE_MAX_DATA,
    FRAME_TYPE_MAX_STREAM_DATA, FRAME_TYPE_MAX_STREAMS_BIDI, FRAME_TYPE_MAX_STREAMS_UNI,
    FRAME_TYPE_PADDING, FRAME_TYPE_PING, FRAME_TYPE_RESET_STREAM, FRAME_TYPE_STREAM_BASE,
};
