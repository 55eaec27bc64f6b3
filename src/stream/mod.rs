//! Stream multiplexing and in-order delivery.

pub mod buffer;
pub mod manager;

pub use buffer::ReceiveBuffer;
pub use manager::{Stream, StreamManager};

use crate::types::StreamId;
use bytes::Bytes;

/// Capability receiving ordered stream data.
///
/// `on_data` is invoked with contiguous bytes in strict offset order;
/// `fin` is true only on the call that delivers the final byte.
pub trait StreamListener: Send + Sync {
    fn on_data(&self, stream_id: StreamId, data: Bytes, fin: bool);
    fn on_reset(&self, stream_id: StreamId, error_code: u64);
}
