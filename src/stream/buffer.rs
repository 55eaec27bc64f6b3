//! Out-of-order stream data reassembly.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Reassembles STREAM frame payloads into ordered, contiguous chunks.
///
/// Chunks are keyed by offset. Duplicate data with identical content is
/// discarded; overlapping data with conflicting content is a protocol
/// violation.
pub struct ReceiveBuffer {
    chunks: BTreeMap<u64, Bytes>,
    /// Everything below this offset has been delivered.
    delivery_offset: u64,
    /// Stream length, once a FIN has fixed it.
    final_offset: Option<u64>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self { chunks: BTreeMap::new(), delivery_offset: 0, final_offset: None }
    }

    /// Insert a received chunk.
    pub fn insert(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<()> {
        let end = offset + data.len() as u64;

        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(Error::ProtocolViolation("stream data beyond final offset"));
            }
        } else if fin {
            if self.highest_offset() > end {
                return Err(Error::ProtocolViolation("final offset below received data"));
            }
            self.final_offset = Some(end);
        }

        // Clip anything already delivered; its content can no longer be
        // compared, so it is taken as a duplicate.
        let mut pos = offset.max(self.delivery_offset);
        if pos >= end {
            return Ok(());
        }
        let mut rest = data.slice((pos - offset) as usize..);

        while !rest.is_empty() {
            // A buffered chunk covering `pos` must agree with the new data.
            if let Some((&start, chunk)) = self.chunks.range(..=pos).next_back() {
                let chunk_end = start + chunk.len() as u64;
                if chunk_end > pos {
                    let overlap = (chunk_end.min(pos + rest.len() as u64) - pos) as usize;
                    let existing = &chunk[(pos - start) as usize..(pos - start) as usize + overlap];
                    if existing != &rest[..overlap] {
                        return Err(Error::ProtocolViolation("conflicting stream data overlap"));
                    }
                    pos += overlap as u64;
                    rest = rest.slice(overlap..);
                    continue;
                }
            }

            // No chunk covers `pos`: insert up to the next buffered chunk.
            let gap = self
                .chunks
                .range(pos + 1..)
                .next()
                .map(|(&start, _)| (start - pos) as usize)
                .unwrap_or(rest.len());
            let take = gap.min(rest.len());
            self.chunks.insert(pos, rest.slice(..take));
            pos += take as u64;
            rest = rest.slice(take..);
        }

        Ok(())
    }

    /// Drain contiguous chunks starting at the delivery offset. Each
    /// entry carries the FIN flag, true only when that chunk ends the
    /// stream.
    pub fn drain(&mut self) -> Vec<(Bytes, bool)> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunks.remove(&self.delivery_offset) {
            self.delivery_offset += chunk.len() as u64;
            let fin = self.final_offset == Some(self.delivery_offset);
            out.push((chunk, fin));
        }
        out
    }

    /// Whether all bytes up to the final offset have been delivered.
    pub fn is_finished(&self) -> bool {
        self.final_offset == Some(self.delivery_offset)
    }

    pub fn delivery_offset(&self) -> u64 {
        self.delivery_offset
    }

    /// Drop all buffered data (RESET_STREAM).
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    fn highest_offset(&self) -> u64 {
        self.chunks
            .iter()
            .next_back()
            .map(|(&start, chunk)| start + chunk.len() as u64)
            .unwrap_or(self.delivery_offset)
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, Bytes::from_static(b"Hello"), false).unwrap();
        assert_eq!(buf.drain(), vec![(Bytes::from_static(b"Hello"), false)]);

        buf.insert(5, Bytes::from_static(b"world"), true).unwrap();
        assert_eq!(buf.drain(), vec![(Bytes::from_static(b"world"), true)]);
        assert!(buf.is_finished());
    }

    #[test]
    fn out_of_order_delivery() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(5, Bytes::from_static(b"world"), true).unwrap();
        assert!(buf.drain().is_empty());

        buf.insert(0, Bytes::from_static(b"Hello"), false).unwrap();
        assert_eq!(
            buf.drain(),
            vec![(Bytes::from_static(b"Hello"), false), (Bytes::from_static(b"world"), true)]
        );
    }

    #[test]
    fn identical_duplicate_is_discarded() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, Bytes::from_static(b"Hello"), false).unwrap();
        buf.insert(0, Bytes::from_static(b"Hello"), false).unwrap();
        assert_eq!(buf.drain().len(), 1);

        // Duplicate of already-delivered data is also a no-op.
        buf.insert(0, Bytes::from_static(b"Hello"), false).unwrap();
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn conflicting_overlap_is_a_violation() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, Bytes::from_static(b"Hello"), false).unwrap();
        let err = buf.insert(0, Bytes::from_static(b"Hexlo"), false).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn partial_overlap_fills_gaps() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(2, Bytes::from_static(b"cde"), false).unwrap();
        // Overlaps [2,5) with identical content and extends both sides.
        buf.insert(0, Bytes::from_static(b"abcdefg"), false).unwrap();
        let drained = buf.drain();
        let all: Vec<u8> = drained.iter().flat_map(|(b, _)| b.to_vec()).collect();
        assert_eq!(all, b"abcdefg");
    }

    #[test]
    fn data_beyond_final_offset_is_a_violation() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, Bytes::from_static(b"Hello"), true).unwrap();
        let err = buf.insert(5, Bytes::from_static(b"extra"), false).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn conflicting_final_offset_is_a_violation() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, Bytes::from_static(b"Hello"), true).unwrap();
        assert!(buf.insert(0, Bytes::from_static(b"He"), true).is_err());
    }
}
