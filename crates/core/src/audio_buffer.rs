//! Outbound audio accumulation and size-bounded framing.

use crate::error::AudioBufferError;
use bytes::{Bytes, BytesMut};

/// Accumulates outbound audio and drains it as frames no larger than `max_size`.
///
/// The buffer performs no I/O. The owning session decides *when* to drain
/// (using [`reaches_min_size`](Self::reaches_min_size) as the hold-back
/// threshold); the buffer only decides *how* bytes are cut into frames.
#[derive(Debug)]
pub struct AudioChunkBuffer {
    chunks: Vec<Bytes>,
    total: usize,
    min_size: usize,
    max_size: usize,
}

impl AudioChunkBuffer {
    /// Creates an empty buffer. Both thresholds must be non-zero and
    /// `min_size <= max_size`.
    pub fn new(min_size: usize, max_size: usize) -> Result<Self, AudioBufferError> {
        if min_size == 0 || max_size == 0 || min_size > max_size {
            return Err(AudioBufferError::InvalidThresholds { min_size, max_size });
        }
        Ok(Self {
            chunks: Vec::new(),
            total: 0,
            min_size,
            max_size,
        })
    }

    pub fn append(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.total += bytes.len();
        self.chunks.push(bytes);
    }

    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn reaches_min_size(&self) -> bool {
        self.total >= self.min_size
    }

    /// Drops everything buffered and returns how many bytes were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.total;
        self.chunks.clear();
        self.total = 0;
        discarded
    }

    /// Empties the buffer, returning its contents in order as frames of at
    /// most `max_size` bytes each.
    pub fn drain_as_frames(&mut self) -> Vec<Bytes> {
        if self.total == 0 {
            return Vec::new();
        }

        let joined = if self.chunks.len() == 1 {
            self.chunks.remove(0)
        } else {
            let mut joined = BytesMut::with_capacity(self.total);
            for chunk in self.chunks.drain(..) {
                joined.extend_from_slice(&chunk);
            }
            joined.freeze()
        };
        self.chunks.clear();
        self.total = 0;

        if joined.len() <= self.max_size {
            return vec![joined];
        }

        let mut frames = Vec::with_capacity(joined.len().div_ceil(self.max_size));
        let mut offset = 0;
        while offset < joined.len() {
            let end = (offset + self.max_size).min(joined.len());
            frames.push(joined.slice(offset..end));
            offset = end;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Bytes {
        (0..len)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect::<Vec<u8>>()
            .into()
    }

    #[test]
    fn test_rejects_invalid_thresholds() {
        assert!(AudioChunkBuffer::new(0, 100).is_err());
        assert!(AudioChunkBuffer::new(10, 0).is_err());
        assert_eq!(
            AudioChunkBuffer::new(200, 100).unwrap_err(),
            AudioBufferError::InvalidThresholds {
                min_size: 200,
                max_size: 100
            }
        );
        assert!(AudioChunkBuffer::new(100, 100).is_ok());
    }

    #[test]
    fn test_drain_empty_buffer_yields_nothing() {
        let mut buffer = AudioChunkBuffer::new(8, 16).unwrap();
        assert!(buffer.drain_as_frames().is_empty());
        buffer.append(Bytes::new());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_small_contents_drain_as_single_frame() {
        let mut buffer = AudioChunkBuffer::new(8, 16).unwrap();
        buffer.append(Bytes::from_static(b"abc"));
        buffer.append(Bytes::from_static(b"defg"));
        assert_eq!(buffer.total_size(), 7);
        assert!(!buffer.reaches_min_size());

        let frames = buffer.drain_as_frames();
        assert_eq!(frames, vec![Bytes::from_static(b"abcdefg")]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_size(), 0);
    }

    #[test]
    fn test_large_contents_split_into_max_size_frames_in_order() {
        let max = 1000;
        let mut buffer = AudioChunkBuffer::new(100, max).unwrap();
        let parts = [pattern(1500, 0), pattern(333, 7), pattern(1200, 42)];
        let mut expected = Vec::new();
        for part in &parts {
            expected.extend_from_slice(part);
            buffer.append(part.clone());
        }
        let n = expected.len();

        let frames = buffer.drain_as_frames();
        assert_eq!(frames.len(), n.div_ceil(max));
        assert!(frames.iter().all(|f| f.len() <= max));
        assert!(frames[..frames.len() - 1].iter().all(|f| f.len() == max));

        let rejoined: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        assert_eq!(rejoined, expected);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_exact_multiple_of_max_size() {
        let mut buffer = AudioChunkBuffer::new(10, 10).unwrap();
        buffer.append(pattern(30, 1));
        let frames = buffer.drain_as_frames();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 10));
    }

    #[test]
    fn test_clear_discards_everything() {
        let mut buffer = AudioChunkBuffer::new(8000, 64000).unwrap();
        buffer.append(pattern(1000, 0));
        buffer.append(pattern(2000, 0));
        assert_eq!(buffer.clear(), 3000);
        assert!(buffer.is_empty());
        assert!(buffer.drain_as_frames().is_empty());
    }
}
