//! Chunked byte queues used by descriptors and codecs.
//!
//! Reads append whole chunks and never copy; codecs consume from the
//! front, possibly mid-chunk. The queue tracks its total length so
//! framing checks are O(1).

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Append-only queue of byte chunks with a running total length.
#[derive(Debug, Default)]
pub struct ReadQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ReadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one chunk produced by a socket read.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Copy the first `n` buffered bytes without consuming them.
    /// Returns `None` if fewer than `n` bytes are buffered.
    pub fn peek(&self, n: usize) -> Option<Vec<u8>> {
        if self.len < n {
            return None;
        }
        let mut out = Vec::with_capacity(n);
        for chunk in &self.chunks {
            let take = chunk.len().min(n - out.len());
            out.extend_from_slice(&chunk[..take]);
            if out.len() == n {
                break;
            }
        }
        Some(out)
    }

    /// Remove and return the first `n` bytes as one contiguous chunk.
    /// Returns `None` (consuming nothing) if fewer than `n` are buffered.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.len < n {
            return None;
        }
        self.len -= n;
        // Fast path: the front chunk alone satisfies the request.
        if let Some(front) = self.chunks.front_mut() {
            if front.len() == n {
                return self.chunks.pop_front();
            }
            if front.len() > n {
                return Some(front.split_to(n));
            }
        }
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let mut front = self.chunks.pop_front().expect("length accounted");
            if front.len() <= remaining {
                remaining -= front.len();
                out.extend_from_slice(&front);
            } else {
                out.extend_from_slice(&front.split_to(remaining));
                remaining = 0;
                self.chunks.push_front(front);
            }
        }
        Some(out.freeze())
    }

    /// Position of `byte` in the buffered data, if present.
    pub fn find(&self, byte: u8) -> Option<usize> {
        let mut offset = 0;
        for chunk in &self.chunks {
            if let Some(pos) = chunk.iter().position(|&b| b == byte) {
                return Some(offset + pos);
            }
            offset += chunk.len();
        }
        None
    }

    /// Drop all buffered data.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

/// Pending outbound bytes for one descriptor.
#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Front chunk still awaiting the socket, if any.
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Record that `n` bytes of the front chunk were written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.len -= n;
        let mut remaining = n;
        while remaining > 0 {
            let front = self.chunks.front_mut().expect("length accounted");
            if front.len() <= remaining {
                remaining -= front.len();
                self.chunks.pop_front();
            } else {
                let _ = front.split_to(remaining);
                remaining = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_queue_take_within_chunk() {
        let mut q = ReadQueue::new();
        q.push(Bytes::from_static(b"hello world"));
        assert_eq!(q.len(), 11);
        let head = q.take(5).unwrap();
        assert_eq!(&head[..], b"hello");
        assert_eq!(q.len(), 6);
    }

    #[test]
    fn test_read_queue_take_across_chunks() {
        let mut q = ReadQueue::new();
        q.push(Bytes::from_static(b"abc"));
        q.push(Bytes::from_static(b"def"));
        q.push(Bytes::from_static(b"ghi"));
        let head = q.take(7).unwrap();
        assert_eq!(&head[..], b"abcdefg");
        assert_eq!(q.len(), 2);
        assert_eq!(&q.take(2).unwrap()[..], b"hi");
    }

    #[test]
    fn test_read_queue_short_take_consumes_nothing() {
        let mut q = ReadQueue::new();
        q.push(Bytes::from_static(b"abc"));
        assert!(q.take(4).is_none());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_read_queue_find_across_chunks() {
        let mut q = ReadQueue::new();
        q.push(Bytes::from_static(b"SELECT 1"));
        q.push(Bytes::from_static(b"\nSELECT 2\n"));
        assert_eq!(q.find(b'\n'), Some(8));
    }

    #[test]
    fn test_read_queue_peek() {
        let mut q = ReadQueue::new();
        q.push(Bytes::from_static(b"ab"));
        q.push(Bytes::from_static(b"cd"));
        assert_eq!(q.peek(3).unwrap(), b"abc");
        assert_eq!(q.len(), 4, "peek must not consume");
    }

    #[test]
    fn test_write_queue_advance() {
        let mut q = WriteQueue::new();
        q.push(Bytes::from_static(b"one"));
        q.push(Bytes::from_static(b"two"));
        q.advance(4);
        assert_eq!(q.len(), 2);
        assert_eq!(&q.front().unwrap()[..], b"wo");
        q.advance(2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let mut q = ReadQueue::new();
        q.push(Bytes::new());
        assert!(q.is_empty());
    }
}
