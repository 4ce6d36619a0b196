//! Bounded byte capture
//!
//! Keeps the most recent bytes written by a diagnostic side channel (the wrapper's
//! stderr) without growing past a fixed limit.

use std::collections::VecDeque;
use std::fmt;

/// Default capacity for wrapper diagnostics.
pub const DEFAULT_CAPTURE_BYTES: usize = 16 * 1024;

/// A ring buffer that keeps the newest `max_bytes` bytes
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buffer: VecDeque<u8>,
    max_bytes: usize,
    total_bytes_written: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_BYTES)
    }
}

impl RingBuffer {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_bytes.min(8192)),
            max_bytes,
            total_bytes_written: 0,
        }
    }

    /// Append data, dropping the oldest bytes once the limit is reached.
    pub fn write(&mut self, data: &[u8]) {
        self.total_bytes_written += data.len();

        if self.max_bytes == 0 {
            return;
        }

        let keep = &data[data.len().saturating_sub(self.max_bytes)..];
        let overflow = (self.buffer.len() + keep.len()).saturating_sub(self.max_bytes);
        self.buffer.drain(..overflow);
        self.buffer.extend(keep);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total bytes ever written, including dropped ones.
    #[must_use]
    pub const fn total_bytes_written(&self) -> usize {
        self.total_bytes_written
    }

    #[must_use]
    pub const fn was_truncated(&self) -> bool {
        self.total_bytes_written > self.max_bytes
    }

    /// Captured text with surrounding whitespace trimmed, for error messages.
    #[must_use]
    pub fn summary(&self) -> String {
        let text = self.to_string();
        let trimmed = text.trim();
        if self.was_truncated() {
            format!("...{trimmed}")
        } else {
            trimmed.to_string()
        }
    }
}

impl fmt::Display for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (front, back) = self.buffer.as_slices();
        let mut bytes = Vec::with_capacity(self.buffer.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ring_buffer_keeps_newest_bytes() {
        let mut buffer = RingBuffer::new(10);
        buffer.write(b"hello");
        buffer.write(b"world");
        buffer.write(b"!");

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.to_string(), "elloworld!");
        assert_eq!(buffer.total_bytes_written(), 11);
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_ring_buffer_single_oversized_write() {
        let mut buffer = RingBuffer::new(5);
        buffer.write(b"hello world");
        assert_eq!(buffer.to_string(), "world");
    }

    #[test]
    fn test_summary_marks_truncation() {
        let mut buffer = RingBuffer::new(8);
        buffer.write(b"wrapper: failed to connect\n");
        assert!(buffer.summary().starts_with("..."));

        let mut short = RingBuffer::new(64);
        short.write(b"  boom \n");
        assert_eq!(short.summary(), "boom");
    }

    #[test]
    fn test_zero_capacity_counts_but_keeps_nothing() {
        let mut buffer = RingBuffer::new(0);
        buffer.write(b"abc");
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_bytes_written(), 3);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(
            cap in 0usize..64,
            writes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 0..20),
        ) {
            let mut buffer = RingBuffer::new(cap);
            let mut all = Vec::new();
            for chunk in &writes {
                buffer.write(chunk);
                all.extend_from_slice(chunk);
            }
            prop_assert!(buffer.len() <= cap);
            let expected = &all[all.len().saturating_sub(cap)..];
            let kept: Vec<u8> = buffer.buffer.iter().copied().collect();
            prop_assert_eq!(kept.as_slice(), expected);
        }
    }
}
