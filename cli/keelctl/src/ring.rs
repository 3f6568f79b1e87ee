//! Fixed-capacity byte ring buffer for per-node kernel log capture.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Default capture capacity per node.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// A byte ring: writes past capacity evict the oldest bytes.
pub struct RingBuffer {
    inner: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl RingBuffer {
    /// Ring with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Ring with a specific capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64 * 1024))),
            capacity,
        }
    }

    /// Append bytes, evicting from the front when full.
    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("ring lock poisoned");

        for &byte in bytes {
            if inner.len() == self.capacity {
                inner.pop_front();
            }

            inner.push_back(byte);
        }
    }

    /// Copy out the retained bytes, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        let inner = self.inner.lock().expect("ring lock poisoned");

        inner.iter().copied().collect()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_back() {
        let ring = RingBuffer::with_capacity(16);
        ring.write(b"hello");

        assert_eq!(ring.contents(), b"hello");
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let ring = RingBuffer::with_capacity(8);
        ring.write(b"0123456789");

        assert_eq!(ring.contents(), b"23456789");
    }
}
