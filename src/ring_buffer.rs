#[derive(Debug, thiserror::Error)]
pub enum RingBufferError {
    #[error("ring buffer overflow: {requested} bytes requested, {available} available")]
    Overflow { requested: usize, available: usize },
}

/// Byte ring buffer with wraparound-aware writes and reads. Not internally
/// synchronized — callers serialize access through their own stream mutex,
/// the same contract as the C implementation this is ported from.
pub struct RingBuffer {
    buffer: Vec<u8>,
    head: usize,
    tail: usize,
    used: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            buffer: vec![0u8; capacity],
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn has_space_for(&self, length: usize) -> bool {
        self.used + length <= self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.used = 0;
    }

    /// Copies `data` into the ring, wrapping as needed. Fails with
    /// [`RingBufferError::Overflow`] rather than writing anything if the
    /// data wouldn't fit.
    pub fn write(&mut self, data: &[u8]) -> Result<(), RingBufferError> {
        let len = data.len();
        if !self.has_space_for(len) {
            return Err(RingBufferError::Overflow {
                requested: len,
                available: self.buffer.len() - self.used,
            });
        }
        let cap = self.buffer.len();
        let end = if self.head <= self.tail { cap } else { self.head };
        let first = (end - self.tail).min(len);
        self.buffer[self.tail..self.tail + first].copy_from_slice(&data[..first]);
        self.tail += first;
        if self.tail == cap {
            self.tail = 0;
        }
        let remaining = len - first;
        if remaining > 0 {
            self.buffer[self.tail..self.tail + remaining].copy_from_slice(&data[first..]);
            self.tail += remaining;
        }
        self.used += len;
        Ok(())
    }

    /// Fill variant of `write`: appends `length` copies of `value`.
    pub fn write_fill(&mut self, length: usize, value: u8) -> Result<(), RingBufferError> {
        if !self.has_space_for(length) {
            return Err(RingBufferError::Overflow {
                requested: length,
                available: self.buffer.len() - self.used,
            });
        }
        let cap = self.buffer.len();
        let end = if self.head <= self.tail { cap } else { self.head };
        let first = (end - self.tail).min(length);
        self.buffer[self.tail..self.tail + first].fill(value);
        self.tail += first;
        if self.tail == cap {
            self.tail = 0;
        }
        let remaining = length - first;
        if remaining > 0 {
            self.buffer[self.tail..self.tail + remaining].fill(value);
            self.tail += remaining;
        }
        self.used += length;
        Ok(())
    }

    /// Drains up to `out.len()` bytes into `out`, returning the count read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let to_read = self.used.min(out.len());
        let cap = self.buffer.len();
        let end = if self.tail > self.head || self.used == 0 {
            self.tail
        } else {
            cap
        };
        let first = (end - self.head).min(to_read);
        out[..first].copy_from_slice(&self.buffer[self.head..self.head + first]);
        self.head += first;
        if self.head == cap {
            self.head = 0;
        }
        let remaining = to_read - first;
        if remaining > 0 {
            out[first..first + remaining].copy_from_slice(&self.buffer[self.head..self.head + remaining]);
            self.head += remaining;
        }
        self.used -= to_read;
        to_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcd").unwrap();
        assert_eq!(rb.used_bytes(), 4);
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.used_bytes(), 0);
    }

    #[test]
    fn wraparound_write_and_read() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"ab").unwrap();
        let mut out = [0u8; 2];
        rb.read(&mut out);
        rb.write(b"cdef").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out), 4);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn has_space_for_respects_capacity() {
        let mut rb = RingBuffer::new(4);
        assert!(rb.has_space_for(4));
        assert!(!rb.has_space_for(5));
        rb.write(b"ab").unwrap();
        assert!(!rb.has_space_for(3));
        assert!(rb.has_space_for(2));
    }

    #[test]
    fn write_fill_matches_value() {
        let mut rb = RingBuffer::new(4);
        rb.write_fill(3, 0x7f).unwrap();
        let mut out = [0u8; 3];
        rb.read(&mut out);
        assert_eq!(out, [0x7f; 3]);
    }

    #[test]
    fn write_overflow_is_rejected() {
        let mut rb = RingBuffer::new(4);
        assert!(matches!(rb.write(b"abcde"), Err(RingBufferError::Overflow { .. })));
        rb.write(b"ab").unwrap();
        assert!(matches!(rb.write(b"abc"), Err(RingBufferError::Overflow { .. })));
    }

    #[test]
    fn partial_read_leaves_remainder() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"hello").unwrap();
        let mut out = [0u8; 2];
        assert_eq!(rb.read(&mut out), 2);
        assert_eq!(&out, b"he");
        assert_eq!(rb.used_bytes(), 3);
    }
}
