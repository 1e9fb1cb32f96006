/// Initial capacity of the receive buffer, and the size of one read
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Growable receive buffer with read (`pos`) and fill (`end`) cursors
#[derive(Debug)]
pub struct ReceiveBuffer {
    buf: Vec<u8>,
    pos: usize,
    end: usize,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        ReceiveBuffer::with_capacity(RECV_BUFFER_SIZE)
    }
}

impl ReceiveBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ReceiveBuffer {
            buf: vec![0u8; capacity],
            pos: 0,
            end: 0,
        }
    }

    /// Bytes received but not yet consumed
    pub fn available(&self) -> usize {
        self.end - self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Unconsumed bytes
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.pos..self.end]
    }

    /// Free tail to read into, at most one `RECV_BUFFER_SIZE` chunk.
    /// Makes room first if the tail is full.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.end == self.buf.len() {
            self.compact();
            if self.end == self.buf.len() {
                let grow = self.buf.len().max(RECV_BUFFER_SIZE);
                self.buf.resize(self.buf.len() + grow, 0);
            }
        }
        let limit = (self.end + RECV_BUFFER_SIZE).min(self.buf.len());
        &mut self.buf[self.end..limit]
    }

    /// Mark `n` bytes of the spare tail as filled
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end += n;
    }

    /// Make sure a frame of `len` bytes fits without further growth.
    /// The caller bounds `len` by the message size limit first.
    pub fn reserve_frame(&mut self, len: usize) {
        if self.buf.len() - self.pos < len {
            self.compact();
            if self.buf.len() < len {
                self.buf.resize(len, 0);
            }
        }
    }

    /// Consume `len` bytes
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        debug_assert!(len <= self.available());
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        if self.pos == self.end {
            self.pos = 0;
            self.end = 0;
        }
        out
    }

    /// Move unconsumed bytes to the front
    pub fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.buf.copy_within(self.pos..self.end, 0);
        self.end -= self.pos;
        self.pos = 0;
    }

    /// Drop back to the initial capacity after an oversized frame
    pub fn shrink(&mut self) {
        if self.buf.len() > RECV_BUFFER_SIZE && self.available() <= RECV_BUFFER_SIZE {
            self.compact();
            self.buf.truncate(RECV_BUFFER_SIZE);
            self.buf.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut ReceiveBuffer, data: &[u8]) {
        let mut written = 0;
        while written < data.len() {
            let spare = buf.spare_mut();
            let n = spare.len().min(data.len() - written);
            spare[..n].copy_from_slice(&data[written..written + n]);
            buf.advance(n);
            written += n;
        }
    }

    #[test]
    fn take_consumes_in_order() {
        let mut buf = ReceiveBuffer::default();
        fill(&mut buf, b"hello world");
        assert_eq!(buf.take(5), b"hello");
        assert_eq!(buf.available(), 6);
        assert_eq!(buf.take(6), b" world");
        assert!(buf.is_empty());
    }

    #[test]
    fn grows_for_frames_larger_than_one_read() {
        let mut buf = ReceiveBuffer::default();
        let data: Vec<u8> = (0..3 * RECV_BUFFER_SIZE + 17).map(|i| i as u8).collect();
        buf.reserve_frame(data.len());
        fill(&mut buf, &data);
        assert_eq!(buf.available(), data.len());
        assert_eq!(buf.take(data.len()), data);
        buf.shrink();
        assert_eq!(buf.capacity(), RECV_BUFFER_SIZE);
    }

    #[test]
    fn compact_keeps_partial_frames() {
        let mut buf = ReceiveBuffer::with_capacity(8);
        fill(&mut buf, b"abcdefgh");
        let _ = buf.take(6);
        fill(&mut buf, b"ijkl");
        assert_eq!(buf.peek(), b"ghijkl");
    }
}
