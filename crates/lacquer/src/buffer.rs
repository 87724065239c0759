use bytes::BytesMut;

/// Append-only byte buffer with an independent read cursor.
///
/// A producer writes into it and eventually closes it; a consumer keeps
/// calling [`read`] and [`ack`]ing however many bytes the transport actually
/// accepted, so a socket write loop can retry partial sends without losing
/// data. Closing marks end-of-writes but already-buffered bytes can still be
/// drained.
///
/// [`read`]: Self::read
/// [`ack`]: Self::ack
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buf: BytesMut,
    pos: usize,
    closed: bool,
    ready: bool,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and mark the buffer ready.
    pub fn write(&mut self, data: &[u8]) {
        self.ready = true;
        self.buf.extend_from_slice(data);
    }

    /// Currently unread bytes, without consuming them.
    pub fn read(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Advance the read cursor, clamped to the available length.
    pub fn ack(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    /// No more writes will happen; buffered bytes may still be drained.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Whether any byte has ever been written.
    ///
    /// Distinguishes "nothing queued yet" from "queued and fully drained".
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Closed and fully drained.
    pub fn complete(&self) -> bool {
        self.closed && self.pos == self.buf.len()
    }

    pub fn unread(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_repeats_until_acked() {
        let mut buffer = StreamBuffer::new();
        assert!(!buffer.ready());

        buffer.write(b"Hello");
        buffer.write(b", world!");
        assert!(buffer.ready());
        assert_eq!(buffer.read(), b"Hello, world!");
        assert_eq!(buffer.read(), b"Hello, world!");

        buffer.ack(7);
        assert_eq!(buffer.read(), b"world!");
        buffer.ack(6);
        assert_eq!(buffer.read(), b"");
    }

    #[test]
    fn ack_is_clamped() {
        let mut buffer = StreamBuffer::new();
        buffer.write(b"abc");
        buffer.ack(100);
        assert_eq!(buffer.read(), b"");
        assert_eq!(buffer.unread(), 0);
    }

    #[test]
    fn complete_requires_close_and_drain() {
        let mut buffer = StreamBuffer::new();
        buffer.write(b"abc");
        assert!(!buffer.complete());

        buffer.close();
        assert!(!buffer.complete());
        assert_eq!(buffer.read(), b"abc");

        buffer.ack(3);
        assert!(buffer.complete());
    }

    #[test]
    fn empty_closed_buffer_is_complete_but_not_ready() {
        let mut buffer = StreamBuffer::new();
        buffer.close();
        assert!(buffer.complete());
        assert!(!buffer.ready());
    }
}
