//! Byte cache for message I/O staging.
//!
//! A grow-on-write buffer with a moving head: the protocol layer stages
//! response bytes with `write`, submits `peek_head()` to the transport, and
//! trims the already-sent prefix with `commit_head(n)` when the write
//! completion reports a (possibly partial) count. The unsent remainder stays
//! contiguous, so resubmission never re-sends bytes.

/// Head compaction threshold: dead prefix beyond this is memmoved away.
const COMPACT_AT: usize = 16 * 1024;

#[derive(Default)]
pub struct ByteCache {
    buf: Vec<u8>,
    head: usize,
}

impl ByteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes at the tail.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The pending (unconsumed) bytes, contiguous.
    #[inline]
    pub fn peek_head(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    /// Drop `n` bytes from the head; `n` is clamped to the pending size.
    pub fn commit_head(&mut self, n: usize) {
        self.head = (self.head + n).min(self.buf.len());
        if self.head == self.buf.len() {
            self.buf.clear();
            self.head = 0;
        } else if self.head >= COMPACT_AT {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }

    /// Pending byte count.
    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_peek_commit() {
        let mut c = ByteCache::new();
        c.write(b"hello ");
        c.write(b"world");
        assert_eq!(c.peek_head(), b"hello world");
        c.commit_head(6);
        assert_eq!(c.peek_head(), b"world");
        assert_eq!(c.size(), 5);
        c.commit_head(5);
        assert!(c.is_empty());
    }

    #[test]
    fn commit_clamps() {
        let mut c = ByteCache::new();
        c.write(b"abc");
        c.commit_head(100);
        assert!(c.is_empty());
        assert_eq!(c.peek_head(), b"");
    }

    #[test]
    fn partial_then_more_writes() {
        let mut c = ByteCache::new();
        c.write(b"first");
        c.commit_head(3);
        c.write(b"second");
        assert_eq!(c.peek_head(), b"stsecond");
    }

    #[test]
    fn compaction_keeps_pending() {
        let mut c = ByteCache::new();
        let chunk = vec![7u8; COMPACT_AT];
        c.write(&chunk);
        c.write(b"tail");
        c.commit_head(COMPACT_AT);
        assert_eq!(c.peek_head(), b"tail");
        c.commit_head(4);
        assert!(c.is_empty());
    }
}
