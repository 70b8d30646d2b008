use bytes::Bytes;

use crate::buffer::BufPos;

/// Read window over the input buffer currently being scanned.
///
/// The scanner never looks past `limit`; when the window is used up the next
/// `cache_size` bytes of the buffer are made available. Tokens still open at
/// that point are copied out, so only tokens inside one window are borrowed.
#[derive(Debug)]
pub(crate) struct ByteCache {
    data: Bytes,
    buffer: usize,
    pos: usize,
    limit: usize,
    cache_size: usize,
}

impl ByteCache {
    pub(crate) fn new(cache_size: usize) -> Self {
        Self { data: Bytes::new(), buffer: 0, pos: 0, limit: 0, cache_size }
    }

    pub(crate) fn load(&mut self, data: Bytes, buffer: usize) {
        self.data = data;
        self.buffer = buffer;
        self.pos = 0;
        self.limit = 0;
    }

    fn fill(&mut self) -> bool {
        if self.pos >= self.data.len() {
            return false;
        }
        self.limit = (self.pos + self.cache_size).min(self.data.len());
        true
    }

    #[inline]
    pub(crate) fn peek(&mut self) -> Option<u8> {
        if self.pos >= self.limit && !self.fill() {
            return None;
        }
        Some(self.data[self.pos])
    }

    /// The window ends before the buffer does and every byte of it was read.
    #[inline]
    pub(crate) fn window_exhausted(&self) -> bool {
        self.limit > 0 && self.pos >= self.limit && self.pos < self.data.len()
    }

    #[inline]
    pub(crate) fn advance(&mut self) {
        self.pos += 1;
    }

    /// Ledger index of the buffer being read.
    #[inline]
    pub(crate) fn buffer(&self) -> usize {
        self.buffer
    }

    /// Offset of the next unread byte.
    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn position(&self) -> BufPos {
        BufPos::new(self.buffer, self.pos)
    }

    pub(crate) fn bytes(&self, from: usize, to: usize) -> &[u8] {
        &self.data[from..to]
    }

    pub(crate) fn release(&mut self) {
        self.data = Bytes::new();
        self.pos = 0;
        self.limit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_refills_until_buffer_end() {
        let mut cache = ByteCache::new(2);
        cache.load(Bytes::from_static(b"abcde"), 3);
        let mut seen = Vec::new();
        while let Some(b) = cache.peek() {
            seen.push(b);
            cache.advance();
        }
        assert_eq!(seen, b"abcde");
        assert_eq!(cache.position(), BufPos::new(3, 5));
    }

    #[test]
    fn window_end_is_reported_before_refill() {
        let mut cache = ByteCache::new(2);
        cache.load(Bytes::from_static(b"abc"), 0);
        assert!(!cache.window_exhausted());
        cache.peek();
        cache.advance();
        assert!(!cache.window_exhausted());
        cache.advance();
        assert!(cache.window_exhausted());
        assert_eq!(cache.peek(), Some(b'c'));
        assert!(!cache.window_exhausted());
        cache.advance();
        // buffer end is not a window end
        assert!(!cache.window_exhausted());
    }
}
