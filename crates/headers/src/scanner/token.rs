use bytes::{Bytes, BytesMut};

use crate::buffer::Region;
use crate::ensure;
use crate::error::ParseError;
use crate::scanner::byte_cache::ByteCache;

/// A complete name, value or first-line token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    /// Entirely inside one input buffer.
    Borrowed(Region),
    /// Spanned input buffers and had to be copied.
    Owned(Bytes),
}

/// Accumulates the token being scanned. Bytes stay in the input buffer until
/// the buffer or the read window runs out mid-token, then they are copied into
/// `spilled`.
#[derive(Debug, Default)]
pub(crate) struct TokenBuilder {
    spilled: BytesMut,
    piece_start: usize,
    len: usize,
    /// Length without trailing whitespace.
    content_len: usize,
    active: bool,
}

impl TokenBuilder {
    pub(crate) fn begin(&mut self, offset: usize) {
        self.spilled.clear();
        self.piece_start = offset;
        self.len = 0;
        self.content_len = 0;
        self.active = true;
    }

    #[inline]
    pub(crate) fn push(&mut self, b: u8, limit: usize) -> Result<(), ParseError> {
        self.len += 1;
        if !matches!(b, b' ' | b'\t') {
            self.content_len = self.len;
        }
        ensure!(self.len <= limit, ParseError::too_large_token(self.len, limit));
        Ok(())
    }

    pub(crate) fn content_len(&self) -> usize {
        self.content_len
    }

    /// Called when the current buffer or window is exhausted before the token ended.
    pub(crate) fn spill(&mut self, cache: &ByteCache) {
        if self.active {
            self.spilled.extend_from_slice(cache.bytes(self.piece_start, cache.offset()));
            self.piece_start = cache.offset();
        }
    }

    /// Called when the next buffer is loaded.
    pub(crate) fn resume(&mut self) {
        self.piece_start = 0;
    }

    /// Ends the token at the cache's current offset, trailing whitespace dropped.
    pub(crate) fn finish(&mut self, cache: &ByteCache) -> Token {
        self.active = false;
        if self.spilled.is_empty() {
            return Token::Borrowed(Region { buffer: cache.buffer(), offset: self.piece_start, len: self.content_len });
        }
        self.spilled.extend_from_slice(cache.bytes(self.piece_start, cache.offset()));
        self.spilled.truncate(self.content_len);
        Token::Owned(self.spilled.split().freeze())
    }
}
