//! Buffer allocation and the parse-buffer ledger.
//!
//! The ledger owns every input buffer that still holds bytes of the current
//! header block. Header values point into it by `(buffer, offset, len)` instead
//! of holding the bytes themselves, and the reuse marshaller edits it in place.
//!
//! Buffers are stored as [`Bytes`] so marshalled output can share them without
//! copying. An in-place edit turns the buffer back into a [`BytesMut`] when this
//! ledger is its only owner and copies it otherwise.

use std::mem;

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Source of the buffers used for marshalling, and sink for retired ones.
#[cfg_attr(test, mockall::automock)]
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, size: usize, direct: bool) -> BytesMut;

    /// Hands a buffer back once no header references it any more.
    fn release(&self, buffer: Bytes) {
        drop(buffer);
    }
}

/// Plain heap allocation, no pooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, size: usize, _direct: bool) -> BytesMut {
        BytesMut::with_capacity(size)
    }
}

/// A position inside the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BufPos {
    pub(crate) buffer: usize,
    pub(crate) offset: usize,
}

impl BufPos {
    pub(crate) const fn new(buffer: usize, offset: usize) -> Self {
        Self { buffer, offset }
    }
}

/// Bytes of a single ledger buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    pub(crate) buffer: usize,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

#[derive(Debug)]
struct LedgerEntry {
    data: Bytes,
    /// Bytes before `start` are consumed and never emitted again.
    start: usize,
    /// Bytes from `end` on are not part of the header block.
    end: usize,
}

#[derive(Debug, Default)]
pub(crate) struct BufferLedger {
    entries: Vec<LedgerEntry>,
}

impl BufferLedger {
    pub(crate) fn push(&mut self, data: Bytes) -> usize {
        let end = data.len();
        self.entries.push(LedgerEntry { data, start: 0, end });
        self.entries.len() - 1
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn view(&self, region: Region) -> &[u8] {
        &self.entries[region.buffer].data[region.offset..region.offset + region.len]
    }

    /// Zero-copy handle on the bytes of `region`.
    pub(crate) fn slice(&self, region: Region) -> Bytes {
        self.entries[region.buffer].data.slice(region.offset..region.offset + region.len)
    }

    /// Drops everything from `len` on, e.g. body bytes after the blank line.
    pub(crate) fn truncate_buffer(&mut self, buffer: usize, len: usize) {
        let entry = &mut self.entries[buffer];
        entry.data.truncate(len);
        entry.end = entry.end.min(len);
        entry.start = entry.start.min(entry.end);
    }

    /// First byte still part of the block, or one past the last buffer if the block is empty.
    pub(crate) fn block_start(&self) -> BufPos {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.start < entry.end)
            .map_or(BufPos::new(self.entries.len(), 0), |(index, entry)| BufPos::new(index, entry.start))
    }

    /// Moves the block start forward to `pos`. Buffers wholly before it are retired
    /// and handed to `allocator`.
    pub(crate) fn set_block_start(&mut self, pos: BufPos, allocator: &dyn BufferAllocator) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if index < pos.buffer {
                if !entry.data.is_empty() {
                    trace!(buffer = index, len = entry.data.len(), "retire consumed buffer");
                    allocator.release(mem::take(&mut entry.data));
                }
                entry.start = 0;
                entry.end = 0;
            } else if index == pos.buffer {
                entry.start = pos.offset.min(entry.end);
            } else {
                break;
            }
        }
    }

    /// Ends the block at `pos`, exclusive.
    pub(crate) fn set_block_end(&mut self, pos: BufPos) {
        for (index, entry) in self.entries.iter_mut().enumerate().skip(pos.buffer) {
            if index == pos.buffer {
                entry.end = pos.offset.max(entry.start);
            } else {
                entry.end = entry.start;
            }
        }
    }

    /// Number of block bytes in `[from, to)`.
    pub(crate) fn span_len(&self, from: BufPos, to: BufPos) -> usize {
        (from.buffer..=to.buffer)
            .map(|index| {
                let (lo, hi) = self.bounds(index, from, to);
                hi.saturating_sub(lo)
            })
            .sum()
    }

    /// Writes `bytes` at `from` and blanks the rest of `[from, to)` with spaces.
    /// `bytes` longer than the span are cut off, callers check with [`span_len`](Self::span_len).
    pub(crate) fn overwrite(&mut self, from: BufPos, to: BufPos, bytes: &[u8]) {
        let mut src = bytes;
        for index in from.buffer..=to.buffer {
            let (lo, hi) = self.bounds(index, from, to);
            if lo >= hi {
                continue;
            }
            self.edit(index, |buf| {
                let region = &mut buf[lo..hi];
                let n = src.len().min(region.len());
                region[..n].copy_from_slice(&src[..n]);
                region[n..].fill(b' ');
                src = &src[n..];
            });
        }
    }

    /// Terminator of the last line in the block: its first byte and whether it is `\r\n`.
    pub(crate) fn last_line_break(&self) -> Option<(BufPos, bool)> {
        let mut reversed = self
            .entries
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(index, entry)| (entry.start..entry.end).rev().map(move |offset| (BufPos::new(index, offset), entry.data[offset])));
        let (lf, _) = reversed.find(|&(_, b)| b == b'\n')?;
        match reversed.next() {
            Some((cr, b'\r')) => Some((cr, true)),
            _ => Some((lf, false)),
        }
    }

    fn bounds(&self, index: usize, from: BufPos, to: BufPos) -> (usize, usize) {
        let entry = &self.entries[index];
        let lo = if index == from.buffer { from.offset } else { entry.start };
        let hi = if index == to.buffer { to.offset } else { entry.end };
        (lo, hi)
    }

    fn edit<F: FnOnce(&mut [u8])>(&mut self, index: usize, f: F) {
        let entry = &mut self.entries[index];
        let data = mem::take(&mut entry.data);
        let mut owned = data.try_into_mut().unwrap_or_else(|shared| {
            trace!(buffer = index, len = shared.len(), "buffer shared, copy before edit");
            BytesMut::from(&shared[..])
        });
        f(&mut owned);
        entry.data = owned.freeze();
    }

    /// The block bytes of every buffer, skipping empty ones.
    pub(crate) fn output(&self) -> Vec<Bytes> {
        self.entries.iter().filter(|entry| entry.start < entry.end).map(|entry| entry.data.slice(entry.start..entry.end)).collect()
    }

    /// Removes every buffer and hands it to `allocator`.
    pub(crate) fn release_all(&mut self, allocator: &dyn BufferAllocator) {
        for entry in self.entries.drain(..) {
            if !entry.data.is_empty() {
                allocator.release(entry.data);
            }
        }
    }
}
