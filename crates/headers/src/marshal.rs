//! Writing a header store back out.
//!
//! Three strategies are available:
//!
//! - **reuse**: the buffers the block was parsed from are edited in place.
//!   Removed lines are blanked with spaces, changed values that still fit are
//!   written over the old ones, and only headers that are new or outgrew their
//!   line are serialized into a fresh tail buffer.
//! - **full**: every live header is serialized into freshly allocated buffers.
//! - **binary**: every live header is handed to a [`FieldEncoder`], e.g. a
//!   compressed-header codec of another transport.
//!
//! [`HeaderStore::marshal`] picks reuse while parse buffers are held and fewer
//! than [`change_limit`](crate::HeaderConfig::change_limit) mutations happened,
//! full otherwise. Either way, afterwards the ledger holds exactly the emitted
//! block, so marshalling can be repeated after further changes.
//!
//! The first line of a message is not part of the header block and is never
//! emitted.

use std::mem;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::buffer::{BufPos, BufferAllocator};
use crate::error::MarshalError;
use crate::key::HeaderKey;
use crate::store::element::{CrlfAnchor, RawSpan};
use crate::store::{HeaderId, HeaderStatus, HeaderStore};

const CRLF: &[u8] = b"\r\n";
const COLON_SP: &[u8] = b": ";

/// Headers that only make sense on a single HTTP/1.x connection.
const CONNECTION_SPECIFIC: [&[u8]; 5] = [b"connection", b"keep-alive", b"proxy-connection", b"transfer-encoding", b"upgrade"];

/// Whether a field encoder may add a header to its dynamic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPolicy {
    Incremental,
    /// Used for private keys so their values never enter shared state.
    Never,
}

/// Encodes single header fields for a binary transport.
#[cfg_attr(test, mockall::automock)]
pub trait FieldEncoder {
    fn encode(&mut self, name: &str, value: &[u8], policy: IndexPolicy) -> Result<Bytes, MarshalError>;

    /// Headers the transport does not carry. They are skipped silently.
    fn is_connection_specific(&self, key: &HeaderKey) -> bool {
        CONNECTION_SPECIFIC.iter().any(|name| key.matches(name))
    }
}

/// Serializes header lines into allocator buffers of a fixed size and records
/// where each line ended up, numbering buffers from `base`.
struct BlockWriter<'a> {
    allocator: &'a dyn BufferAllocator,
    chunk_size: usize,
    direct: bool,
    base: usize,
    done: Vec<Bytes>,
    current: BytesMut,
    last_break: Option<CrlfAnchor>,
}

impl<'a> BlockWriter<'a> {
    fn new(allocator: &'a dyn BufferAllocator, chunk_size: usize, direct: bool, base: usize, last_break: Option<CrlfAnchor>) -> Self {
        let current = allocator.allocate(chunk_size, direct);
        Self { allocator, chunk_size, direct, base, done: Vec::new(), current, last_break }
    }

    /// Where the next byte goes.
    fn position(&self) -> BufPos {
        if self.current.len() >= self.chunk_size {
            BufPos::new(self.base + self.done.len() + 1, 0)
        } else {
            BufPos::new(self.base + self.done.len(), self.current.len())
        }
    }

    fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.current.len() >= self.chunk_size {
                let next = self.allocator.allocate(self.chunk_size, self.direct);
                self.done.push(mem::replace(&mut self.current, next).freeze());
            }
            let n = (self.chunk_size - self.current.len()).min(bytes.len());
            self.current.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
        }
    }

    fn write_line(&mut self, name: &str, value: &[u8]) -> RawSpan {
        let start = self.position();
        self.write(name.as_bytes());
        self.write(COLON_SP);
        self.write(value);
        let value_end = self.position();
        self.write(CRLF);
        let span = RawSpan { anchor: self.last_break, start, value_end, line_end: self.position() };
        self.last_break = Some(CrlfAnchor { pos: value_end, is_cr: true });
        span
    }

    /// Writes the blank line. Returns the buffers and where the block ends, blank line excluded.
    fn finish(mut self) -> (Vec<Bytes>, BufPos) {
        let block_end = self.position();
        self.write(CRLF);
        if !self.current.is_empty() {
            self.done.push(self.current.freeze());
        }
        (self.done, block_end)
    }
}

impl HeaderStore {
    /// Serializes the header block, choosing between reuse and full marshalling.
    pub fn marshal(&mut self) -> Vec<Bytes> {
        let changes = self.change_count();
        if !self.ledger.is_empty() && changes < self.config.change_limit {
            debug!(changes, buffers = self.ledger.len(), "reuse marshal");
            self.marshal_reuse()
        } else {
            debug!(changes, buffered = !self.ledger.is_empty(), "full marshal");
            self.marshal_full()
        }
    }

    /// Serializes every live header into new buffers, ignoring the parse buffers.
    pub fn marshal_full(&mut self) -> Vec<Bytes> {
        let allocator = Arc::clone(&self.allocator);
        let mut writer = BlockWriter::new(allocator.as_ref(), self.config.outgoing_buffer_size, self.config.direct_buffers, 0, None);

        for id in self.sequence_ids() {
            let Some(element) = self.arena.get_mut(id) else {
                continue;
            };
            if element.is_live() {
                let value = element.materialize(&self.ledger);
                element.span = Some(writer.write_line(element.key.name(), &value));
                element.status = HeaderStatus::Initial;
            } else {
                element.span = None;
            }
        }

        let (out, block_end) = writer.finish();
        self.ledger.release_all(allocator.as_ref());
        for buffer in &out {
            self.ledger.push(buffer.clone());
        }
        self.ledger.set_block_end(block_end);
        self.reset_changes();
        trace!(buffers = out.len(), "header block serialized");
        out
    }

    fn marshal_reuse(&mut self) -> Vec<Bytes> {
        let mut appended: Vec<HeaderId> = Vec::new();

        for id in self.sequence_ids() {
            let Some(element) = self.arena.get(id) else {
                continue;
            };
            match (element.status, element.span) {
                (HeaderStatus::Initial, _) | (HeaderStatus::Removed, None) => {}
                (HeaderStatus::Removed, Some(span)) => {
                    self.erase(span);
                    self.set_span(id, None);
                }
                (HeaderStatus::Changed, Some(span)) if element.encoded_len() <= self.ledger.span_len(span.start, span.value_end) => {
                    let mut line = Vec::with_capacity(element.encoded_len());
                    line.extend_from_slice(element.key.name().as_bytes());
                    line.extend_from_slice(COLON_SP);
                    line.extend_from_slice(element.value(&self.ledger));
                    trace!(name = element.key.name(), "overlay changed header");
                    self.ledger.overwrite(span.start, span.value_end, &line);
                    if let Some(element) = self.arena.get_mut(id) {
                        element.status = HeaderStatus::Initial;
                    }
                }
                (HeaderStatus::Changed, Some(span)) => {
                    trace!(name = element.key.name(), "changed header outgrew its line");
                    self.erase(span);
                    self.set_span(id, None);
                    appended.push(id);
                }
                (HeaderStatus::Changed | HeaderStatus::Added, None) | (HeaderStatus::Added, Some(_)) => appended.push(id),
            }
        }

        let allocator = Arc::clone(&self.allocator);
        let last_break = self.ledger.last_line_break().map(|(pos, is_cr)| CrlfAnchor { pos, is_cr });
        let mut writer =
            BlockWriter::new(allocator.as_ref(), self.config.outgoing_buffer_size, self.config.direct_buffers, self.ledger.len(), last_break);
        for id in &appended {
            if let Some(element) = self.arena.get_mut(*id) {
                let value = element.materialize(&self.ledger);
                element.span = Some(writer.write_line(element.key.name(), &value));
                element.status = HeaderStatus::Initial;
            }
        }
        let (tail, block_end) = writer.finish();

        let mut out = self.ledger.output();
        for buffer in &tail {
            self.ledger.push(buffer.clone());
        }
        self.ledger.set_block_end(block_end);
        trace!(kept = out.len(), appended = appended.len(), "header buffers reused");
        out.extend(tail);
        self.reset_changes();
        out
    }

    /// Blanks a header line by folding it into the trailing whitespace of the
    /// line before it. The first line of the block is cut off instead.
    ///
    /// The header owning the line before now ends where the erased line ended.
    fn erase(&mut self, span: RawSpan) {
        match span.anchor {
            Some(anchor) if anchor.pos >= self.ledger.block_start() => {
                trace!(cr = anchor.is_cr, "blank removed header line");
                self.ledger.overwrite(anchor.pos, span.value_end, &[]);
                let owner = self.sequence().find(|(_, element)| element.span.is_some_and(|s| s.value_end == anchor.pos)).map(|(id, _)| id);
                if let Some(previous) = owner.and_then(|id| self.arena.get_mut(id)).and_then(|element| element.span.as_mut()) {
                    previous.value_end = span.value_end;
                    previous.line_end = span.line_end;
                }
            }
            _ => {
                trace!("cut removed header line from block start");
                self.ledger.set_block_start(span.line_end, self.allocator.as_ref());
            }
        }
    }

    fn set_span(&mut self, id: HeaderId, span: Option<RawSpan>) {
        if let Some(element) = self.arena.get_mut(id) {
            element.span = span;
        }
    }

    fn reset_changes(&mut self) {
        self.added = 0;
        self.changed = 0;
    }

    /// Hands every live header to `encoder`, in order.
    ///
    /// Parse buffers are released afterwards and the next [`marshal`](Self::marshal)
    /// is a full one. On error the fields encoded so far are released to the
    /// allocator and the store is left unchanged.
    pub fn marshal_binary<E: FieldEncoder + ?Sized>(&mut self, encoder: &mut E) -> Result<Vec<Bytes>, MarshalError> {
        let ids = self.sequence_ids();
        let mut out = Vec::new();

        for &id in &ids {
            let Some(element) = self.arena.get(id).filter(|element| element.is_live()) else {
                continue;
            };
            if encoder.is_connection_specific(&element.key) {
                trace!(name = element.key.name(), "skip connection specific header");
                continue;
            }
            let policy = if element.key.is_private() { IndexPolicy::Never } else { IndexPolicy::Incremental };
            match encoder.encode(element.key.name(), element.value(&self.ledger), policy) {
                Ok(field) => out.push(field),
                Err(e) => {
                    debug!(error = %e, encoded = out.len(), "field encoder failed");
                    for field in out {
                        self.allocator.release(field);
                    }
                    return Err(e);
                }
            }
        }

        for &id in &ids {
            if let Some(element) = self.arena.get_mut(id) {
                if element.is_live() {
                    element.materialize(&self.ledger);
                    element.status = HeaderStatus::Initial;
                }
                element.span = None;
            }
        }
        self.ledger.release_all(self.allocator.as_ref());
        self.reset_changes();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MockBufferAllocator;
    use crate::config::HeaderConfig;
    use crate::scanner::StatusLine;
    use crate::store::ParseStatus;

    fn parse(input: &'static str) -> HeaderStore {
        let mut store = HeaderStore::new();
        assert_eq!(store.parse_headers(Bytes::from_static(input.as_bytes())).unwrap(), ParseStatus::Complete);
        store
    }

    fn joined(out: &[Bytes]) -> String {
        out.iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect()
    }

    fn reparse(out: &[Bytes]) -> Vec<(String, Vec<u8>)> {
        let mut store = HeaderStore::new();
        for buffer in out {
            store.parse_headers(buffer.clone()).unwrap();
        }
        store.headers().map(|(key, value)| (key.name().to_owned(), value.to_vec())).collect()
    }

    #[test]
    fn untouched_block_is_returned_as_is() {
        let mut store = parse("Host: a\r\nAccept: */*\r\n\r\n");
        assert_eq!(joined(&store.marshal()), "Host: a\r\nAccept: */*\r\n\r\n");
    }

    #[test]
    fn reuse_erases_overlays_and_appends() {
        let mut store = parse("Host: a\r\nX-Old: 1\r\nAccept: b\r\n\r\n");
        store.remove_name("X-Old");
        store.set_name("Host", "z").unwrap();
        store.append_name("New", "n").unwrap();

        let out = store.marshal();
        assert_eq!(joined(&out), format!("Host: z{}\r\nAccept: b\r\nNew: n\r\n\r\n", " ".repeat(10)));
        assert_eq!(store.change_count(), 0);
        assert_eq!(
            reparse(&out),
            [("Host".to_owned(), b"z".to_vec()), ("Accept".to_owned(), b"b".to_vec()), ("New".to_owned(), b"n".to_vec())]
        );
    }

    #[test]
    fn repeated_reuse_marshal_edits_appended_lines() {
        let mut store = parse("Host: a\r\nX-Old: 1\r\nAccept: b\r\n\r\n");
        store.remove_name("X-Old");
        store.set_name("Host", "z").unwrap();
        store.append_name("New", "n").unwrap();
        let first = store.marshal();

        store.remove_name("New");
        let second = store.marshal();
        assert_eq!(joined(&second), format!("Host: z{}\r\nAccept: b{}\r\n\r\n", " ".repeat(10), " ".repeat(8)));
        assert_eq!(joined(&first), format!("Host: z{}\r\nAccept: b\r\nNew: n\r\n\r\n", " ".repeat(10)));
    }

    #[test]
    fn reuse_and_full_agree() {
        let input = "Host: a\r\nCookie: c=1\r\nVia: x\r\nVia: y\r\nAccept: b\r\n\r\n";
        let mut reused = parse(input);
        let mut full = parse(input);
        for store in [&mut reused, &mut full] {
            store.remove_instance(&store.key("Via").unwrap(), 0);
            store.set_name("Accept", "text/html; charset=utf-8").unwrap();
            store.set_name("Host", "b").unwrap();
            store.append_name("X-Added", "1").unwrap();
        }
        let reused = reused.marshal();
        let full = full.marshal_full();
        assert_eq!(
            joined(&full),
            "Host: b\r\nCookie: c=1\r\nVia: y\r\nAccept: text/html; charset=utf-8\r\nX-Added: 1\r\n\r\n"
        );
        assert_eq!(reparse(&reused), reparse(&full));
    }

    #[test]
    fn cut_after_erase_skips_blanked_line() {
        let mut store = parse("A: 1\r\nB: 2\r\nC: 3\r\n\r\n");
        store.remove_name("B");
        assert_eq!(joined(&store.marshal()), format!("A: 1{}\r\nC: 3\r\n\r\n", " ".repeat(6)));

        store.remove_name("A");
        let out = store.marshal();
        assert_eq!(joined(&out), "C: 3\r\n\r\n");
        assert_eq!(reparse(&out), [("C".to_owned(), b"3".to_vec())]);
    }

    #[test]
    fn erase_after_erase_and_regrown_value() {
        let mut store = parse("X-A: 0\r\nX-B: 0\r\n\r\n");
        store.append_name("X-C", "1").unwrap();
        store.marshal();

        store.remove_name("X-B");
        store.set_name("X-C", "a much longer value").unwrap();
        let out = store.marshal();
        assert_eq!(reparse(&out), [("X-A".to_owned(), b"0".to_vec()), ("X-C".to_owned(), b"a much longer value".to_vec())]);

        store.remove_name("X-A");
        store.set_name("X-C", "2").unwrap();
        let out = store.marshal();
        assert_eq!(reparse(&out), [("X-C".to_owned(), b"2".to_vec())]);
    }

    #[test]
    fn first_header_is_cut_from_block_start() {
        let mut store = parse("A: 1\r\nB: 2\r\n\r\n");
        store.remove_name("A");
        assert_eq!(joined(&store.marshal()), "B: 2\r\n\r\n");

        store.remove_name("B");
        assert_eq!(joined(&store.marshal()), "\r\n");
    }

    #[test]
    fn first_line_is_not_emitted() {
        let mut store = HeaderStore::new();
        let mut line = StatusLine::default();
        store.parse_message(Bytes::from_static(b"HTTP/1.1 200 OK\r\nA: 1\r\nB: 2\r\n\r\n"), &mut line).unwrap();
        assert_eq!(joined(&store.marshal()), "A: 1\r\nB: 2\r\n\r\n");

        store.remove_name("A");
        assert_eq!(joined(&store.marshal()), "B: 2\r\n\r\n");
    }

    #[test]
    fn grown_value_moves_to_tail() {
        let mut store = parse("A: 1\r\nB: 2\r\n\r\n");
        let a = store.key("A").unwrap();
        store.append(&a, "x").unwrap();
        store.set(&a, "a longer value").unwrap();
        let out = store.marshal();
        assert_eq!(reparse(&out), [("B".to_owned(), b"2".to_vec()), ("A".to_owned(), b"a longer value".to_vec())]);
    }

    #[test]
    fn change_limit_forces_full_marshal() {
        let config = HeaderConfig::builder().change_limit(1).build().unwrap();
        let mut store = HeaderStore::with_config(config).unwrap();
        store.parse_headers(Bytes::from_static(b"A: 1\r\nB: 2\r\n\r\n")).unwrap();
        store.remove_name("A");
        assert_eq!(joined(&store.marshal()), "B: 2\r\n\r\n");
    }

    #[test]
    fn programmatic_store_marshals_fully() {
        let mut store = HeaderStore::new();
        store.append_name("A", "1").unwrap();
        store.append_name("B", "2").unwrap();
        assert_eq!(joined(&store.marshal()), "A: 1\r\nB: 2\r\n\r\n");

        // now backed by the emitted buffers
        store.set_name("A", "9").unwrap();
        assert_eq!(joined(&store.marshal()), "A: 9\r\nB: 2\r\n\r\n");
    }

    #[test]
    fn full_marshal_splits_into_chunks() {
        let config = HeaderConfig::builder().outgoing_buffer_size(32).build().unwrap();
        let mut store = HeaderStore::with_config(config).unwrap();
        store.append_name("X-Long", "a".repeat(40)).unwrap();
        store.append_name("X-Short", "b").unwrap();
        let out = store.marshal_full();
        assert!(out.len() > 1);
        assert!(out.iter().all(|buffer| buffer.len() <= 32));
        let expected = format!("X-Long: {}\r\nX-Short: b\r\n\r\n", "a".repeat(40));
        assert_eq!(joined(&out), expected);

        // overlay spanning a chunk boundary
        store.set_name("X-Long", "c").unwrap();
        store.remove_name("X-Short");
        let out = store.marshal();
        assert_eq!(reparse(&out), [("X-Long".to_owned(), b"c".to_vec())]);
    }

    #[test]
    fn allocator_supplies_output_buffers() {
        let mut allocator = MockBufferAllocator::new();
        allocator.expect_allocate().returning(|size, direct| {
            assert!(direct);
            BytesMut::with_capacity(size)
        });
        allocator.expect_release().return_const(());
        let config = HeaderConfig::builder().direct_buffers(true).build().unwrap();
        let mut store = HeaderStore::with_config(config).unwrap().with_allocator(Arc::new(allocator));
        store.append_name("A", "1").unwrap();
        assert_eq!(joined(&store.marshal()), "A: 1\r\n\r\n");
    }

    #[test]
    fn binary_marshal_skips_connection_headers() {
        let mut store = parse("Host: a\r\nConnection: keep-alive\r\nAuthorization: secret\r\n\r\n");
        let mut encoder = MockFieldEncoder::new();
        encoder.expect_is_connection_specific().returning(|key| key.matches(b"connection"));
        encoder
            .expect_encode()
            .withf(|name, _, policy| (name == "Authorization") == (*policy == IndexPolicy::Never))
            .times(2)
            .returning(|name, value, _| Ok(Bytes::from([name.as_bytes(), &b"="[..], value].concat())));

        let out = store.marshal_binary(&mut encoder).unwrap();
        assert_eq!(out, [Bytes::from_static(b"Host=a"), Bytes::from_static(b"Authorization=secret")]);

        // the parse buffers are gone, values survive
        assert_eq!(store.get_name("Host"), Some(&b"a"[..]));
        assert_eq!(joined(&store.marshal()), "Host: a\r\nConnection: keep-alive\r\nAuthorization: secret\r\n\r\n");
    }

    #[test]
    fn binary_marshal_failure_releases_output() {
        let mut allocator = MockBufferAllocator::new();
        allocator.expect_release().times(1).return_const(());
        let mut store = HeaderStore::new().with_allocator(Arc::new(allocator));
        store.append_name("A", "1").unwrap();
        store.append_name("B", "2").unwrap();

        let mut encoder = MockFieldEncoder::new();
        encoder.expect_is_connection_specific().return_const(false);
        encoder
            .expect_encode()
            .returning(|name, _, _| if name == "A" { Ok(Bytes::from_static(b"A")) } else { Err(MarshalError::frame("table full")) });

        assert!(matches!(store.marshal_binary(&mut encoder), Err(MarshalError::Frame { .. })));
        assert_eq!(store.change_count(), 2);
    }

    #[test]
    fn default_connection_specific_names() {
        struct Plain;
        impl FieldEncoder for Plain {
            fn encode(&mut self, _: &str, value: &[u8], _: IndexPolicy) -> Result<Bytes, MarshalError> {
                Ok(Bytes::copy_from_slice(value))
            }
        }
        let store = HeaderStore::new();
        assert!(Plain.is_connection_specific(&store.key("Transfer-Encoding").unwrap()));
        assert!(!Plain.is_connection_specific(&store.key("Host").unwrap()));
    }
}
