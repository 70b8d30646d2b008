//! Header Element Store.
//!
//! A [`HeaderStore`] holds the headers of one message. It is filled either by
//! feeding it input buffers ([`parse_headers`](HeaderStore::parse_headers),
//! [`parse_message`](HeaderStore::parse_message)) or through the mutation API,
//! and turned back into bytes by the marshal methods.
//!
//! Elements live in an arena and are linked twice: once in a single sequence
//! chain holding every element in the order it was encountered, and once in a
//! per-key instance chain. Removing a header only marks it as a tombstone; it
//! stays linked until [`clear`](HeaderStore::clear) so the reuse marshaller can
//! still find and blank out its bytes.
//!
//! Parsed values are not copied out of the input buffers. They stay borrowed
//! from the buffer ledger until they are requested as [`Bytes`] or text.

pub(crate) mod arena;
pub(crate) mod element;

use std::collections::HashMap;
use std::fmt;
use std::iter;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

pub use arena::HeaderId;
pub use element::HeaderStatus;

use crate::buffer::{BufPos, BufferAllocator, BufferLedger, HeapAllocator};
use crate::config::HeaderConfig;
use crate::ensure;
use crate::error::{ConfigError, HeaderError, ParseError};
use crate::forwarding::ForwardedInfo;
use crate::key::{HeaderKey, KeyRegistry, KeyResolver, is_token_byte};
use crate::scanner::{FirstLineHandler, ScanEvent, Scanner, Token};
use arena::Arena;
use element::{CrlfAnchor, ElementValue, HeaderElement, RawSpan};

/// Ordinals below this are tracked in the presence bitmap.
const PRESENCE_BITS: u32 = 256;

pub(crate) const REDACTED: &str = "<redacted>";

/// Decides whether a value may be stored under a key flagged as filtered.
#[cfg_attr(test, mockall::automock)]
pub trait HeaderFilter: Send + Sync {
    fn allow(&self, key: &HeaderKey, value: &[u8], is_private: bool) -> bool;
}

/// Progress of a parse call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Every byte was consumed but the blank line has not been seen yet.
    NeedMoreData,
    Complete,
}

#[derive(Debug, Clone, Copy)]
struct Chain {
    head: HeaderId,
    tail: HeaderId,
}

/// A header whose name was scanned but whose value may still get continuation lines.
#[derive(Debug)]
struct PendingHeader {
    key: HeaderKey,
    anchor: Option<CrlfAnchor>,
    start: BufPos,
    value: ElementValue,
    value_end: BufPos,
    line_end: BufPos,
}

/// Renders a header value for logs, hiding values of private keys.
#[derive(Debug)]
pub(crate) struct LogValue<'a> {
    key: &'a HeaderKey,
    value: &'a [u8],
}

impl<'a> LogValue<'a> {
    pub(crate) fn new(key: &'a HeaderKey, value: &'a [u8]) -> Self {
        Self { key, value }
    }
}

impl fmt::Display for LogValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_private() { f.write_str(REDACTED) } else { write!(f, "{}", self.value.escape_ascii()) }
    }
}

pub struct HeaderStore {
    pub(crate) config: HeaderConfig,
    resolver: Arc<dyn KeyResolver>,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    filter: Option<Arc<dyn HeaderFilter>>,
    pub(crate) arena: Arena,
    roots: HashMap<HeaderKey, Chain>,
    presence: [u64; 4],
    head: Option<HeaderId>,
    tail: Option<HeaderId>,
    live: usize,
    pub(crate) added: usize,
    pub(crate) changed: usize,
    pub(crate) ledger: BufferLedger,
    scanner: Option<Scanner>,
    pending: Option<PendingHeader>,
    remainder: Option<Bytes>,
    forwarding: ForwardedInfo,
}

impl Default for HeaderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderStore {
    pub fn new() -> Self {
        Self::build(HeaderConfig::default(), KeyRegistry::shared(), Arc::new(HeapAllocator), None)
    }

    pub fn with_config(config: HeaderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, KeyRegistry::shared(), Arc::new(HeapAllocator), None))
    }

    fn build(
        config: HeaderConfig,
        resolver: Arc<dyn KeyResolver>,
        allocator: Arc<dyn BufferAllocator>,
        filter: Option<Arc<dyn HeaderFilter>>,
    ) -> Self {
        Self {
            config,
            resolver,
            allocator,
            filter,
            arena: Arena::default(),
            roots: HashMap::new(),
            presence: [0; 4],
            head: None,
            tail: None,
            live: 0,
            added: 0,
            changed: 0,
            ledger: BufferLedger::default(),
            scanner: None,
            pending: None,
            remainder: None,
            forwarding: ForwardedInfo::default(),
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn HeaderFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// A fresh store with the same config and collaborators.
    pub fn empty_like(&self) -> Self {
        Self::build(self.config.clone(), Arc::clone(&self.resolver), Arc::clone(&self.allocator), self.filter.as_ref().map(Arc::clone))
    }

    pub fn config(&self) -> &HeaderConfig {
        &self.config
    }

    /// Resolves `name` into a key, checking it is a legal header name.
    pub fn key(&self, name: &str) -> Result<HeaderKey, HeaderError> {
        ensure!(!name.is_empty(), HeaderError::invalid_name("empty header name"));
        ensure!(
            !self.config.validate_chars || name.bytes().all(is_token_byte),
            HeaderError::invalid_name(format!("illegal character in {name:?}"))
        );
        Ok(self.resolver.resolve(name.as_bytes()))
    }

    // ---------------------------------------------------------------- parsing

    /// Feeds the next buffer of a header block that has no first line.
    ///
    /// Call again with the following buffer while [`ParseStatus::NeedMoreData`]
    /// is returned. The buffer is kept in the store; values of parsed headers
    /// point into it.
    pub fn parse_headers(&mut self, buf: Bytes) -> Result<ParseStatus, ParseError> {
        self.parse(buf, None)
    }

    /// Like [`parse_headers`](Self::parse_headers) for a block that starts with a
    /// request or status line. The three whitespace separated tokens of that line
    /// go to `first_line`.
    pub fn parse_message<F: FirstLineHandler>(&mut self, buf: Bytes, first_line: &mut F) -> Result<ParseStatus, ParseError> {
        self.parse(buf, Some(first_line))
    }

    /// Whether a block has been started but its blank line not seen yet.
    pub fn is_parsing(&self) -> bool {
        self.scanner.as_ref().is_some_and(|scanner| !scanner.is_done())
    }

    /// Bytes that followed the blank line in the last parsed buffer, usually the start of a body.
    pub fn take_remainder(&mut self) -> Option<Bytes> {
        self.remainder.take()
    }

    fn parse(&mut self, buf: Bytes, first_line: Option<&mut dyn FirstLineHandler>) -> Result<ParseStatus, ParseError> {
        ensure!(
            !self.scanner.as_ref().is_some_and(Scanner::is_done),
            ParseError::invalid_header("header block already complete")
        );

        let buffer = self.ledger.len();
        let mut scanner = match self.scanner.take() {
            Some(scanner) => scanner,
            None => Scanner::new(
                self.config.max_token_size,
                self.config.byte_cache_size,
                self.config.validate_chars,
                first_line.is_some(),
                BufPos::new(buffer, 0),
            ),
        };

        trace!(buffer, len = buf.len(), "feed header buffer");
        self.ledger.push(buf.clone());
        scanner.load(buf.clone(), buffer);

        let result = self.drive(&mut scanner, &buf, buffer, first_line);
        self.scanner = Some(scanner);
        if let Err(e) = &result {
            debug!(error = %e, "header block rejected");
        }
        result
    }

    fn drive(
        &mut self,
        scanner: &mut Scanner,
        buf: &Bytes,
        buffer: usize,
        mut first_line: Option<&mut dyn FirstLineHandler>,
    ) -> Result<ParseStatus, ParseError> {
        loop {
            match scanner.next_event()? {
                ScanEvent::NeedMoreData => return Ok(ParseStatus::NeedMoreData),

                ScanEvent::FirstLineToken { index, token } => {
                    let handler = first_line.as_deref_mut().ok_or_else(|| ParseError::invalid_first_line("no first line handler"))?;
                    let bytes = token_bytes(&self.ledger, token);
                    match index {
                        0 => handler.first_token(&bytes)?,
                        1 => handler.second_token(&bytes)?,
                        _ => handler.third_token(&bytes)?,
                    }
                }

                ScanEvent::FirstLineEnd { line_end } => {
                    if let Some(handler) = first_line.as_deref_mut() {
                        handler.finish()?;
                    }
                    self.ledger.set_block_start(line_end, self.allocator.as_ref());
                }

                ScanEvent::NameReady { token, anchor, start } => {
                    self.commit_pending()?;
                    let name = token_bytes(&self.ledger, token);
                    let key = self.resolver.resolve(&name);
                    self.pending = Some(PendingHeader {
                        key,
                        anchor,
                        start,
                        value: ElementValue::Owned(Bytes::new()),
                        value_end: start,
                        line_end: start,
                    });
                }

                ScanEvent::ValueReady { token, folded, value_end, line_end } => {
                    let max = self.config.max_token_size;
                    let pending = self.pending.as_mut().ok_or(ParseError::OrphanContinuation)?;
                    if folded {
                        let fragment = token_bytes(&self.ledger, token);
                        if !fragment.is_empty() {
                            let current = match &pending.value {
                                ElementValue::Borrowed(region) => self.ledger.view(*region),
                                ElementValue::Owned(bytes) => bytes,
                            };
                            let separator = usize::from(!current.is_empty());
                            let joined_len = current.len() + separator + fragment.len();
                            ensure!(joined_len <= max, ParseError::too_large_token(joined_len, max));

                            let mut joined = BytesMut::with_capacity(joined_len);
                            joined.extend_from_slice(current);
                            if separator > 0 {
                                joined.put_u8(b' ');
                            }
                            joined.extend_from_slice(&fragment);
                            trace!(len = joined_len, "joined folded header value");
                            pending.value = ElementValue::Owned(joined.freeze());
                        }
                    } else {
                        pending.value = match token {
                            Token::Borrowed(region) => ElementValue::Borrowed(region),
                            Token::Owned(bytes) => ElementValue::Owned(bytes),
                        };
                    }
                    pending.value_end = value_end;
                    pending.line_end = line_end;
                }

                ScanEvent::EndOfHeaders { block_end, consumed } => {
                    self.commit_pending()?;
                    self.ledger.set_block_end(block_end);
                    self.ledger.truncate_buffer(buffer, consumed);
                    if consumed < buf.len() {
                        self.remainder = Some(buf.slice(consumed..));
                    }
                    debug!(headers = self.live, buffers = self.ledger.len(), "header block complete");
                    return Ok(ParseStatus::Complete);
                }
            }
        }
    }

    fn commit_pending(&mut self) -> Result<(), ParseError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let span = RawSpan { anchor: pending.anchor, start: pending.start, value_end: pending.value_end, line_end: pending.line_end };
        let mut element = HeaderElement::new(pending.key, pending.value, HeaderStatus::Initial, Some(span));

        if !self.passes_filter(&element.key, element.value(&self.ledger)) {
            // stays linked as a tombstone so its line is blanked when marshalled
            debug!(name = element.key.name(), "parsed header rejected by filter");
            element.status = HeaderStatus::Removed;
            self.changed += 1;
            self.link(element);
            return Ok(());
        }

        ensure!(self.live < self.config.max_headers, ParseError::too_many_headers(self.config.max_headers));
        if self.config.track_remote_ip {
            self.forwarding.observe(&element.key, element.value(&self.ledger));
        }
        trace!(name = element.key.name(), value = %LogValue::new(&element.key, element.value(&self.ledger)), "header committed");
        self.link(element);
        Ok(())
    }

    // --------------------------------------------------------------- chaining

    pub(crate) fn passes_filter(&self, key: &HeaderKey, value: &[u8]) -> bool {
        !key.flags().is_filtered() || self.filter.as_ref().is_none_or(|filter| filter.allow(key, value, key.is_private()))
    }

    fn link(&mut self, mut element: HeaderElement) -> HeaderId {
        let element_key = element.key.clone();
        let ordinal = element_key.ordinal();
        let live = element.is_live();
        element.prev = self.tail;
        element.next = None;
        element.next_instance = None;
        let id = self.arena.insert(element);

        match self.tail {
            Some(tail) => {
                if let Some(prev) = self.arena.get_mut(tail) {
                    prev.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        match self.roots.get_mut(&element_key) {
            Some(chain) => {
                if let Some(last) = self.arena.get_mut(chain.tail) {
                    last.next_instance = Some(id);
                }
                chain.tail = id;
            }
            None => {
                self.roots.insert(element_key, Chain { head: id, tail: id });
            }
        }

        if ordinal < PRESENCE_BITS {
            self.presence[(ordinal / 64) as usize] |= 1 << (ordinal % 64);
        }
        if live {
            self.live += 1;
        }
        id
    }

    fn may_contain(&self, ordinal: u32) -> bool {
        ordinal >= PRESENCE_BITS || self.presence[(ordinal / 64) as usize] & (1 << (ordinal % 64)) != 0
    }

    /// Every instance of `key`, tombstones included.
    fn instances<'a>(&'a self, key: &HeaderKey) -> impl Iterator<Item = (HeaderId, &'a HeaderElement)> + use<'a> {
        let mut cursor = if self.may_contain(key.ordinal()) { self.roots.get(key).map(|chain| chain.head) } else { None };
        iter::from_fn(move || {
            let id = cursor?;
            let element = self.arena.get(id)?;
            cursor = element.next_instance;
            Some((id, element))
        })
    }

    fn live_instances<'a>(&'a self, key: &HeaderKey) -> impl Iterator<Item = (HeaderId, &'a HeaderElement)> + use<'a> {
        self.instances(key).filter(|(_, element)| element.is_live())
    }

    /// Every element in encounter order, tombstones included.
    pub(crate) fn sequence(&self) -> impl Iterator<Item = (HeaderId, &HeaderElement)> {
        let mut cursor = self.head;
        iter::from_fn(move || {
            let id = cursor?;
            let element = self.arena.get(id)?;
            cursor = element.next;
            Some((id, element))
        })
    }

    pub(crate) fn sequence_ids(&self) -> Vec<HeaderId> {
        self.sequence().map(|(id, _)| id).collect()
    }

    // --------------------------------------------------------------- mutation

    /// Adds another instance of `key`, leaving existing ones alone.
    pub fn append(&mut self, key: &HeaderKey, value: impl Into<Bytes>) -> Result<HeaderId, HeaderError> {
        let value = value.into();
        ensure!(self.passes_filter(key, &value), HeaderError::rejected(key.name()));
        ensure!(self.live < self.config.max_headers, HeaderError::too_many_headers(self.config.max_headers));
        Ok(self.add(key.clone(), value))
    }

    pub fn append_name(&mut self, name: &str, value: impl Into<Bytes>) -> Result<HeaderId, HeaderError> {
        let key = self.key(name)?;
        self.append(&key, value)
    }

    fn add(&mut self, key: HeaderKey, value: Bytes) -> HeaderId {
        if self.config.track_remote_ip {
            self.forwarding.observe(&key, &value);
        }
        trace!(name = key.name(), value = %LogValue::new(&key, &value), "header added");
        self.added += 1;
        self.link(HeaderElement::new(key, ElementValue::Owned(value), HeaderStatus::Added, None))
    }

    /// Leaves exactly one instance of `key`, holding `value`.
    ///
    /// The first existing instance is updated in place when it has not been
    /// written out yet or when the new line fits where the old one was.
    /// Otherwise it is removed and the header is added again at the end.
    ///
    /// If the filter rejects `value` every instance of `key` is removed.
    pub fn set(&mut self, key: &HeaderKey, value: impl Into<Bytes>) -> Result<HeaderId, HeaderError> {
        let value = value.into();
        if !self.passes_filter(key, &value) {
            let removed = self.remove(key);
            debug!(name = key.name(), removed, "header rejected by filter");
            return Err(HeaderError::rejected(key.name()));
        }

        let mut existing = self.live_instances(key).map(|(id, _)| id).collect::<Vec<_>>().into_iter();
        let Some(first) = existing.next() else {
            ensure!(self.live < self.config.max_headers, HeaderError::too_many_headers(self.config.max_headers));
            return Ok(self.add(key.clone(), value));
        };
        for id in existing {
            self.remove_by_id(id);
        }

        let encoded_len = key.name().len() + 2 + value.len();
        let fits = match self.arena.get(first).and_then(|element| element.span) {
            None => true,
            Some(span) => !self.ledger.is_empty() && encoded_len <= self.ledger.span_len(span.start, span.value_end),
        };
        if !fits {
            trace!(name = key.name(), encoded_len, "new value outgrows its line, re-adding");
            self.remove_by_id(first);
            return Ok(self.add(key.clone(), value));
        }

        if self.config.track_remote_ip {
            self.forwarding.observe(key, &value);
        }
        trace!(name = key.name(), value = %LogValue::new(key, &value), "header replaced in place");
        if let Some(element) = self.arena.get_mut(first) {
            element.replace_value(value, None);
        }
        self.changed += 1;
        Ok(first)
    }

    pub fn set_name(&mut self, name: &str, value: impl Into<Bytes>) -> Result<HeaderId, HeaderError> {
        let key = self.key(name)?;
        self.set(&key, value)
    }

    /// Removes every instance of `key`, returning how many there were.
    pub fn remove(&mut self, key: &HeaderKey) -> usize {
        let ids = self.live_instances(key).map(|(id, _)| id).collect::<Vec<_>>();
        ids.into_iter().filter(|&id| self.remove_by_id(id)).count()
    }

    pub fn remove_name(&mut self, name: &str) -> usize {
        let key = self.resolver.resolve(name.as_bytes());
        self.remove(&key)
    }

    /// Removes the `index`-th live instance of `key`.
    pub fn remove_instance(&mut self, key: &HeaderKey, index: usize) -> bool {
        let id = self.live_instances(key).nth(index).map(|(id, _)| id);
        id.is_some_and(|id| self.remove_by_id(id))
    }

    /// Returns `false` if `id` is stale or already removed.
    pub fn remove_by_id(&mut self, id: HeaderId) -> bool {
        let Some(element) = self.arena.get_mut(id).filter(|element| element.is_live()) else {
            return false;
        };
        element.status = HeaderStatus::Removed;
        element.text = None;
        self.live -= 1;
        self.changed += 1;
        trace!(name = element.key.name(), "header removed");
        true
    }

    /// Drops every header and hands all buffers back to the allocator.
    /// Ids issued before stop resolving.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.roots.clear();
        self.presence = [0; 4];
        self.head = None;
        self.tail = None;
        self.live = 0;
        self.added = 0;
        self.changed = 0;
        self.ledger.release_all(self.allocator.as_ref());
        self.scanner = None;
        self.pending = None;
        self.remainder = None;
        self.forwarding.reset();
    }

    // ------------------------------------------------------------------ query

    /// Value of the first instance of `key`, borrowed from the store.
    pub fn get(&self, key: &HeaderKey) -> Option<&[u8]> {
        self.get_instance(key, 0)
    }

    pub fn get_instance(&self, key: &HeaderKey, index: usize) -> Option<&[u8]> {
        self.live_instances(key).nth(index).map(|(_, element)| element.value(&self.ledger))
    }

    pub fn get_name(&self, name: &str) -> Option<&[u8]> {
        let key = self.resolver.resolve(name.as_bytes());
        self.get(&key)
    }

    pub fn get_all(&self, key: &HeaderKey) -> Vec<&[u8]> {
        self.live_instances(key).map(|(_, element)| element.value(&self.ledger)).collect()
    }

    /// Value of the first instance of `key` as shared bytes. Parsed values are
    /// sliced out of their input buffer once and cached.
    pub fn get_bytes(&mut self, key: &HeaderKey) -> Option<Bytes> {
        let (id, _) = self.live_instances(key).next()?;
        let element = self.arena.get_mut(id)?;
        Some(element.materialize(&self.ledger))
    }

    /// Value of the first instance of `key` decoded as ISO-8859-1.
    pub fn get_text(&mut self, key: &HeaderKey) -> Option<&str> {
        let (id, _) = self.live_instances(key).next()?;
        let element = self.arena.get_mut(id)?;
        Some(element.text(&self.ledger))
    }

    pub fn value_by_id(&self, id: HeaderId) -> Option<&[u8]> {
        self.arena.get(id).filter(|element| element.is_live()).map(|element| element.value(&self.ledger))
    }

    pub fn count_instances(&self, key: &HeaderKey) -> usize {
        self.live_instances(key).count()
    }

    pub fn contains(&self, key: &HeaderKey) -> bool {
        self.live_instances(key).next().is_some()
    }

    /// Live headers in encounter order.
    pub fn headers(&self) -> impl Iterator<Item = (&HeaderKey, &[u8])> {
        self.sequence().filter(|(_, element)| element.is_live()).map(|(_, element)| (&element.key, element.value(&self.ledger)))
    }

    /// Every element in encounter order with its status, tombstones included.
    pub fn debug_entries(&self) -> impl Iterator<Item = (&HeaderKey, HeaderStatus)> {
        self.sequence().map(|(_, element)| (&element.key, element.status))
    }

    /// Number of live headers.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Mutations since the last parse or marshal.
    pub fn change_count(&self) -> usize {
        self.added + self.changed
    }

    /// Client address information gathered from forwarding headers. Only
    /// filled when [`HeaderConfig::track_remote_ip`] is set.
    pub fn forwarding(&self) -> &ForwardedInfo {
        &self.forwarding
    }
}

fn token_bytes(ledger: &BufferLedger, token: Token) -> Bytes {
    match token {
        Token::Borrowed(region) => ledger.slice(region),
        Token::Owned(bytes) => bytes,
    }
}

struct DebugHeaders<'a>(&'a HeaderStore);

impl fmt::Debug for DebugHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.0;
        f.debug_list()
            .entries(store.sequence().map(|(_, element)| {
                let value = element.is_live().then(|| LogValue::new(&element.key, element.value(&store.ledger)).to_string());
                (element.key.name(), element.status, value)
            }))
            .finish()
    }
}

impl fmt::Debug for HeaderStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderStore")
            .field("live", &self.live)
            .field("changes", &self.change_count())
            .field("buffers", &self.ledger.len())
            .field("headers", &DebugHeaders(self))
            .finish_non_exhaustive()
    }
}
