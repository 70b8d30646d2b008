use std::fmt;

use bytes::Bytes;

use crate::buffer::{BufPos, BufferLedger, Region};
use crate::key::HeaderKey;
use crate::store::HeaderId;
use crate::utils::latin1_to_string;

/// Lifecycle of a header relative to the last parse or marshal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// Came from parsing (or was already marshalled) and is untouched since.
    Initial,
    /// Added since the last marshal.
    Added,
    /// Value replaced since the last marshal.
    Changed,
    /// Tombstone, kept so its bytes can still be located and erased.
    Removed,
}

/// The line terminator in front of a header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CrlfAnchor {
    pub(crate) pos: BufPos,
    /// `\r\n` rather than a bare `\n`.
    pub(crate) is_cr: bool,
}

/// Where a header line lives in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawSpan {
    /// `None` for the first line of a block.
    pub(crate) anchor: Option<CrlfAnchor>,
    /// First byte of the name.
    pub(crate) start: BufPos,
    /// Terminator of the (last continuation) line.
    pub(crate) value_end: BufPos,
    /// One past the terminator.
    pub(crate) line_end: BufPos,
}

#[derive(Debug, Clone)]
pub(crate) enum ElementValue {
    /// Still inside a ledger buffer.
    Borrowed(Region),
    Owned(Bytes),
}

pub(crate) struct HeaderElement {
    pub(crate) key: HeaderKey,
    pub(crate) value: ElementValue,
    /// Latin-1 decoded form, filled on first text access.
    pub(crate) text: Option<String>,
    pub(crate) status: HeaderStatus,
    pub(crate) prev: Option<HeaderId>,
    pub(crate) next: Option<HeaderId>,
    pub(crate) next_instance: Option<HeaderId>,
    pub(crate) span: Option<RawSpan>,
}

impl HeaderElement {
    pub(crate) fn new(key: HeaderKey, value: ElementValue, status: HeaderStatus, span: Option<RawSpan>) -> Self {
        Self { key, value, text: None, status, prev: None, next: None, next_instance: None, span }
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.status != HeaderStatus::Removed
    }

    pub(crate) fn value<'a>(&'a self, ledger: &'a BufferLedger) -> &'a [u8] {
        match &self.value {
            ElementValue::Borrowed(region) => ledger.view(*region),
            ElementValue::Owned(bytes) => bytes,
        }
    }

    pub(crate) fn value_len(&self) -> usize {
        match &self.value {
            ElementValue::Borrowed(region) => region.len,
            ElementValue::Owned(bytes) => bytes.len(),
        }
    }

    /// `name: value` without the terminator.
    pub(crate) fn encoded_len(&self) -> usize {
        self.key.name().len() + 2 + self.value_len()
    }

    /// Turns a borrowed value into an owned one. The ledger buffer is shared, not copied.
    pub(crate) fn materialize(&mut self, ledger: &BufferLedger) -> Bytes {
        match &self.value {
            ElementValue::Borrowed(region) => {
                let bytes = ledger.slice(*region);
                self.value = ElementValue::Owned(bytes.clone());
                bytes
            }
            ElementValue::Owned(bytes) => bytes.clone(),
        }
    }

    pub(crate) fn text(&mut self, ledger: &BufferLedger) -> &str {
        if self.text.is_none() {
            let text = latin1_to_string(self.value(ledger));
            self.text = Some(text);
        }
        self.text.as_deref().unwrap_or_default()
    }

    pub(crate) fn replace_value(&mut self, value: Bytes, text: Option<String>) {
        self.value = ElementValue::Owned(value);
        self.text = text;
        if self.status == HeaderStatus::Initial {
            self.status = HeaderStatus::Changed;
        }
    }
}

impl fmt::Debug for HeaderElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderElement")
            .field("key", &self.key.name())
            .field("status", &self.status)
            .field("value_len", &self.value_len())
            .field("span", &self.span)
            .field("prev", &self.prev)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}
