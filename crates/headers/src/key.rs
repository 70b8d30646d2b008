//! Header name handles.
//!
//! A [`HeaderKey`] is an immutable, cheaply cloned handle carrying an ordinal, the
//! canonical spelling of the name and a couple of flags. Keys are the only thing
//! shared between header stores of concurrent messages, so they are reference
//! counted with `triomphe::Arc` and never mutated after creation.
//!
//! Names are resolved through a [`KeyResolver`]; [`KeyRegistry`] is the default
//! one. It knows the standard names exported by the `http` crate plus whatever
//! was [`register`](KeyRegistry::register)ed explicitly. Names seen only on the
//! wire get an unregistered key that is compared by name, so peers cannot grow
//! the shared table.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use http::header;
use once_cell::sync::Lazy;
use tracing::{trace, warn};

/// Per-key behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFlags {
    filtered: bool,
    private: bool,
}

impl KeyFlags {
    pub const NONE: KeyFlags = KeyFlags { filtered: false, private: false };

    /// Values must pass the store's [`HeaderFilter`](crate::store::HeaderFilter) before being stored.
    pub const fn filtered(mut self) -> Self {
        self.filtered = true;
        self
    }

    /// Values must never be written to logs.
    pub const fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub const fn is_filtered(&self) -> bool {
        self.filtered
    }

    pub const fn is_private(&self) -> bool {
        self.private
    }
}

struct KeyInner {
    ordinal: u32,
    name: Box<str>,
    lower: Box<[u8]>,
    flags: KeyFlags,
}

/// Ordinal of keys that are not in any registry.
pub const UNREGISTERED: u32 = u32::MAX;

#[derive(Clone)]
pub struct HeaderKey(triomphe::Arc<KeyInner>);

impl HeaderKey {
    /// A key for `name` that no registry knows about.
    pub fn unregistered(name: &str) -> Self {
        Self::new(UNREGISTERED, name, KeyFlags::NONE)
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.0.ordinal != UNREGISTERED
    }

    fn new(ordinal: u32, name: &str, flags: KeyFlags) -> Self {
        let lower = name.as_bytes().to_ascii_lowercase().into_boxed_slice();
        Self(triomphe::Arc::new(KeyInner { ordinal, name: name.into(), lower, flags }))
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        self.0.ordinal
    }

    /// Canonical spelling, used when the header is serialized.
    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[inline]
    pub fn lower_name(&self) -> &[u8] {
        &self.0.lower
    }

    #[inline]
    pub fn flags(&self) -> KeyFlags {
        self.0.flags
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.0.flags.is_private()
    }

    pub fn matches(&self, name: &[u8]) -> bool {
        self.0.lower.eq_ignore_ascii_case(name)
    }
}

impl PartialEq for HeaderKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ordinal == other.0.ordinal && (self.is_registered() || self.0.lower == other.0.lower)
    }
}

impl Eq for HeaderKey {}

impl Hash for HeaderKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.ordinal.hash(state);
        if !self.is_registered() {
            self.0.lower.hash(state);
        }
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderKey").field("ordinal", &self.0.ordinal).field("name", &self.0.name).finish()
    }
}

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// Maps raw header names onto keys. Lookups are case-insensitive and unknown
/// names get a synthesized key rather than an error.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, name: &[u8]) -> HeaderKey;
}

/// `tchar` from RFC 9110 section 5.6.2.
#[inline]
pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_FORWARDED_BY: &str = "X-Forwarded-By";
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
pub const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
pub const X_FORWARDED_PORT: &str = "X-Forwarded-Port";

fn standard_names() -> Vec<header::HeaderName> {
    vec![
        header::ACCEPT,
        header::ACCEPT_CHARSET,
        header::ACCEPT_ENCODING,
        header::ACCEPT_LANGUAGE,
        header::ACCEPT_RANGES,
        header::AGE,
        header::ALLOW,
        header::CACHE_CONTROL,
        header::CONNECTION,
        header::CONTENT_DISPOSITION,
        header::CONTENT_ENCODING,
        header::CONTENT_LANGUAGE,
        header::CONTENT_LENGTH,
        header::CONTENT_LOCATION,
        header::CONTENT_RANGE,
        header::CONTENT_TYPE,
        header::DATE,
        header::ETAG,
        header::EXPECT,
        header::EXPIRES,
        header::FORWARDED,
        header::FROM,
        header::HOST,
        header::IF_MATCH,
        header::IF_MODIFIED_SINCE,
        header::IF_NONE_MATCH,
        header::IF_RANGE,
        header::IF_UNMODIFIED_SINCE,
        header::LAST_MODIFIED,
        header::LOCATION,
        header::ORIGIN,
        header::PRAGMA,
        header::RANGE,
        header::REFERER,
        header::RETRY_AFTER,
        header::SERVER,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::USER_AGENT,
        header::VARY,
        header::VIA,
        header::WWW_AUTHENTICATE,
    ]
}

fn sensitive_names() -> [header::HeaderName; 4] {
    [header::AUTHORIZATION, header::COOKIE, header::SET_COOKIE, header::PROXY_AUTHORIZATION]
}

static EXTRA_NAMES: &[&str] = &["Keep-Alive", "Proxy-Connection", X_FORWARDED_FOR, X_FORWARDED_BY, X_FORWARDED_PROTO, X_FORWARDED_HOST, X_FORWARDED_PORT];

/// `content-length` -> `Content-Length`
fn title_case(lower: &str) -> String {
    let mut out = String::with_capacity(lower.len());
    let mut upper_next = true;
    for c in lower.chars() {
        out.push(if upper_next { c.to_ascii_uppercase() } else { c });
        upper_next = c == '-';
    }
    out
}

static SHARED: Lazy<Arc<KeyRegistry>> = Lazy::new(|| Arc::new(KeyRegistry::new()));

#[derive(Default)]
struct Interned {
    by_name: HashMap<Box<[u8]>, HeaderKey>,
    next_ordinal: u32,
}

/// Default [`KeyResolver`]: well-known names plus explicitly registered ones.
pub struct KeyRegistry {
    table: RwLock<Interned>,
}

impl fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.table.read().unwrap_or_else(PoisonError::into_inner).by_name.len();
        f.debug_struct("KeyRegistry").field("keys", &len).finish()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    pub fn new() -> Self {
        let registry = Self { table: RwLock::new(Interned::default()) };
        for name in standard_names() {
            registry.register(&title_case(name.as_str()), KeyFlags::NONE);
        }
        for name in sensitive_names() {
            registry.register(&title_case(name.as_str()), KeyFlags::NONE.private());
        }
        for name in EXTRA_NAMES {
            registry.register(name, KeyFlags::NONE);
        }
        registry
    }

    /// The process-wide registry used by stores that are not given one explicitly.
    pub fn shared() -> Arc<KeyRegistry> {
        Arc::clone(&SHARED)
    }

    /// Registers `name` with `flags`, or returns the existing key if the name is known.
    ///
    /// Once every ordinal is taken the name is not registered and an
    /// unregistered key without flags is returned.
    pub fn register(&self, name: &str, flags: KeyFlags) -> HeaderKey {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let lower = name.as_bytes().to_ascii_lowercase().into_boxed_slice();
        if let Some(key) = table.by_name.get(&lower) {
            return key.clone();
        }
        if table.next_ordinal == UNREGISTERED {
            warn!(name, "key registry is full");
            return HeaderKey::unregistered(name);
        }
        let key = HeaderKey::new(table.next_ordinal, name, flags);
        table.next_ordinal += 1;
        table.by_name.insert(lower, key.clone());
        key
    }

    pub fn find(&self, name: &[u8]) -> Option<HeaderKey> {
        let lower = name.to_ascii_lowercase();
        self.table.read().unwrap_or_else(PoisonError::into_inner).by_name.get(lower.as_slice()).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyResolver for KeyRegistry {
    fn resolve(&self, name: &[u8]) -> HeaderKey {
        if let Some(key) = self.find(name) {
            return key;
        }
        // header names are restricted to tchar, anything else was filtered before
        let key = HeaderKey::unregistered(&String::from_utf8_lossy(name));
        trace!(name = key.name(), "synthesized header key");
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_case_insensitive() {
        let registry = KeyRegistry::new();
        let a = registry.resolve(b"content-length");
        let b = registry.resolve(b"CONTENT-LENGTH");
        assert_eq!(a, b);
        assert_eq!(a.name(), "Content-Length");
        assert!(a.matches(b"Content-length"));
    }

    #[test]
    fn unknown_names_are_not_interned() {
        let registry = KeyRegistry::new();
        let before = registry.len();
        let a = registry.resolve(b"X-Test");
        let b = registry.resolve(b"x-test");
        assert_eq!(a, b);
        assert_ne!(a, registry.resolve(b"X-Other"));
        assert_eq!(a.name(), "X-Test");
        assert!(!a.is_registered());
        assert_eq!(registry.len(), before);
        assert!(registry.find(b"x-test").is_none());
    }

    #[test]
    fn unregistered_keys_hash_by_name() {
        let registry = KeyRegistry::new();
        let mut seen = HashMap::new();
        seen.insert(registry.resolve(b"X-Test"), 1);
        seen.insert(registry.resolve(b"X-Other"), 2);
        seen.insert(registry.resolve(b"Host"), 3);
        assert_eq!(seen.get(&registry.resolve(b"x-TEST")), Some(&1));
        assert_eq!(seen.get(&registry.resolve(b"x-other")), Some(&2));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn full_registry_hands_out_unregistered_keys() {
        let registry = KeyRegistry::new();
        registry.table.write().unwrap().next_ordinal = UNREGISTERED;
        let before = registry.len();
        let key = registry.register("X-Late", KeyFlags::NONE.private());
        assert!(!key.is_registered());
        assert!(!key.is_private());
        assert_eq!(registry.len(), before);
        assert!(registry.resolve(b"Host").is_registered());
    }

    #[test]
    fn sensitive_names_are_private() {
        let registry = KeyRegistry::new();
        assert!(registry.resolve(b"authorization").is_private());
        assert!(registry.resolve(b"Cookie").is_private());
        assert!(!registry.resolve(b"Host").is_private());
    }

    #[test]
    fn register_keeps_first_flags() {
        let registry = KeyRegistry::new();
        let key = registry.register("X-Secret", KeyFlags::NONE.filtered().private());
        assert!(key.flags().is_filtered());
        let again = registry.register("x-secret", KeyFlags::NONE);
        assert!(again.flags().is_filtered());
    }

    #[test]
    fn title_case_names() {
        assert_eq!(title_case("content-length"), "Content-Length");
        assert_eq!(title_case("host"), "Host");
    }

    #[test]
    fn token_bytes() {
        assert!(is_token_byte(b'a'));
        assert!(is_token_byte(b'-'));
        assert!(!is_token_byte(b':'));
        assert!(!is_token_byte(b' '));
        assert!(!is_token_byte(b'\r'));
    }
}
