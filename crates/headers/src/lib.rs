//! A streaming header block parser that can write a modified block back onto the
//! buffers it was parsed from.
//!
//! This crate handles BNF `name: value` header blocks as used by HTTP/1.x style
//! protocols. Input arrives as any number of discontiguous buffers; parsed values
//! stay in those buffers until they are asked for, and marshalling a block that
//! changed only a little edits the original bytes instead of serializing every
//! header again.
//!
//! # Features
//!
//! - Incremental parsing, tokens may straddle any number of input buffers
//! - Zero-copy values, materialized and cached on first use
//! - In-place re-marshalling: removed lines are blanked, shorter values overlaid,
//!   only new headers serialized
//! - Multiple instances per header name with stable [`HeaderId`] handles
//! - Optional filtering of selected header values before they are stored
//! - Binary transfer formats for handing a header set to another process
//! - Client address extraction from `Forwarded` and `X-Forwarded-*`
//! - [`tokio_util::codec`] adapters
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use micro_headers::{HeaderStore, ParseStatus};
//!
//! let mut store = HeaderStore::new();
//! assert_eq!(store.parse_headers(Bytes::from_static(b"Host: example.com\r\nX-Test: ab")).unwrap(), ParseStatus::NeedMoreData);
//! assert_eq!(store.parse_headers(Bytes::from_static(b"cde\r\n\r\n")).unwrap(), ParseStatus::Complete);
//! assert_eq!(store.get_name("x-test"), Some(&b"abcde"[..]));
//!
//! store.remove_name("X-Test");
//! store.append_name("Via", "1.1 proxy").unwrap();
//!
//! let block: Vec<u8> = store.marshal().concat();
//! assert!(block.starts_with(b"Host: example.com"));
//! assert!(block.ends_with(b"\r\nVia: 1.1 proxy\r\n\r\n"));
//! ```
//!
//! # Architecture
//!
//! - [`scanner`]: byte-level tokenizer and the [`FirstLineHandler`] hook
//! - [`store`]: the [`HeaderStore`] and its element arena
//! - [`buffer`]: the ledger of parse buffers and the [`BufferAllocator`] collaborator
//! - [`marshal`]: reuse, full and binary marshalling
//! - [`transfer`]: the V1/V2 binary transfer formats
//! - [`forwarding`]: the forwarding header extractor
//! - [`codec`]: `Decoder`/`Encoder` implementations
//! - [`key`]: header keys and their resolution
//!
//! # Error Handling
//!
//! - [`ParseError`]: malformed input, the message should be dropped
//! - [`HeaderError`]: a single mutation was refused
//! - [`CodecError`]: transfer format failures
//! - [`MarshalError`]: a field encoder failed
//! - [`ConfigError`]: a configuration value out of range
//!
//! # Limitations
//!
//! - A store must not be used from more than one thread at a time
//! - Header values are treated as ISO-8859-1 text

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod key;
pub mod marshal;
pub mod scanner;
pub mod store;
pub mod transfer;

mod utils;
pub(crate) use utils::ensure;

pub use buffer::{BufferAllocator, HeapAllocator};
pub use config::{HeaderConfig, HeaderConfigBuilder};
pub use error::{CodecError, ConfigError, HeaderError, MarshalError, ParseError};
pub use forwarding::ForwardedInfo;
pub use key::{HeaderKey, KeyFlags, KeyRegistry, KeyResolver};
pub use marshal::{FieldEncoder, IndexPolicy};
pub use scanner::{FirstLineHandler, RequestLine, StatusLine};
pub use store::{HeaderFilter, HeaderId, HeaderStatus, HeaderStore, ParseStatus};
