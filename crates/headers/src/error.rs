use std::io;
use thiserror::Error;

/// Malformed input found while scanning a header block.
///
/// The message that produced it must be abandoned: no partially parsed header
/// set is trustworthy after one of these.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("token size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeToken { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("too many leading blank lines, limit is {max_lines}")]
    TooManyLeadingBlankLines { max_lines: usize },

    #[error("continuation line without a preceding header")]
    OrphanContinuation,

    #[error("invalid first line: {reason}")]
    InvalidFirstLine { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_token(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeToken { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_first_line<S: ToString>(str: S) -> Self {
        Self::InvalidFirstLine { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Failure of a programmatic mutation of a header store.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("header {name} rejected by filter")]
    Rejected { name: String },

    #[error("invalid header name: {reason}")]
    InvalidName { reason: String },
}

impl HeaderError {
    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn rejected<S: ToString>(name: S) -> Self {
        Self::Rejected { name: name.to_string() }
    }

    pub fn invalid_name<S: ToString>(str: S) -> Self {
        Self::InvalidName { reason: str.to_string() }
    }
}

impl From<HeaderError> for ParseError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::TooManyHeaders { max_num } => ParseError::too_many_headers(max_num),
            e => ParseError::invalid_header(e),
        }
    }
}

/// Errors of the cross-process transfer format.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("header count mismatch, expected: {expected} actual: {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("input truncated while reading {what}")]
    Truncated { what: &'static str },

    #[error("invalid length prefix {length}")]
    InvalidLength { length: i32 },

    #[error("field of {len} bytes does not fit a length prefix")]
    TooLong { len: usize },

    #[error("unknown transfer version {version}")]
    UnknownVersion { version: i32 },

    #[error("decoded header rejected: {source}")]
    Header {
        #[from]
        source: HeaderError,
    },
}

impl CodecError {
    pub fn count_mismatch(expected: usize, actual: usize) -> Self {
        Self::CountMismatch { expected, actual }
    }

    pub fn truncated(what: &'static str) -> Self {
        Self::Truncated { what }
    }
}

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("field encoder failed: {reason}")]
    Frame { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl MarshalError {
    pub fn frame<S: ToString>(str: S) -> Self {
        Self::Frame { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// A configuration value outside of its legal range.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid config `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new<S: ToString>(field: &'static str, reason: S) -> Self {
        Self { field, reason: reason.to_string() }
    }
}
