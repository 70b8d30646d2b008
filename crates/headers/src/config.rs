//! Limits and toggles for a header store.
//!
//! Every knob lives on [`HeaderConfig`]; nothing is process-wide. A config is
//! either built through [`HeaderConfigBuilder`] (validated on `build`) or
//! deserialized with serde, in which case [`HeaderConfig::validate`] is run when
//! the store is created.

use serde::Deserialize;

use crate::ensure;
use crate::error::ConfigError;

pub const DEFAULT_MAX_TOKEN_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_HEADERS: usize = 500;
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_BYTE_CACHE_SIZE: usize = 512;
pub const DEFAULT_CHANGE_LIMIT: usize = 1000;

const MIN_BUFFER_SIZE: usize = 32;
const MIN_BYTE_CACHE_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Longest header name, value (including folded continuations) or first-line token.
    pub max_token_size: usize,
    /// Maximum number of live headers in one store.
    pub max_headers: usize,
    /// Size of each buffer allocated while marshalling.
    pub outgoing_buffer_size: usize,
    /// Capacity reserved in the read buffer while a header block is incomplete.
    pub incoming_buffer_size: usize,
    /// Window the scanner reads from the current input buffer at a time.
    pub byte_cache_size: usize,
    /// Number of changes after which marshalling re-serializes everything.
    pub change_limit: usize,
    /// Forwarded to the [`BufferAllocator`](crate::buffer::BufferAllocator).
    pub direct_buffers: bool,
    /// Reject header names containing non-token characters.
    pub validate_chars: bool,
    /// Extract client address information from forwarding headers.
    pub track_remote_ip: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            max_token_size: DEFAULT_MAX_TOKEN_SIZE,
            max_headers: DEFAULT_MAX_HEADERS,
            outgoing_buffer_size: DEFAULT_BUFFER_SIZE,
            incoming_buffer_size: DEFAULT_BUFFER_SIZE,
            byte_cache_size: DEFAULT_BYTE_CACHE_SIZE,
            change_limit: DEFAULT_CHANGE_LIMIT,
            direct_buffers: false,
            validate_chars: true,
            track_remote_ip: false,
        }
    }
}

impl HeaderConfig {
    pub fn builder() -> HeaderConfigBuilder {
        HeaderConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.max_token_size >= 1, ConfigError::new("max_token_size", "must be at least 1"));
        ensure!(self.max_headers >= 1, ConfigError::new("max_headers", "must be at least 1"));
        ensure!(
            self.outgoing_buffer_size >= MIN_BUFFER_SIZE,
            ConfigError::new("outgoing_buffer_size", format!("must be at least {MIN_BUFFER_SIZE}"))
        );
        ensure!(
            self.incoming_buffer_size >= MIN_BUFFER_SIZE,
            ConfigError::new("incoming_buffer_size", format!("must be at least {MIN_BUFFER_SIZE}"))
        );
        ensure!(
            self.byte_cache_size >= MIN_BYTE_CACHE_SIZE,
            ConfigError::new("byte_cache_size", format!("must be at least {MIN_BYTE_CACHE_SIZE}"))
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct HeaderConfigBuilder {
    config: HeaderConfig,
}

impl HeaderConfigBuilder {
    pub fn max_token_size(mut self, size: usize) -> Self {
        self.config.max_token_size = size;
        self
    }

    pub fn max_headers(mut self, num: usize) -> Self {
        self.config.max_headers = num;
        self
    }

    pub fn outgoing_buffer_size(mut self, size: usize) -> Self {
        self.config.outgoing_buffer_size = size;
        self
    }

    pub fn incoming_buffer_size(mut self, size: usize) -> Self {
        self.config.incoming_buffer_size = size;
        self
    }

    pub fn byte_cache_size(mut self, size: usize) -> Self {
        self.config.byte_cache_size = size;
        self
    }

    pub fn change_limit(mut self, limit: usize) -> Self {
        self.config.change_limit = limit;
        self
    }

    pub fn direct_buffers(mut self, direct: bool) -> Self {
        self.config.direct_buffers = direct;
        self
    }

    pub fn validate_chars(mut self, validate: bool) -> Self {
        self.config.validate_chars = validate;
        self
    }

    pub fn track_remote_ip(mut self, track: bool) -> Self {
        self.config.track_remote_ip = track;
        self
    }

    pub fn build(self) -> Result<HeaderConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
