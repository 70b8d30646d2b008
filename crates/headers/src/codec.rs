//! [`tokio_util::codec`] adapters.
//!
//! [`MessageDecoder`] parses a first line plus header block out of a stream and
//! leaves whatever follows the blank line in the read buffer for the body
//! decoder. A stream that ends inside a header block is an error. [`HeaderEncoder`] writes a marshalled header block.

use std::mem;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::error::{MarshalError, ParseError};
use crate::scanner::FirstLineHandler;
use crate::store::{HeaderStore, ParseStatus};

/// Yields the first line and the headers of each message in a stream.
///
/// Every chunk handed to the decoder is moved into the pending store without
/// copying, so the returned store references the read buffers directly.
#[derive(Debug)]
pub struct MessageDecoder<F> {
    store: HeaderStore,
    first_line: F,
}

impl<F: FirstLineHandler + Default> MessageDecoder<F> {
    /// `template` supplies the config and collaborators of every decoded store.
    pub fn new(template: &HeaderStore) -> Self {
        Self { store: template.empty_like(), first_line: F::default() }
    }
}

impl<F: FirstLineHandler + Default> Default for MessageDecoder<F> {
    fn default() -> Self {
        Self { store: HeaderStore::new(), first_line: F::default() }
    }
}

impl<F: FirstLineHandler + Default> Decoder for MessageDecoder<F> {
    type Item = (F, HeaderStore);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let chunk = src.split().freeze();
        let status = match self.store.parse_message(chunk, &mut self.first_line) {
            Ok(status) => status,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        match status {
            ParseStatus::NeedMoreData => {
                src.reserve(self.store.config().incoming_buffer_size);
                Ok(None)
            }
            ParseStatus::Complete => {
                let fresh = self.store.empty_like();
                let mut store = mem::replace(&mut self.store, fresh);
                if let Some(body) = store.take_remainder() {
                    trace!(len = body.len(), "return body bytes to read buffer");
                    src.extend_from_slice(&body);
                }
                Ok(Some((mem::take(&mut self.first_line), store)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.store.is_parsing() => {
                debug!(headers = self.store.len(), "stream ended inside a header block");
                self.reset();
                Err(ParseError::invalid_header("incomplete header block at end of stream"))
            }
            None => Ok(None),
        }
    }
}

impl<F: FirstLineHandler + Default> MessageDecoder<F> {
    fn reset(&mut self) {
        self.store.clear();
        self.first_line = F::default();
    }
}

/// Writes the header block of a store, picking the marshal strategy the store prefers.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEncoder;

impl<'a> Encoder<&'a mut HeaderStore> for HeaderEncoder {
    type Error = MarshalError;

    fn encode(&mut self, store: &'a mut HeaderStore, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let out = store.marshal();
        dst.reserve(out.iter().map(Bytes::len).sum());
        for buffer in out {
            dst.extend_from_slice(&buffer);
        }
        Ok(())
    }
}
