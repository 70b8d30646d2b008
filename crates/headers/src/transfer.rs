//! Binary format for moving a header set between processes.
//!
//! All integers are big-endian `i32`.
//!
//! ```text
//! V1:  count  { name-len name-utf8  value-len value-utf8 }*
//! V2:  -2  count  { name-len name-bytes  value-len value-bytes }*
//! ```
//!
//! V1 carries values as text, so every value byte goes through the ISO-8859-1
//! mapping and is UTF-8 encoded on the wire. V2 carries raw bytes and writes a
//! value length of `-1` for an empty value. A reader tells the two apart by the
//! first integer: V1 counts are never negative.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::ensure;
use crate::error::{CodecError, HeaderError};
use crate::store::HeaderStore;
use crate::utils::{latin1_to_string, string_to_latin1};

pub const V2_MARKER: i32 = -2;

const ABSENT: i32 = -1;

fn put_len(dst: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    let Ok(len) = i32::try_from(len) else {
        return Err(CodecError::TooLong { len });
    };
    dst.put_i32(len);
    Ok(())
}

fn put_field(dst: &mut BytesMut, field: &[u8]) -> Result<(), CodecError> {
    put_len(dst, field.len())?;
    dst.put_slice(field);
    Ok(())
}

fn finish(dst: BytesMut, written: usize, store: &HeaderStore) -> Result<Bytes, CodecError> {
    ensure!(written == store.len(), CodecError::count_mismatch(store.len(), written));
    trace!(headers = written, len = dst.len(), "header set encoded");
    Ok(dst.freeze())
}

/// Writes the live headers of `store` in the legacy text format.
pub fn encode_v1(store: &HeaderStore) -> Result<Bytes, CodecError> {
    let mut dst = BytesMut::new();
    put_len(&mut dst, store.len())?;
    let mut written = 0;
    for (key, value) in store.headers() {
        put_field(&mut dst, key.name().as_bytes())?;
        put_field(&mut dst, latin1_to_string(value).as_bytes())?;
        written += 1;
    }
    finish(dst, written, store)
}

/// Writes the live headers of `store` as raw bytes.
pub fn encode_v2(store: &HeaderStore) -> Result<Bytes, CodecError> {
    let mut dst = BytesMut::new();
    dst.put_i32(V2_MARKER);
    put_len(&mut dst, store.len())?;
    let mut written = 0;
    for (key, value) in store.headers() {
        put_field(&mut dst, key.name().as_bytes())?;
        if value.is_empty() {
            dst.put_i32(ABSENT);
        } else {
            put_field(&mut dst, value)?;
        }
        written += 1;
    }
    finish(dst, written, store)
}

fn read_i32(src: &mut &[u8], what: &'static str) -> Result<i32, CodecError> {
    ensure!(src.remaining() >= 4, CodecError::truncated(what));
    Ok(src.get_i32())
}

fn read_field<'a>(src: &mut &'a [u8], what: &'static str) -> Result<&'a [u8], CodecError> {
    let len = read_i32(src, what)?;
    if len == ABSENT {
        return Ok(&[]);
    }
    let Ok(len) = usize::try_from(len) else {
        return Err(CodecError::InvalidLength { length: len });
    };
    ensure!(src.len() >= len, CodecError::truncated(what));
    let (field, rest) = src.split_at(len);
    *src = rest;
    Ok(field)
}

/// Appends the headers encoded in `src`, either version, to `store`.
/// Returns the number of headers read.
///
/// The whole input is read and checked before the first header is appended,
/// so on error `store` is left as it was.
pub fn decode(mut src: &[u8], store: &mut HeaderStore) -> Result<usize, CodecError> {
    let first = read_i32(&mut src, "header count")?;
    let (v2, count) = match first {
        V2_MARKER => (true, read_i32(&mut src, "header count")?),
        count if count >= 0 => (false, count),
        version => return Err(CodecError::UnknownVersion { version }),
    };
    let Ok(count) = usize::try_from(count) else {
        return Err(CodecError::InvalidLength { length: count });
    };

    let max_headers = store.config.max_headers;
    ensure!(store.len().saturating_add(count) <= max_headers, HeaderError::too_many_headers(max_headers).into());

    // every header takes at least 8 bytes
    let mut decoded = Vec::with_capacity(count.min(src.len() / 8));
    for _ in 0..count {
        let name = read_field(&mut src, "header name")?;
        let value = read_field(&mut src, "header value")?;
        let key = store.key(&String::from_utf8_lossy(name))?;
        let value = if v2 { Bytes::copy_from_slice(value) } else { Bytes::from(string_to_latin1(&String::from_utf8_lossy(value))) };
        ensure!(store.passes_filter(&key, &value), HeaderError::rejected(key.name()).into());
        decoded.push((key, value));
    }

    for (key, value) in decoded {
        store.append(&key, value)?;
    }
    trace!(headers = count, v2, "header set decoded");
    Ok(count)
}
