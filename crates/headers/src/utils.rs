//! Utility macros and functions for the headers crate.
//!
//! This module provides helper macros and functions that are used internally
//! by the parser and the marshaller.

/// A macro for early returns with an error if a condition is not met.
///
/// This is similar to the `assert!` macro, but returns an error instead of panicking.
/// It's useful for validation checks where you want to return early with an error
/// if some condition is not satisfied.
///
/// # Example
///
/// ```ignore
/// ensure!(token_len <= limit, ParseError::too_large_token(token_len, limit));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

/// Maps every byte to the code point with the same value (ISO-8859-1).
///
/// Header values are single-byte-per-character on the wire, so no multi-byte
/// decoding is attempted.
pub(crate) fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`latin1_to_string`]. Characters above U+00FF are replaced by `?`.
pub(crate) fn string_to_latin1(text: &str) -> Vec<u8> {
    text.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_is_one_byte_per_char() {
        let raw = [b'a', 0xE9, b'z', 0xFF];
        let text = latin1_to_string(&raw);
        assert_eq!(text.chars().count(), 4);
        assert_eq!(text, "a\u{e9}z\u{ff}");
        assert_eq!(string_to_latin1(&text), raw.to_vec());
    }

    #[test]
    fn wide_chars_degrade_to_question_mark() {
        assert_eq!(string_to_latin1("a\u{4e2d}b"), b"a?b".to_vec());
    }
}
