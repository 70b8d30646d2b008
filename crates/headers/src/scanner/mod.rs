//! Incremental tokenizer for BNF header blocks.
//!
//! The scanner is fed one input buffer at a time and reports what it found as a
//! [`ScanEvent`]. Running out of bytes is not an error: it returns
//! [`ScanEvent::NeedMoreData`] and picks up where it stopped once the next
//! buffer is loaded. Tokens may straddle any number of buffers.
//!
//! # Grammar
//!
//! ```text
//! block        = *( CRLF ) [ first-line CRLF ] *( header-line ) CRLF
//! header-line  = name ":" OWS value CRLF *( fold )
//! fold         = 1*( SP / HTAB ) value CRLF
//! ```
//!
//! A bare LF is accepted wherever CRLF is. Folded values are reported as
//! separate [`ScanEvent::ValueReady`] events flagged `folded`, joining them is
//! left to the caller.

mod byte_cache;
mod first_line;
mod token;

pub use first_line::{FirstLineHandler, RequestLine, StatusLine};
pub(crate) use token::Token;

use bytes::Bytes;
use tracing::trace;

use crate::buffer::BufPos;
use crate::ensure;
use crate::error::ParseError;
use crate::key::is_token_byte;
use crate::store::element::CrlfAnchor;
use byte_cache::ByteCache;
use token::TokenBuilder;

/// Blank lines tolerated in front of the first line.
pub const MAX_LEADING_BLANK_LINES: usize = 32;

/// Outcome of one scanning step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ScanEvent {
    /// The current buffer is used up.
    NeedMoreData,
    FirstLineToken { index: usize, token: Token },
    FirstLineEnd { line_end: BufPos },
    NameReady { token: Token, anchor: Option<CrlfAnchor>, start: BufPos },
    ValueReady { token: Token, folded: bool, value_end: BufPos, line_end: BufPos },
    /// `block_end` is where the blank line starts, `consumed` the offset after it
    /// in the current buffer.
    EndOfHeaders { block_end: BufPos, consumed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Leading,
    First,
    Blank,
    Value { folded: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    LeadingBlank,
    FirstLineToken(usize),
    FirstLineGap(usize),
    LineStart,
    Name,
    ValueGap { folded: bool },
    Value { folded: bool },
    /// At the first byte of a line terminator.
    Eol(Line),
    /// Read a CR, an LF must follow.
    EolLf(Line),
    Done,
}

#[derive(Debug)]
pub(crate) struct Scanner {
    state: State,
    cache: ByteCache,
    token: TokenBuilder,
    max_token_size: usize,
    validate_chars: bool,
    blank_lines: usize,
    anchor: Option<CrlfAnchor>,
    line_start: BufPos,
    name_start: BufPos,
    terminator: BufPos,
    pending_value: Option<Token>,
    seen_header: bool,
    name_whitespace: bool,
}

impl Scanner {
    pub(crate) fn new(max_token_size: usize, cache_size: usize, validate_chars: bool, first_line: bool, start: BufPos) -> Self {
        Self {
            state: if first_line { State::LeadingBlank } else { State::LineStart },
            cache: ByteCache::new(cache_size),
            token: TokenBuilder::default(),
            max_token_size,
            validate_chars,
            blank_lines: 0,
            anchor: None,
            line_start: start,
            name_start: start,
            terminator: start,
            pending_value: None,
            seen_header: false,
            name_whitespace: false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub(crate) fn load(&mut self, data: Bytes, buffer: usize) {
        trace!(buffer, len = data.len(), state = ?self.state, "scanner load buffer");
        self.cache.load(data, buffer);
        self.token.resume();
    }

    pub(crate) fn next_event(&mut self) -> Result<ScanEvent, ParseError> {
        loop {
            ensure!(self.state != State::Done, ParseError::invalid_header("header block already complete"));

            if self.cache.window_exhausted() {
                self.token.spill(&self.cache);
            }
            let Some(b) = self.cache.peek() else {
                self.token.spill(&self.cache);
                return Ok(ScanEvent::NeedMoreData);
            };

            match self.state {
                State::LeadingBlank => match b {
                    b'\r' | b'\n' => self.state = State::Eol(Line::Leading),
                    _ => {
                        self.token.begin(self.cache.offset());
                        self.state = State::FirstLineToken(0);
                    }
                },

                State::FirstLineToken(index) => match b {
                    b' ' if index < 2 => {
                        let token = self.token.finish(&self.cache);
                        self.cache.advance();
                        self.state = State::FirstLineGap(index + 1);
                        return Ok(ScanEvent::FirstLineToken { index, token });
                    }
                    b'\r' | b'\n' => {
                        let token = self.token.finish(&self.cache);
                        self.state = State::Eol(Line::First);
                        return Ok(ScanEvent::FirstLineToken { index, token });
                    }
                    _ => {
                        self.token.push(b, self.max_token_size)?;
                        self.cache.advance();
                    }
                },

                State::FirstLineGap(index) => match b {
                    b' ' => self.cache.advance(),
                    b'\r' | b'\n' => self.state = State::Eol(Line::First),
                    _ => {
                        self.token.begin(self.cache.offset());
                        self.state = State::FirstLineToken(index);
                    }
                },

                State::LineStart => match b {
                    b'\r' | b'\n' => self.state = State::Eol(Line::Blank),
                    b' ' | b'\t' => {
                        ensure!(self.seen_header, ParseError::OrphanContinuation);
                        self.cache.advance();
                        self.state = State::ValueGap { folded: true };
                    }
                    _ => {
                        self.seen_header = true;
                        self.name_whitespace = false;
                        self.name_start = self.cache.position();
                        self.token.begin(self.cache.offset());
                        self.state = State::Name;
                    }
                },

                State::Name => match b {
                    b':' => {
                        ensure!(self.token.content_len() > 0, ParseError::invalid_header("empty header name"));
                        let token = self.token.finish(&self.cache);
                        self.cache.advance();
                        self.state = State::ValueGap { folded: false };
                        return Ok(ScanEvent::NameReady { token, anchor: self.anchor, start: self.name_start });
                    }
                    b'\r' | b'\n' => return Err(ParseError::invalid_header("line break inside header name")),
                    b' ' | b'\t' => {
                        self.name_whitespace = true;
                        self.token.push(b, self.max_token_size)?;
                        self.cache.advance();
                    }
                    _ => {
                        ensure!(!self.name_whitespace, ParseError::invalid_header("whitespace inside header name"));
                        ensure!(
                            !self.validate_chars || is_token_byte(b),
                            ParseError::invalid_header(format!("invalid character 0x{b:02x} in header name"))
                        );
                        self.token.push(b, self.max_token_size)?;
                        self.cache.advance();
                    }
                },

                State::ValueGap { folded } => match b {
                    b' ' | b'\t' => self.cache.advance(),
                    b'\r' | b'\n' => {
                        self.token.begin(self.cache.offset());
                        self.pending_value = Some(self.token.finish(&self.cache));
                        self.state = State::Eol(Line::Value { folded });
                    }
                    _ => {
                        self.token.begin(self.cache.offset());
                        self.state = State::Value { folded };
                    }
                },

                State::Value { folded } => match b {
                    b'\r' | b'\n' => {
                        self.pending_value = Some(self.token.finish(&self.cache));
                        self.state = State::Eol(Line::Value { folded });
                    }
                    _ => {
                        self.token.push(b, self.max_token_size)?;
                        self.cache.advance();
                    }
                },

                State::Eol(line) => {
                    self.terminator = self.cache.position();
                    self.cache.advance();
                    if b == b'\r' {
                        self.state = State::EolLf(line);
                    } else if let Some(event) = self.complete_line(line, false)? {
                        return Ok(event);
                    }
                }

                State::EolLf(line) => {
                    ensure!(b == b'\n', ParseError::invalid_header("CR not followed by LF"));
                    self.cache.advance();
                    if let Some(event) = self.complete_line(line, true)? {
                        return Ok(event);
                    }
                }

                State::Done => return Err(ParseError::invalid_header("header block already complete")),
            }
        }
    }

    fn complete_line(&mut self, line: Line, is_cr: bool) -> Result<Option<ScanEvent>, ParseError> {
        let line_end = self.cache.position();
        let anchor = CrlfAnchor { pos: self.terminator, is_cr };

        match line {
            Line::Leading => {
                self.blank_lines += 1;
                ensure!(
                    self.blank_lines <= MAX_LEADING_BLANK_LINES,
                    ParseError::TooManyLeadingBlankLines { max_lines: MAX_LEADING_BLANK_LINES }
                );
                self.state = State::LeadingBlank;
                Ok(None)
            }
            Line::First => {
                self.anchor = Some(anchor);
                self.line_start = line_end;
                self.state = State::LineStart;
                Ok(Some(ScanEvent::FirstLineEnd { line_end }))
            }
            Line::Blank => {
                self.state = State::Done;
                let event = ScanEvent::EndOfHeaders { block_end: self.line_start, consumed: self.cache.offset() };
                self.cache.release();
                Ok(Some(event))
            }
            Line::Value { folded } => {
                let token = self.pending_value.take().ok_or_else(|| ParseError::invalid_header("value terminator without value"))?;
                self.anchor = Some(anchor);
                self.line_start = line_end;
                self.state = State::LineStart;
                Ok(Some(ScanEvent::ValueReady { token, folded, value_end: self.terminator, line_end }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Region;

    fn scanner(first_line: bool) -> Scanner {
        Scanner::new(64, 16, true, first_line, BufPos::new(0, 0))
    }

    fn drain(scanner: &mut Scanner) -> Result<Vec<ScanEvent>, ParseError> {
        let mut events = Vec::new();
        loop {
            let event = scanner.next_event()?;
            let stop = matches!(event, ScanEvent::NeedMoreData | ScanEvent::EndOfHeaders { .. });
            events.push(event);
            if stop {
                return Ok(events);
            }
        }
    }

    #[test]
    fn simple_header_block() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b"Foo: bar\r\n\r\n"), 0);
        let events = drain(&mut scanner).unwrap();
        assert_eq!(
            events,
            vec![
                ScanEvent::NameReady { token: Token::Borrowed(Region { buffer: 0, offset: 0, len: 3 }), anchor: None, start: BufPos::new(0, 0) },
                ScanEvent::ValueReady {
                    token: Token::Borrowed(Region { buffer: 0, offset: 5, len: 3 }),
                    folded: false,
                    value_end: BufPos::new(0, 8),
                    line_end: BufPos::new(0, 10),
                },
                ScanEvent::EndOfHeaders { block_end: BufPos::new(0, 10), consumed: 12 },
            ]
        );
        assert!(scanner.is_done());
    }

    #[test]
    fn first_line_tokens_and_anchor() {
        let mut scanner = scanner(true);
        scanner.load(Bytes::from_static(b"\r\nHTTP/1.1 404 Not Found\nA: b\n\n"), 0);
        let events = drain(&mut scanner).unwrap();
        assert!(matches!(events[0], ScanEvent::FirstLineToken { index: 0, .. }));
        assert!(matches!(events[1], ScanEvent::FirstLineToken { index: 1, .. }));
        // crosses the end of the first 16 byte window
        assert_eq!(events[2], ScanEvent::FirstLineToken { index: 2, token: Token::Owned(Bytes::from_static(b"Not Found")) });
        assert_eq!(events[3], ScanEvent::FirstLineEnd { line_end: BufPos::new(0, 25) });
        assert_eq!(
            events[4],
            ScanEvent::NameReady {
                token: Token::Borrowed(Region { buffer: 0, offset: 25, len: 1 }),
                anchor: Some(CrlfAnchor { pos: BufPos::new(0, 24), is_cr: false }),
                start: BufPos::new(0, 25),
            }
        );
    }

    #[test]
    fn folded_value_is_flagged() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b"A: one\r\n  two\r\n\r\n"), 0);
        let events = drain(&mut scanner).unwrap();
        assert!(matches!(events[2], ScanEvent::ValueReady { folded: true, token: Token::Borrowed(Region { offset: 10, len: 3, .. }), .. }));
    }

    #[test]
    fn token_spans_buffers() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b"X-Test: ab"), 0);
        let first = drain(&mut scanner).unwrap();
        assert_eq!(first.last(), Some(&ScanEvent::NeedMoreData));

        scanner.load(Bytes::from_static(b"cde\r\n\r\n"), 1);
        let second = drain(&mut scanner).unwrap();
        assert_eq!(
            second[0],
            ScanEvent::ValueReady {
                token: Token::Owned(Bytes::from_static(b"abcde")),
                folded: false,
                value_end: BufPos::new(1, 3),
                line_end: BufPos::new(1, 5),
            }
        );
    }

    #[test]
    fn value_crossing_window_is_copied() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b"Via: 1.1 proxy.example
A: b

"), 0);
        let events = drain(&mut scanner).unwrap();
        assert_eq!(
            events[1],
            ScanEvent::ValueReady {
                token: Token::Owned(Bytes::from_static(b"1.1 proxy.example")),
                folded: false,
                value_end: BufPos::new(0, 22),
                line_end: BufPos::new(0, 24),
            }
        );
        assert!(matches!(events[3], ScanEvent::ValueReady { token: Token::Borrowed(Region { offset: 27, len: 1, .. }), .. }));
    }

    #[test]
    fn name_rejects_illegal_characters() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b"Fo(o: bar\r\n\r\n"), 0);
        assert!(matches!(drain(&mut scanner), Err(ParseError::InvalidHeader { .. })));
    }

    #[test]
    fn name_trailing_whitespace_is_trimmed() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b"Foo  : bar\r\n\r\n"), 0);
        let events = drain(&mut scanner).unwrap();
        assert!(matches!(events[0], ScanEvent::NameReady { token: Token::Borrowed(Region { len: 3, .. }), .. }));
    }

    #[test]
    fn continuation_without_header() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b" oops\r\n\r\n"), 0);
        assert!(matches!(drain(&mut scanner), Err(ParseError::OrphanContinuation)));
    }

    #[test]
    fn too_many_leading_blank_lines() {
        let mut scanner = scanner(true);
        scanner.load(Bytes::from("\r\n".repeat(MAX_LEADING_BLANK_LINES + 1)), 0);
        assert!(matches!(drain(&mut scanner), Err(ParseError::TooManyLeadingBlankLines { .. })));
    }

    #[test]
    fn bare_cr_is_rejected() {
        let mut scanner = scanner(false);
        scanner.load(Bytes::from_static(b"A: b\rC: d\r\n\r\n"), 0);
        assert!(matches!(drain(&mut scanner), Err(ParseError::InvalidHeader { .. })));
    }

    #[test]
    fn oversized_value() {
        let mut scanner = Scanner::new(4, 16, true, false, BufPos::new(0, 0));
        scanner.load(Bytes::from_static(b"A: 12345\r\n\r\n"), 0);
        assert!(matches!(drain(&mut scanner), Err(ParseError::TooLargeToken { current_size: 5, max_size: 4 })));
    }
}
