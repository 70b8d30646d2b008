//! Hooks for the line in front of a header block.
//!
//! The scanner splits the first line into up to three tokens: the first two end
//! at a space, the third runs to the end of the line and may contain spaces
//! (a reason phrase). What the tokens mean is up to the protocol, so they are
//! handed to a [`FirstLineHandler`].

use bytes::Bytes;
use http::{Method, StatusCode, Uri, Version};

use crate::ensure;
use crate::error::ParseError;

pub trait FirstLineHandler {
    fn first_token(&mut self, token: &[u8]) -> Result<(), ParseError>;

    fn second_token(&mut self, token: &[u8]) -> Result<(), ParseError>;

    fn third_token(&mut self, token: &[u8]) -> Result<(), ParseError>;

    /// Called once the line terminator was read. Missing tokens are reported here.
    fn finish(&mut self) -> Result<(), ParseError> {
        Ok(())
    }
}

fn parse_version(token: &[u8]) -> Result<Version, ParseError> {
    match token {
        b"HTTP/1.1" => Ok(Version::HTTP_11),
        b"HTTP/1.0" => Ok(Version::HTTP_10),
        b"HTTP/0.9" => Ok(Version::HTTP_09),
        b"HTTP/2" | b"HTTP/2.0" => Ok(Version::HTTP_2),
        _ => Err(ParseError::invalid_first_line(format!("invalid http version {}", String::from_utf8_lossy(token)))),
    }
}

/// `method SP request-target SP HTTP-version`
#[derive(Debug, Default, Clone)]
pub struct RequestLine {
    method: Option<Method>,
    uri: Option<Uri>,
    version: Option<Version>,
}

impl RequestLine {
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn uri(&self) -> Option<&Uri> {
        self.uri.as_ref()
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }
}

impl FirstLineHandler for RequestLine {
    fn first_token(&mut self, token: &[u8]) -> Result<(), ParseError> {
        let method = Method::from_bytes(token).map_err(|e| ParseError::invalid_first_line(e.to_string()))?;
        self.method = Some(method);
        Ok(())
    }

    fn second_token(&mut self, token: &[u8]) -> Result<(), ParseError> {
        let uri = Uri::try_from(token).map_err(|e| ParseError::invalid_first_line(e.to_string()))?;
        self.uri = Some(uri);
        Ok(())
    }

    fn third_token(&mut self, token: &[u8]) -> Result<(), ParseError> {
        self.version = Some(parse_version(token)?);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ParseError> {
        ensure!(self.method.is_some(), ParseError::invalid_first_line("missing method"));
        ensure!(self.uri.is_some(), ParseError::invalid_first_line("missing request target"));
        ensure!(self.version.is_some(), ParseError::invalid_first_line("missing http version"));
        Ok(())
    }
}

/// `HTTP-version SP status-code SP [ reason-phrase ]`
#[derive(Debug, Default, Clone)]
pub struct StatusLine {
    version: Option<Version>,
    status: Option<StatusCode>,
    reason: Bytes,
}

impl StatusLine {
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn reason(&self) -> &[u8] {
        &self.reason
    }
}

impl FirstLineHandler for StatusLine {
    fn first_token(&mut self, token: &[u8]) -> Result<(), ParseError> {
        self.version = Some(parse_version(token)?);
        Ok(())
    }

    fn second_token(&mut self, token: &[u8]) -> Result<(), ParseError> {
        let status = StatusCode::from_bytes(token).map_err(|e| ParseError::invalid_first_line(e.to_string()))?;
        self.status = Some(status);
        Ok(())
    }

    fn third_token(&mut self, token: &[u8]) -> Result<(), ParseError> {
        self.reason = Bytes::copy_from_slice(token);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ParseError> {
        ensure!(self.version.is_some(), ParseError::invalid_first_line("missing http version"));
        ensure!(self.status.is_some(), ParseError::invalid_first_line("missing status code"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_tokens() {
        let mut line = RequestLine::default();
        line.first_token(b"GET").unwrap();
        line.second_token(b"/index.html?a=1").unwrap();
        line.third_token(b"HTTP/1.1").unwrap();
        line.finish().unwrap();
        assert_eq!(line.method(), Some(&Method::GET));
        assert_eq!(line.uri().unwrap().path(), "/index.html");
        assert_eq!(line.version(), Some(Version::HTTP_11));
    }

    #[test]
    fn request_line_without_version_fails() {
        let mut line = RequestLine::default();
        line.first_token(b"GET").unwrap();
        line.second_token(b"/").unwrap();
        assert!(matches!(line.finish(), Err(ParseError::InvalidFirstLine { .. })));
    }

    #[test]
    fn status_line_reason_is_optional() {
        let mut line = StatusLine::default();
        line.first_token(b"HTTP/1.0").unwrap();
        line.second_token(b"204").unwrap();
        line.finish().unwrap();
        assert_eq!(line.status(), Some(StatusCode::NO_CONTENT));
        assert!(line.reason().is_empty());
    }

    #[test]
    fn bad_version_is_rejected() {
        parse_version(b"HTTP/1.2").unwrap_err();
    }
}
