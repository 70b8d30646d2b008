//! Client address extraction from forwarding headers.
//!
//! Two header families carry the original client address through proxies: the
//! de-facto `X-Forwarded-For/-By/-Proto/-Host/-Port` set, and the RFC 7239
//! `Forwarded` header. A message is interpreted with one family only. As soon as
//! a `Forwarded` header shows up, anything learned from `X-Forwarded-*` is
//! dropped and later `X-Forwarded-*` headers are ignored.
//!
//! A malformed `Forwarded` header collapses everything to "unknown" and turns
//! extraction off for the rest of the message. It never fails the message.

use tracing::{debug, trace};

use crate::key::HeaderKey;
use crate::utils::latin1_to_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Family {
    #[default]
    Unset,
    Legacy,
    Standard,
}

/// What the forwarding headers of one message say about the original client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedInfo {
    family: Family,
    error: bool,
    for_list: Vec<String>,
    by_list: Vec<String>,
    proto: Option<String>,
    host: Option<String>,
    port: Option<String>,
}

impl ForwardedInfo {
    /// Addresses of the `for` nodes, client first.
    pub fn forwarded_for(&self) -> Option<&[String]> {
        (!self.for_list.is_empty()).then_some(self.for_list.as_slice())
    }

    /// Addresses of the `by` nodes.
    pub fn forwarded_by(&self) -> Option<&[String]> {
        (!self.by_list.is_empty()).then_some(self.by_list.as_slice())
    }

    pub fn proto(&self) -> Option<&str> {
        self.proto.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Port of the original client. For `Forwarded` this comes from the first `for` node only.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// A malformed `Forwarded` header was seen and extraction is off for this message.
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// The standardized `Forwarded` header is the source of this information.
    pub fn is_standard(&self) -> bool {
        self.family == Family::Standard
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    fn discard_values(&mut self) {
        self.for_list.clear();
        self.by_list.clear();
        self.proto = None;
        self.host = None;
        self.port = None;
    }

    pub(crate) fn observe(&mut self, key: &HeaderKey, value: &[u8]) {
        if self.error {
            return;
        }
        let name = key.lower_name();
        if name.starts_with(b"forwarded") {
            if name == b"forwarded" {
                self.observe_standard(&latin1_to_string(value));
            } else {
                trace!(name = key.name(), "not a forwarded header, ignored");
            }
        } else if let Some(suffix) = name.strip_prefix(b"x-forwarded") {
            self.observe_legacy(suffix, &latin1_to_string(value));
        }
    }

    fn observe_legacy(&mut self, suffix: &[u8], value: &str) {
        if self.family == Family::Standard {
            trace!("forwarded header already seen, ignore x-forwarded header");
            return;
        }
        self.family = Family::Legacy;

        match suffix {
            b"-for" => push_list(&mut self.for_list, value),
            b"-by" => push_list(&mut self.by_list, value),
            b"-proto" => {
                let proto = value.trim();
                if is_valid_proto(proto) {
                    self.proto = Some(proto.to_owned());
                } else {
                    debug!(proto, "invalid x-forwarded-proto value, ignored");
                }
            }
            b"-host" => self.host = Some(value.to_owned()),
            b"-port" => self.port = Some(value.to_owned()),
            _ => {}
        }
    }

    fn observe_standard(&mut self, value: &str) {
        if self.family != Family::Standard {
            if self.family == Family::Legacy {
                debug!("forwarded header present, discard x-forwarded state");
            }
            self.discard_values();
            self.family = Family::Standard;
        }

        if let Err(reason) = self.parse_forwarded(value) {
            debug!(reason, "malformed forwarded header, forwarding information discarded");
            self.discard_values();
            self.error = true;
        }
    }

    fn parse_forwarded(&mut self, value: &str) -> Result<(), &'static str> {
        for pair in value.split(';').flat_map(|part| part.split(',')) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, raw) = pair.split_once('=').ok_or("missing '=' in forwarded pair")?;
            let parameter = unquote(raw.trim())?;
            if parameter.is_empty() {
                return Err("empty forwarded parameter");
            }

            match name.trim().to_ascii_lowercase().as_str() {
                "for" => {
                    let (address, port) = parse_node(parameter)?;
                    if self.for_list.is_empty() {
                        self.port = port.map(str::to_owned);
                    }
                    self.for_list.push(address.to_owned());
                }
                "by" => {
                    let (address, _) = parse_node(parameter)?;
                    self.by_list.push(address.to_owned());
                }
                "proto" => {
                    if !is_valid_proto(parameter) {
                        return Err("invalid proto");
                    }
                    self.proto = Some(parameter.to_owned());
                }
                "host" => {
                    if !has_balanced_brackets(parameter) {
                        return Err("unbalanced brackets in host");
                    }
                    self.host = Some(parameter.to_owned());
                }
                _ => return Err("unknown forwarded parameter"),
            }
        }
        Ok(())
    }
}

fn push_list(list: &mut Vec<String>, value: &str) {
    list.extend(value.split(',').map(str::trim).filter(|entry| !entry.is_empty()).map(str::to_owned));
}

/// `ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )`
fn is_valid_proto(proto: &str) -> bool {
    let mut bytes = proto.bytes();
    match bytes.next() {
        Some(first) if first.is_ascii_alphabetic() => bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.')),
        _ => false,
    }
}

fn has_balanced_brackets(host: &str) -> bool {
    let open = host.find('[');
    let close = host.find(']');
    match (open, close) {
        (None, None) => true,
        (Some(open), Some(close)) => open < close && host.matches('[').count() == 1 && host.matches(']').count() == 1,
        _ => false,
    }
}

fn unquote(raw: &str) -> Result<&str, &'static str> {
    match raw.strip_prefix('"') {
        Some(rest) => rest.strip_suffix('"').ok_or("unterminated quoted string"),
        None if raw.contains('"') => Err("stray quote"),
        None => Ok(raw),
    }
}

/// `node = nodename [ ":" node-port ]`, with IPv6 names in brackets.
fn parse_node(node: &str) -> Result<(&str, Option<&str>), &'static str> {
    let (address, port) = if let Some(rest) = node.strip_prefix('[') {
        let (address, rest) = rest.split_once(']').ok_or("unbalanced brackets in node")?;
        if address.is_empty() || address.contains('[') {
            return Err("invalid ipv6 node");
        }
        match rest {
            "" => (address, None),
            _ => (address, Some(rest.strip_prefix(':').ok_or("garbage after ipv6 node")?)),
        }
    } else {
        if node.contains('[') || node.contains(']') {
            return Err("unbalanced brackets in node");
        }
        match node.split_once(':') {
            Some((_, port)) if port.contains(':') => return Err("unbracketed ipv6 node"),
            Some((address, port)) => (address, Some(port)),
            None => (node, None),
        }
    };

    if address.is_empty() {
        return Err("empty node name");
    }
    if let Some(port) = port
        && !is_valid_node_port(port)
    {
        return Err("invalid node port");
    }
    Ok((address, port))
}

/// `port = 1*5DIGIT`, `obfport = "_" 1*(ALPHA / DIGIT / "." / "_" / "-")`
fn is_valid_node_port(port: &str) -> bool {
    if let Some(obfuscated) = port.strip_prefix('_') {
        return !obfuscated.is_empty() && obfuscated.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    }
    (1..=5).contains(&port.len()) && port.bytes().all(|b| b.is_ascii_digit())
}
