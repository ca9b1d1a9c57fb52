//! Header helpers shared by request and response handling.

use std::io::Write;

use crate::http::ParseError;

/// One header line, original name casing preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok().map(str::trim)
    }
}

/// Headers that describe a single hop and never cross the proxy as-is.
/// `Transfer-Encoding` is handled by the body framing instead.
const HOP_BY_HOP: [&str; 6] = ["connection", "keep-alive", "proxy-connection", "te", "trailer", "upgrade"];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Iterate the comma-separated tokens of every header named `name`.
pub fn tokens<'a>(headers: &'a [Header], name: &'a str) -> impl Iterator<Item = String> + 'a {
    headers
        .iter()
        .filter(move |h| h.is(name))
        .filter_map(|h| h.value_str())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
}

pub fn has_token(headers: &[Header], name: &str, token: &str) -> bool {
    tokens(headers, name).any(|t| t == token)
}

/// Persistence negotiated by a message's `Connection` header and version.
pub fn wants_keep_alive(headers: &[Header], minor_version: u8) -> bool {
    if minor_version >= 1 {
        !has_token(headers, "connection", "close")
    } else {
        has_token(headers, "connection", "keep-alive")
    }
}

/// Copy end-to-end headers: hop-by-hop ones, those named in `Connection`,
/// and anything `skip` rejects are left out.
pub fn write_end_to_end(headers: &[Header], out: &mut Vec<u8>, skip: impl Fn(&Header) -> bool) {
    let listed: Vec<String> = tokens(headers, "connection").collect();
    for header in headers {
        if is_hop_by_hop(&header.name) || listed.iter().any(|l| header.is(l)) || skip(header) {
            continue;
        }
        write_header(out, &header.name, &header.value);
    }
}

/// The declared `Content-Length`, if any. Repeated headers or list values must agree.
pub fn content_length(headers: &[Header]) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.iter().filter(|h| h.is("content-length")) {
        let text = value
            .value_str()
            .ok_or(ParseError::Framing("non-text Content-Length"))?;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::Framing("invalid Content-Length"));
            }
            let n: u64 = part.parse().map_err(|_| ParseError::Framing("invalid Content-Length"))?;
            match length {
                Some(prev) if prev != n => return Err(ParseError::Framing("conflicting Content-Length values")),
                _ => length = Some(n),
            }
        }
    }
    Ok(length)
}

pub fn write_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

pub fn write_connection(out: &mut Vec<u8>, keep_alive: bool) {
    let _ = write!(out, "Connection: {}\r\n", if keep_alive { "keep-alive" } else { "close" });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(list: &[(&str, &str)]) -> Vec<Header> {
        list.iter().map(|(n, v)| Header::new(*n, v.as_bytes())).collect()
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        assert!(wants_keep_alive(&[], 1));
        assert!(!wants_keep_alive(&[], 0));
        assert!(!wants_keep_alive(&headers(&[("Connection", "Close")]), 1));
        assert!(wants_keep_alive(&headers(&[("connection", "Keep-Alive")]), 0));
    }

    #[test]
    fn strips_hop_by_hop_and_listed() {
        let list = headers(&[
            ("Host", "example.com"),
            ("Connection", "keep-alive, X-Session"),
            ("Keep-Alive", "timeout=5"),
            ("X-Session", "abc"),
            ("Upgrade", "websocket"),
            ("Accept", "*/*"),
        ]);
        let mut out = Vec::new();
        write_end_to_end(&list, &mut out, |_| false);
        assert_eq!(out, b"Host: example.com\r\nAccept: */*\r\n");
    }

    #[test]
    fn content_length_values_must_agree() {
        assert_eq!(content_length(&[]).unwrap(), None);
        assert_eq!(content_length(&headers(&[("Content-Length", "12")])).unwrap(), Some(12));
        assert_eq!(
            content_length(&headers(&[("Content-Length", "7, 7"), ("content-length", "7")])).unwrap(),
            Some(7)
        );
        assert!(content_length(&headers(&[("Content-Length", "7"), ("Content-Length", "8")])).is_err());
        assert!(content_length(&headers(&[("Content-Length", "-1")])).is_err());
        assert!(content_length(&headers(&[("Content-Length", "+5")])).is_err());
    }
}
