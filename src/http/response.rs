//! Response heads: parsing, framing and the rewrite returned downstream.
//!
//! # Design Decisions
//! - `Transfer-Encoding` wins over `Content-Length` on responses
//! - A transfer coding that does not end in `chunked` makes the body close-delimited
//! - The downstream head always states the proxy's own `Connection` decision

use std::io::Write;

use crate::http::headers::{self, Header};
use crate::http::{map_httparse, BodyFraming, OutputFraming, ParseError, Parsed, MAX_HEADERS};

/// A parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub minor_version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub head_len: usize,
}

/// Parse a response head from the start of `buf`.
pub fn parse_response(buf: &[u8], max_head: usize) -> Result<Parsed<ResponseHead>, ParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut slots);
    match res.parse(buf).map_err(map_httparse)? {
        httparse::Status::Partial if buf.len() > max_head => Err(ParseError::HeadTooLarge(max_head)),
        httparse::Status::Partial => Ok(Parsed::Partial),
        httparse::Status::Complete(len) if len > max_head => Err(ParseError::HeadTooLarge(max_head)),
        httparse::Status::Complete(len) => Ok(Parsed::Complete(ResponseHead {
            minor_version: res.version.unwrap_or(1),
            status: res.code.unwrap_or_default(),
            reason: res.reason.unwrap_or_default().to_string(),
            headers: res
                .headers
                .iter()
                .map(|h| Header::new(h.name, h.value))
                .collect(),
            head_len: len,
        })),
    }
}

impl ResponseHead {
    /// `1xx` responses that precede the final one. `101` is not interim.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn is_upgrade(&self) -> bool {
        self.status == 101
    }

    /// Whether the target allows its connection to be reused.
    pub fn keep_alive(&self) -> bool {
        headers::wants_keep_alive(&self.headers, self.minor_version)
    }

    /// Body framing of this response to a request with the given method.
    pub fn framing(&self, request_is_head: bool) -> Result<BodyFraming, ParseError> {
        if request_is_head || (100..200).contains(&self.status) || self.status == 204 || self.status == 304 {
            return Ok(BodyFraming::None);
        }
        if self.headers.iter().any(|h| h.is("transfer-encoding")) {
            let last = headers::tokens(&self.headers, "transfer-encoding").last();
            return Ok(match last.as_deref() {
                Some("chunked") => BodyFraming::Chunked,
                _ => BodyFraming::CloseDelimited,
            });
        }
        Ok(headers::content_length(&self.headers)?.map_or(BodyFraming::CloseDelimited, BodyFraming::Length))
    }

    /// Write the head returned downstream.
    ///
    /// `output` is how the body will be encoded towards the client. Only a
    /// de-chunked body loses its `chunked` coding; any other transfer coding
    /// still applies to the bytes forwarded and stays in the head.
    pub fn encode_downstream(&self, body: BodyFraming, output: OutputFraming, keep_alive: bool, out: &mut Vec<u8>) {
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        let dechunked = body == BodyFraming::Chunked && output == OutputFraming::Identity;
        headers::write_end_to_end(&self.headers, out, |h| {
            (h.is("transfer-encoding") && dechunked) || (h.is("content-length") && body == BodyFraming::Chunked)
        });
        if dechunked {
            let codings: Vec<String> = headers::tokens(&self.headers, "transfer-encoding")
                .filter(|t| t != "chunked")
                .collect();
            if !codings.is_empty() {
                headers::write_header(out, "Transfer-Encoding", codings.join(", ").as_bytes());
            }
        }
        headers::write_connection(out, keep_alive);
        out.extend_from_slice(b"\r\n");
    }

    /// Write an interim `1xx` head for an HTTP/1.1 client.
    pub fn encode_interim(&self, out: &mut Vec<u8>) {
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        headers::write_end_to_end(&self.headers, out, |_| false);
        out.extend_from_slice(b"\r\n");
    }
}
