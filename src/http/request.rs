//! Request heads: parsing, framing and the rewrite sent upstream.
//!
//! # Responsibilities
//! - Parse the head straight out of the downstream read buffer
//! - Enforce the head size limit before the head is complete
//! - Decide request body framing, rejecting ambiguous messages
//! - Produce the HTTP/1.1 head forwarded to the selected target

use std::io::Write;
use std::net::{IpAddr, SocketAddr};

use crate::http::headers::{self, Header};
use crate::http::{map_httparse, BodyFraming, ParseError, Parsed, MAX_HEADERS};

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub minor_version: u8,
    pub headers: Vec<Header>,
    /// Bytes of the buffer taken by the head, including the blank line.
    pub head_len: usize,
}

/// Parse a request head from the start of `buf`.
///
/// An incomplete head longer than `max_head` is rejected without waiting
/// for the rest.
pub fn parse_request(buf: &[u8], max_head: usize) -> Result<Parsed<RequestHead>, ParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    match req.parse(buf).map_err(map_httparse)? {
        httparse::Status::Partial if buf.len() > max_head => Err(ParseError::HeadTooLarge(max_head)),
        httparse::Status::Partial => Ok(Parsed::Partial),
        httparse::Status::Complete(len) if len > max_head => Err(ParseError::HeadTooLarge(max_head)),
        httparse::Status::Complete(len) => Ok(Parsed::Complete(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            minor_version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| Header::new(h.name, h.value))
                .collect(),
            head_len: len,
        })),
    }
}

impl RequestHead {
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Methods a target may safely see twice.
    pub fn is_idempotent(&self) -> bool {
        ["GET", "HEAD", "OPTIONS", "TRACE", "PUT", "DELETE"]
            .iter()
            .any(|m| self.method.eq_ignore_ascii_case(m))
    }

    /// Whether the client asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        headers::wants_keep_alive(&self.headers, self.minor_version)
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.iter().find(|h| h.is("host")).and_then(Header::value_str)
    }

    /// Body framing of this request.
    ///
    /// A request carrying both `Transfer-Encoding` and `Content-Length`, or a
    /// transfer coding other than plain `chunked`, is rejected.
    pub fn framing(&self) -> Result<BodyFraming, ParseError> {
        let length = headers::content_length(&self.headers)?;
        if self.headers.iter().any(|h| h.is("transfer-encoding")) {
            if length.is_some() {
                return Err(ParseError::Framing("both Transfer-Encoding and Content-Length"));
            }
            let codings: Vec<String> = headers::tokens(&self.headers, "transfer-encoding").collect();
            if codings != ["chunked"] {
                return Err(ParseError::Framing("unsupported transfer coding"));
            }
            return Ok(BodyFraming::Chunked);
        }
        Ok(length.map_or(BodyFraming::None, BodyFraming::Length))
    }

    /// Write the head forwarded to `upstream`.
    ///
    /// The request always goes out as HTTP/1.1 with a persistent connection,
    /// the client address appended to `X-Forwarded-For`, and a `Host` filled in
    /// when the client sent none.
    pub fn encode_upstream(&self, framing: BodyFraming, client_ip: IpAddr, upstream: SocketAddr, out: &mut Vec<u8>) {
        let _ = write!(out, "{} {} HTTP/1.1\r\n", self.method, self.target);
        headers::write_end_to_end(&self.headers, out, |h| {
            h.is("x-forwarded-for") || h.is("transfer-encoding")
        });

        if self.host().is_none() {
            headers::write_header(out, "Host", upstream.to_string().as_bytes());
        }

        let mut forwarded: Vec<u8> = Vec::new();
        for prior in self.headers.iter().filter(|h| h.is("x-forwarded-for")) {
            forwarded.extend_from_slice(&prior.value);
            forwarded.extend_from_slice(b", ");
        }
        let _ = write!(forwarded, "{}", client_ip.to_canonical());
        headers::write_header(out, "X-Forwarded-For", &forwarded);

        if framing == BodyFraming::Chunked {
            headers::write_header(out, "Transfer-Encoding", b"chunked");
        }
        headers::write_connection(out, true);
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> RequestHead {
        match parse_request(raw, 8192).unwrap() {
            Parsed::Complete(head) => head,
            Parsed::Partial => panic!("incomplete head"),
        }
    }

    #[test]
    fn parses_complete_head() {
        let raw = b"GET /path?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\nleftover";
        let head = parse(raw);
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/path?q=1");
        assert_eq!(head.minor_version, 1);
        assert_eq!(head.host(), Some("example.com"));
        assert_eq!(head.head_len, raw.len() - b"leftover".len());
        assert!(head.keep_alive());
        assert_eq!(head.framing().unwrap(), BodyFraming::None);
    }

    #[test]
    fn partial_head_waits_until_limit() {
        assert_eq!(parse_request(b"GET / HTTP/1.1\r\nHost: a", 64).unwrap(), Parsed::Partial);

        let mut long = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        long.extend(std::iter::repeat(b'a').take(100));
        assert_eq!(parse_request(&long, 64), Err(ParseError::HeadTooLarge(64)));
    }

    #[test]
    fn errors_map_to_answers() {
        let err = parse_request(b"GET / HTTP/2.0\r\n\r\n", 1024).unwrap_err();
        assert_eq!(err.answer().status(), 505);

        let err = parse_request(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n", 1024).unwrap_err();
        assert_eq!(err.answer().status(), 400);

        let mut many = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            many.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        many.extend_from_slice(b"\r\n");
        let err = parse_request(&many, 1 << 20).unwrap_err();
        assert_eq!(err, ParseError::TooManyHeaders);
        assert_eq!(err.answer().status(), 431);
    }

    #[test]
    fn framing_rules() {
        let head = parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(head.framing().unwrap(), BodyFraming::Length(5));

        let head = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: Chunked\r\n\r\n");
        assert_eq!(head.framing().unwrap(), BodyFraming::Chunked);

        let head = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n");
        assert!(head.framing().is_err());

        let head = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert!(head.framing().is_err());

        let head = parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n");
        assert_eq!(head.framing().unwrap_err().answer().status(), 400);
    }

    #[test]
    fn upstream_head_is_rewritten() {
        let head = parse(
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\nX-Forwarded-For: 10.0.0.1\r\nAccept: text/html\r\n\r\n",
        );
        assert!(head.keep_alive());

        let mut out = Vec::new();
        let client: IpAddr = "::ffff:192.0.2.7".parse().unwrap();
        head.encode_upstream(BodyFraming::None, client, "127.0.0.1:9000".parse().unwrap(), &mut out);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "GET / HTTP/1.1\r\n\
             Accept: text/html\r\n\
             Host: 127.0.0.1:9000\r\n\
             X-Forwarded-For: 10.0.0.1, 192.0.2.7\r\n\
             Connection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn chunked_request_keeps_its_coding_upstream() {
        let head = parse(b"PUT /up HTTP/1.1\r\nHost: svc\r\nTransfer-Encoding: chunked\r\nTE: trailers\r\n\r\n");
        let mut out = Vec::new();
        head.encode_upstream(BodyFraming::Chunked, "192.0.2.1".parse().unwrap(), "127.0.0.1:1".parse().unwrap(), &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("PUT /up HTTP/1.1\r\nHost: svc\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("TE:"));
        assert_eq!(text.matches("Transfer-Encoding").count(), 1);
    }

    #[test]
    fn idempotent_methods() {
        assert!(parse(b"GET / HTTP/1.1\r\n\r\n").is_idempotent());
        assert!(parse(b"DELETE /item HTTP/1.1\r\n\r\n").is_idempotent());
        assert!(!parse(b"POST /orders HTTP/1.1\r\n\r\n").is_idempotent());
        assert!(!parse(b"PATCH /item HTTP/1.1\r\n\r\n").is_idempotent());
    }
}
