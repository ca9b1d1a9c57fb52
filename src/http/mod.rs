//! HTTP/1.x codec subsystem.
//!
//! # Data Flow
//! ```text
//! Downstream bytes
//!     → request.rs (parse head, decide framing, rewrite for upstream)
//!     → body.rs (length / chunked / close-delimited transfer)
//! Upstream bytes
//!     → response.rs (parse head, rewrite for downstream)
//!     → body.rs (de-chunk and re-chunk as the client allows)
//! Errors
//!     → answers.rs (canned 4xx/5xx responses)
//! ```
//!
//! # Design Decisions
//! - Heads are parsed with `httparse` straight from the read buffer
//! - Bodies are streamed, never buffered whole
//! - Hop-by-hop headers are stripped and `Connection` is always rewritten

pub mod answers;
pub mod body;
pub mod headers;
pub mod request;
pub mod response;

use thiserror::Error;

pub use answers::DefaultAnswer;
pub use body::{BodyFraming, BodyTransfer, OutputFraming};
pub use headers::Header;
pub use request::{parse_request, RequestHead};
pub use response::{parse_response, ResponseHead};

/// Upper bound on header lines in one message head.
pub const MAX_HEADERS: usize = 100;

/// Codec errors. Each maps onto the status the proxy answers with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("too many header lines")]
    TooManyHeaders,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid message framing: {0}")]
    Framing(&'static str),
    #[error("invalid chunked encoding: {0}")]
    Chunked(&'static str),
    #[error("body ended before its declared length")]
    Truncated,
}

impl ParseError {
    /// The canned answer a downstream client receives for this error.
    pub fn answer(&self) -> DefaultAnswer {
        match self {
            ParseError::HeadTooLarge(_) | ParseError::TooManyHeaders => DefaultAnswer::HeaderTooLarge,
            ParseError::UnsupportedVersion => DefaultAnswer::VersionNotSupported,
            _ => DefaultAnswer::BadRequest,
        }
    }
}

/// Outcome of a head parse over a possibly incomplete buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    Complete(T),
    Partial,
}

pub(crate) fn map_httparse(err: httparse::Error) -> ParseError {
    match err {
        httparse::Error::Version => ParseError::UnsupportedVersion,
        httparse::Error::TooManyHeaders => ParseError::TooManyHeaders,
        other => ParseError::Malformed(other.to_string()),
    }
}
