//! Message body framing and transfer.
//!
//! `BodyTransfer` consumes raw body bytes as they arrive and appends the bytes
//! to forward. Chunked input is decoded and, when the receiving side speaks
//! HTTP/1.1, re-encoded; chunk boundaries on the way out follow the reads, not
//! the sender's original chunking. Trailers are consumed and dropped.

use std::io::Write;

use crate::http::ParseError;

/// How the length of a body is determined on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    None,
    Length(u64),
    Chunked,
    /// Body runs until the sender closes the connection.
    CloseDelimited,
}

impl BodyFraming {
    pub fn is_close_delimited(&self) -> bool {
        matches!(self, BodyFraming::CloseDelimited)
    }
}

/// Encoding of the forwarded body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFraming {
    /// Payload bytes as-is; the head carries the length or the connection closes.
    Identity,
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size { value: u64, digits: u8 },
    Extension(u64),
    SizeLf(u64),
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
    Done,
}

/// Streaming body transfer for one message.
#[derive(Debug)]
pub struct BodyTransfer {
    output: OutputFraming,
    progress: Progress,
}

impl BodyTransfer {
    /// Chunked output is only produced from chunked input; other framings are
    /// always forwarded as identity.
    pub fn new(framing: BodyFraming, output: OutputFraming) -> Self {
        let progress = match framing {
            BodyFraming::None | BodyFraming::Length(0) => Progress::Done,
            BodyFraming::Length(n) => Progress::Length(n),
            BodyFraming::Chunked => Progress::Chunked(ChunkState::Size { value: 0, digits: 0 }),
            BodyFraming::CloseDelimited => Progress::UntilClose,
        };
        let output = match framing {
            BodyFraming::Chunked => output,
            _ => OutputFraming::Identity,
        };
        Self { output, progress }
    }

    pub fn is_done(&self) -> bool {
        self.progress == Progress::Done
    }

    /// Consume body bytes from `input`, appending the forwarded form to `out`.
    ///
    /// Returns how many input bytes belong to this body. Anything after that
    /// is the next message on the connection.
    pub fn pump(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ParseError> {
        match self.progress {
            Progress::Done => Ok(0),
            Progress::Length(remaining) => {
                let n = remaining.min(input.len() as u64) as usize;
                out.extend_from_slice(&input[..n]);
                self.progress = match remaining - n as u64 {
                    0 => Progress::Done,
                    left => Progress::Length(left),
                };
                Ok(n)
            }
            Progress::UntilClose => {
                out.extend_from_slice(input);
                Ok(input.len())
            }
            Progress::Chunked(state) => self.decode_chunked(state, input, out),
        }
    }

    /// The sender closed its side. Only a close-delimited body ends cleanly here.
    pub fn on_eof(&mut self) -> Result<(), ParseError> {
        match self.progress {
            Progress::Done => Ok(()),
            Progress::UntilClose => {
                self.progress = Progress::Done;
                Ok(())
            }
            _ => Err(ParseError::Truncated),
        }
    }

    fn decode_chunked(&mut self, mut state: ChunkState, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ParseError> {
        let mut i = 0;
        while i < input.len() {
            let byte = input[i];
            state = match state {
                ChunkState::Size { value, digits } => match hex_value(byte) {
                    Some(d) => {
                        let value = value
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(d))
                            .ok_or(ParseError::Chunked("chunk size overflow"))?;
                        i += 1;
                        ChunkState::Size { value, digits: digits.saturating_add(1) }
                    }
                    None if digits == 0 => return Err(ParseError::Chunked("missing chunk size")),
                    None => {
                        i += 1;
                        match byte {
                            b';' | b' ' | b'\t' => ChunkState::Extension(value),
                            b'\r' => ChunkState::SizeLf(value),
                            b'\n' => after_size(value),
                            _ => return Err(ParseError::Chunked("invalid chunk size")),
                        }
                    }
                },
                ChunkState::Extension(value) => {
                    i += 1;
                    match byte {
                        b'\r' => ChunkState::SizeLf(value),
                        b'\n' => after_size(value),
                        _ => ChunkState::Extension(value),
                    }
                }
                ChunkState::SizeLf(value) => {
                    if byte != b'\n' {
                        return Err(ParseError::Chunked("expected LF after chunk size"));
                    }
                    i += 1;
                    after_size(value)
                }
                ChunkState::Data(remaining) => {
                    let n = remaining.min((input.len() - i) as u64) as usize;
                    let data = &input[i..i + n];
                    match self.output {
                        OutputFraming::Chunked => {
                            let _ = write!(out, "{n:x}\r\n");
                            out.extend_from_slice(data);
                            out.extend_from_slice(b"\r\n");
                        }
                        OutputFraming::Identity => out.extend_from_slice(data),
                    }
                    i += n;
                    match remaining - n as u64 {
                        0 => ChunkState::DataCr,
                        left => ChunkState::Data(left),
                    }
                }
                ChunkState::DataCr => {
                    i += 1;
                    match byte {
                        b'\r' => ChunkState::DataLf,
                        b'\n' => ChunkState::Size { value: 0, digits: 0 },
                        _ => return Err(ParseError::Chunked("missing CRLF after chunk data")),
                    }
                }
                ChunkState::DataLf => {
                    if byte != b'\n' {
                        return Err(ParseError::Chunked("missing CRLF after chunk data"));
                    }
                    i += 1;
                    ChunkState::Size { value: 0, digits: 0 }
                }
                ChunkState::TrailerStart => {
                    i += 1;
                    match byte {
                        b'\r' => ChunkState::TrailerLf,
                        b'\n' => return Ok(self.finish_chunked(i, out)),
                        _ => ChunkState::TrailerLine,
                    }
                }
                ChunkState::TrailerLine => {
                    i += 1;
                    if byte == b'\n' {
                        ChunkState::TrailerStart
                    } else {
                        ChunkState::TrailerLine
                    }
                }
                ChunkState::TrailerLf => {
                    if byte != b'\n' {
                        return Err(ParseError::Chunked("malformed trailer section"));
                    }
                    return Ok(self.finish_chunked(i + 1, out));
                }
            };
        }
        self.progress = Progress::Chunked(state);
        Ok(i)
    }

    fn finish_chunked(&mut self, consumed: usize, out: &mut Vec<u8>) -> usize {
        if self.output == OutputFraming::Chunked {
            out.extend_from_slice(b"0\r\n\r\n");
        }
        self.progress = Progress::Done;
        consumed
    }
}

fn after_size(value: u64) -> ChunkState {
    if value == 0 {
        ChunkState::TrailerStart
    } else {
        ChunkState::Data(value)
    }
}

fn hex_value(byte: u8) -> Option<u64> {
    (byte as char).to_digit(16).map(u64::from)
}
