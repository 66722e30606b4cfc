//! Incremental frame parsing.
//!
//! [`FrameReader`] accumulates raw bytes from a connection and hands them to a
//! [`ResponseParser`] until no complete frame remains. Trailing bytes of a
//! partial frame are kept for the next [`FrameReader::feed`] call.
//!
//! Parse errors follow a skip-to-boundary policy. A [`ParseError`] reports how
//! many bytes make up the malformed frame; exactly those bytes are discarded
//! and parsing resumes at the next frame. An error that cannot name a
//! boundary is unrecoverable: the buffer is cleared and the caller is expected
//! to restart framing on a fresh connection.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Default upper bound on buffered bytes for a single incomplete frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Outcome of a single parse attempt at the start of the buffer.
#[derive(Debug, PartialEq)]
pub enum Parsed<R> {
    /// One response was parsed from the first `consumed` bytes.
    Complete { response: R, consumed: usize },
    /// The first `n` bytes are filler (keep-alives, heartbeats) with no response.
    Skip(usize),
    /// The buffer does not yet hold a full frame.
    Incomplete,
}

/// Parses responses off the front of a byte buffer.
pub trait ResponseParser {
    type Response;

    /// Parses at most one frame off the front of `buf`.
    fn parse(&mut self, buf: &[u8]) -> Result<Parsed<Self::Response>, ParseError>;

    /// Framing bytes (prefixes, delimiters) a frame may carry on top of its
    /// payload. The reader allows this much beyond its payload limit.
    fn frame_overhead(&self) -> usize {
        0
    }
}

/// A malformed frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed frame: {reason}")]
pub struct ParseError {
    reason: String,
    discard: usize,
}

impl ParseError {
    /// The first `discard` bytes form the malformed frame; the next frame
    /// starts right after them.
    pub fn recoverable(reason: impl Into<String>, discard: usize) -> Self {
        Self {
            reason: reason.into(),
            discard,
        }
    }

    /// No frame boundary can be found in the buffered bytes.
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            discard: 0,
        }
    }

    /// Human-readable description of what was wrong with the frame.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Bytes dropped to skip the malformed frame; 0 when unrecoverable.
    pub fn discard(&self) -> usize {
        self.discard
    }

    /// Whether parsing can resume right after the malformed frame.
    pub fn is_recoverable(&self) -> bool {
        self.discard > 0
    }
}

/// Buffers partial frames across reads and yields parsed responses.
#[derive(Debug)]
pub struct FrameReader<P> {
    parser: P,
    buffer: BytesMut,
    max_frame_bytes: usize,
}

impl<P: ResponseParser> FrameReader<P> {
    /// Creates a reader with the default 1 MiB payload limit.
    pub fn new(parser: P) -> Self {
        Self::with_limit(parser, DEFAULT_MAX_FRAME_BYTES)
    }

    /// Creates a reader that rejects incomplete frames whose payload outgrows
    /// `max_frame_bytes`. The parser's [`ResponseParser::frame_overhead`] is
    /// allowed on top.
    pub fn with_limit(parser: P, max_frame_bytes: usize) -> Self {
        Self {
            parser,
            buffer: BytesMut::new(),
            max_frame_bytes: max_frame_bytes.max(1),
        }
    }

    /// Appends `bytes` and returns an iterator over every frame now complete.
    ///
    /// The iterator is lazy: frames are parsed as it is advanced, and frames
    /// left unread stay buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_, P> {
        self.buffer.extend_from_slice(bytes);
        Frames { reader: self }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Option<Result<P::Response, ParseError>> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }

            match self.parser.parse(&self.buffer) {
                Ok(Parsed::Complete { response, consumed }) => {
                    if consumed == 0 {
                        return Some(Err(self.reset("parser produced a response from zero bytes")));
                    }
                    self.buffer.advance(consumed.min(self.buffer.len()));
                    return Some(Ok(response));
                }
                Ok(Parsed::Skip(skipped)) => {
                    if skipped == 0 {
                        return Some(Err(self.reset("parser skipped zero bytes")));
                    }
                    self.buffer.advance(skipped.min(self.buffer.len()));
                }
                Ok(Parsed::Incomplete) => {
                    let limit = self
                        .max_frame_bytes
                        .saturating_add(self.parser.frame_overhead());
                    if self.buffer.len() > limit {
                        let reason = format!(
                            "frame exceeds {} bytes without completing",
                            self.max_frame_bytes
                        );
                        return Some(Err(self.reset(reason)));
                    }
                    return None;
                }
                Err(err) if err.is_recoverable() => {
                    self.buffer.advance(err.discard.min(self.buffer.len()));
                    return Some(Err(err));
                }
                Err(err) => {
                    self.buffer.clear();
                    return Some(Err(err));
                }
            }
        }
    }

    fn reset(&mut self, reason: impl Into<String>) -> ParseError {
        self.buffer.clear();
        ParseError::unrecoverable(reason)
    }
}

/// Iterator returned by [`FrameReader::feed`].
pub struct Frames<'a, P> {
    reader: &'a mut FrameReader<P>,
}

impl<P: ResponseParser> Iterator for Frames<'_, P> {
    type Item = Result<P::Response, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_frame()
    }
}
