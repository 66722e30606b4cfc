//! Ready-made [`ResponseParser`] implementations.

use bytes::Bytes;
use serde_json::Value;

use crate::frame::{ParseError, Parsed, ResponseParser, DEFAULT_MAX_FRAME_BYTES};

/// Newline-delimited JSON documents.
///
/// Lines may end in `\n` or `\r\n`. Empty lines are keep-alives and produce no
/// response. A line that is not valid JSON is skipped as a malformed frame.
#[derive(Clone, Debug)]
pub struct JsonLines {
    max_line_bytes: usize,
}

impl JsonLines {
    /// Accepts lines up to 1 MiB.
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Accepts lines up to `max_line_bytes`, excluding the line ending.
    pub fn with_max_line(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes: max_line_bytes.max(1),
        }
    }
}

impl Default for JsonLines {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser for JsonLines {
    type Response = Value;

    fn parse(&mut self, buf: &[u8]) -> Result<Parsed<Value>, ParseError> {
        let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
            // A trailing `\r` may be waiting for its `\n`.
            if buf.len() > self.max_line_bytes.saturating_add(1) {
                return Err(ParseError::unrecoverable(format!(
                    "line exceeds {} bytes",
                    self.max_line_bytes
                )));
            }
            return Ok(Parsed::Incomplete);
        };

        let consumed = newline + 1;
        let line = trim_ascii(&buf[..newline]);
        if line.is_empty() {
            return Ok(Parsed::Skip(consumed));
        }

        match serde_json::from_slice(line) {
            Ok(response) => Ok(Parsed::Complete { response, consumed }),
            Err(err) => Err(ParseError::recoverable(
                format!("invalid json line: {err}"),
                consumed,
            )),
        }
    }

    fn frame_overhead(&self) -> usize {
        2
    }
}

fn trim_ascii(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if !first.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    while let [rest @ .., last] = line {
        if !last.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    line
}

const LENGTH_PREFIX: usize = 4;

/// Frames prefixed by a 4-byte big-endian payload length.
///
/// Zero-length frames are heartbeats. A declared length above the limit means
/// the stream is out of sync, so no boundary can be trusted.
#[derive(Clone, Debug)]
pub struct LengthDelimited {
    max_payload_bytes: usize,
}

impl LengthDelimited {
    /// Accepts payloads up to 1 MiB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Accepts payloads up to `max_payload_bytes`, excluding the prefix.
    pub fn with_max_payload(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }
}

impl Default for LengthDelimited {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser for LengthDelimited {
    type Response = Bytes;

    fn parse(&mut self, buf: &[u8]) -> Result<Parsed<Bytes>, ParseError> {
        let Some(header) = buf.get(..LENGTH_PREFIX) else {
            return Ok(Parsed::Incomplete);
        };
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if declared > self.max_payload_bytes {
            return Err(ParseError::unrecoverable(format!(
                "frame length {declared} exceeds cap {}",
                self.max_payload_bytes
            )));
        }
        if declared == 0 {
            return Ok(Parsed::Skip(LENGTH_PREFIX));
        }

        let end = LENGTH_PREFIX + declared;
        match buf.get(LENGTH_PREFIX..end) {
            Some(payload) => Ok(Parsed::Complete {
                response: Bytes::copy_from_slice(payload),
                consumed: end,
            }),
            None => Ok(Parsed::Incomplete),
        }
    }

    fn frame_overhead(&self) -> usize {
        LENGTH_PREFIX
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::{JsonLines, LengthDelimited, LENGTH_PREFIX};
    use crate::frame::{FrameReader, Parsed, ResponseParser, DEFAULT_MAX_FRAME_BYTES};

    #[test]
    fn json_lines_accepts_crlf_and_skips_keep_alives() {
        let mut reader = FrameReader::new(JsonLines::new());
        let frames: Vec<_> = reader
            .feed(b"\r\n{\"id\":1}\r\n\r\n{\"id\":2}\n")
            .collect();
        assert_eq!(frames, vec![Ok(json!({"id": 1})), Ok(json!({"id": 2}))]);
    }

    #[test]
    fn json_lines_reports_bad_line_and_continues() {
        let mut reader = FrameReader::new(JsonLines::new());
        let frames: Vec<_> = reader.feed(b"{\"a\":1}\nnot json\n{\"b\":2}\n").collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Ok(json!({"a": 1})));
        let err = frames[1].clone().expect_err("bad line");
        assert!(err.is_recoverable());
        assert_eq!(err.discard(), "not json\n".len());
        assert_eq!(frames[2], Ok(json!({"b": 2})));
    }

    #[test]
    fn json_lines_waits_for_newline() {
        let mut parser = JsonLines::new();
        assert_eq!(parser.parse(b"{\"partial\":"), Ok(Parsed::Incomplete));
    }

    #[test]
    fn json_lines_rejects_unterminated_overlong_line() {
        let mut parser = JsonLines::with_max_line(4);
        let err = parser.parse(b"{\"abc\"").expect_err("too long");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn json_lines_keeps_max_length_line_waiting_for_crlf() {
        let mut reader = FrameReader::with_limit(JsonLines::with_max_line(7), 7);
        assert!(reader.feed(b"{\"a\":1}\r").next().is_none());
        let frames: Vec<_> = reader.feed(b"\n").collect();
        assert_eq!(frames, vec![Ok(json!({"a": 1}))]);
    }

    #[test]
    fn length_delimited_accepts_max_payload_split_near_its_end() {
        let payload = vec![0xA5u8; DEFAULT_MAX_FRAME_BYTES];
        let mut wire = Vec::with_capacity(LENGTH_PREFIX + payload.len());
        wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        wire.extend_from_slice(&payload);
        let split = wire.len() - 2;

        let mut reader = FrameReader::new(LengthDelimited::new());
        assert!(reader.feed(&wire[..split]).next().is_none());
        assert_eq!(reader.buffered(), split);

        let frames: Vec<_> = reader.feed(&wire[split..]).collect();
        assert_eq!(frames, vec![Ok(Bytes::from(payload))]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn length_delimited_reassembles_split_header() {
        let mut reader = FrameReader::new(LengthDelimited::new());
        assert!(reader.feed(&[0, 0]).next().is_none());
        assert!(reader.feed(&[0, 3, b'a']).next().is_none());
        let frames: Vec<_> = reader.feed(b"bc\x00\x00\x00\x00").collect();
        assert_eq!(frames, vec![Ok(Bytes::from_static(b"abc"))]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn length_delimited_rejects_oversized_declaration() {
        let mut parser = LengthDelimited::with_max_payload(2);
        let err = parser.parse(&[0, 0, 0, 9, 1, 2]).expect_err("oversized");
        assert!(!err.is_recoverable());
    }
}
