//! Line framing for the duplication protocol.
//!
//! Accumulates raw bytes and hands out one delimiter-stripped line at a
//! time, so the connection can consume input strictly on demand. Lines are
//! `\n`-terminated; a preceding `\r` is stripped as well. A line longer than
//! the configured ceiling is a framing failure and closes the connection.

use bytes::BytesMut;

/// Framing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// A line exceeded the configured maximum length.
    Overflow { limit: usize },
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::Overflow { limit } => {
                write!(f, "input line exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// Incremental line decoder with a bounded line length.
///
/// Bytes are appended as they arrive; `next_line` pops at most one complete
/// line per call, leaving the rest buffered for later demand.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    max_line_len: usize,
}

impl LineDecoder {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            max_line_len,
        }
    }

    /// Append raw bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete line, with the `\n` (and optional `\r`)
    /// stripped. Returns `Ok(None)` when no full line is buffered yet.
    pub fn next_line(&mut self) -> Result<Option<String>, FramingError> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos > self.max_line_len {
                    return Err(FramingError::Overflow {
                        limit: self.max_line_len,
                    });
                }
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => {
                // No delimiter in sight; a partial line may still breach the
                // ceiling, and waiting for more bytes cannot fix that.
                if self.buf.len() > self.max_line_len {
                    return Err(FramingError::Overflow {
                        limit: self.max_line_len,
                    });
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut decoder = LineDecoder::new(1024);
        decoder.extend(b"hello\n");
        assert_eq!(decoder.next_line().unwrap(), Some("hello".to_string()));
        assert_eq!(decoder.next_line().unwrap(), None);
    }

    #[test]
    fn test_crlf_stripped() {
        let mut decoder = LineDecoder::new(1024);
        decoder.extend(b"hello\r\nworld\n");
        assert_eq!(decoder.next_line().unwrap(), Some("hello".to_string()));
        assert_eq!(decoder.next_line().unwrap(), Some("world".to_string()));
    }

    #[test]
    fn test_partial_then_complete() {
        let mut decoder = LineDecoder::new(1024);
        decoder.extend(b"hel");
        assert_eq!(decoder.next_line().unwrap(), None);
        decoder.extend(b"lo\n");
        assert_eq!(decoder.next_line().unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn test_one_line_per_call() {
        let mut decoder = LineDecoder::new(1024);
        decoder.extend(b"3\nhi\n");
        assert_eq!(decoder.next_line().unwrap(), Some("3".to_string()));
        assert_eq!(decoder.next_line().unwrap(), Some("hi".to_string()));
        assert_eq!(decoder.next_line().unwrap(), None);
    }

    #[test]
    fn test_empty_line() {
        let mut decoder = LineDecoder::new(1024);
        decoder.extend(b"\n");
        assert_eq!(decoder.next_line().unwrap(), Some(String::new()));
    }

    #[test]
    fn test_overflow_with_delimiter() {
        let mut decoder = LineDecoder::new(4);
        decoder.extend(b"toolong\n");
        assert_eq!(decoder.next_line(), Err(FramingError::Overflow { limit: 4 }));
    }

    #[test]
    fn test_overflow_without_delimiter() {
        let mut decoder = LineDecoder::new(4);
        decoder.extend(b"toolong");
        assert_eq!(decoder.next_line(), Err(FramingError::Overflow { limit: 4 }));
    }

    #[test]
    fn test_at_limit_is_ok() {
        let mut decoder = LineDecoder::new(4);
        decoder.extend(b"abcd\n");
        assert_eq!(decoder.next_line().unwrap(), Some("abcd".to_string()));
    }
}
