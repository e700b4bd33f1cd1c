//! Request state machine.
//!
//! Two lines make a request: a repeat count, then the text to duplicate.
//! The decoder holds the count between the two lines and hands back a
//! completed [`Request`] as soon as the text line arrives.

/// A completed request. Immutable once constructed; consumed by exactly one
/// chunk producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub count: u64,
    pub text: String,
}

/// Protocol failure. Every variant is fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The count line did not parse as a non-negative base-10 integer.
    MalformedCount(String),
    /// A line surfaced while a response was still being produced. The read
    /// demand design makes this unreachable from the wire; it guards
    /// internal logic errors and closes loudly rather than recovering.
    UnexpectedLine,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::MalformedCount(line) => {
                write!(f, "malformed repeat count {line:?}")
            }
            ProtocolError::UnexpectedLine => {
                write!(f, "input line received while a response was in flight")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingCount,
    AwaitingText,
}

/// Interprets successive input lines as count-then-text request pairs.
#[derive(Debug)]
pub struct RequestDecoder {
    phase: Phase,
    pending_count: u64,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingCount,
            pending_count: 0,
        }
    }

    /// Feed one input line (delimiter already stripped).
    ///
    /// Returns `Ok(None)` after a valid count line, `Ok(Some(request))`
    /// after the matching text line. The text line is taken verbatim; an
    /// empty string is a valid body.
    pub fn on_line(&mut self, line: &str) -> Result<Option<Request>, ProtocolError> {
        match self.phase {
            Phase::AwaitingCount => {
                let count: u64 = line
                    .trim()
                    .parse()
                    .map_err(|_| ProtocolError::MalformedCount(line.to_string()))?;
                self.pending_count = count;
                self.phase = Phase::AwaitingText;
                Ok(None)
            }
            Phase::AwaitingText => {
                self.phase = Phase::AwaitingCount;
                Ok(Some(Request {
                    count: self.pending_count,
                    text: line.to_string(),
                }))
            }
        }
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}
