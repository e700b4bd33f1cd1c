//! Wire protocol for the line duplication service.
//!
//! A request is two newline-delimited lines: a non-negative repeat count,
//! then an arbitrary text line. The response is the text line repeated
//! count times, followed by a single blank line as terminator:
//!
//! ```text
//! >> 3\nhi\n
//! << hi\nhi\nhi\n\n
//! ```
//!
//! Submodules:
//! - `framing`: byte stream -> one stripped line at a time, bounded length
//! - `request`: lines -> validated `Request`
//! - `response`: `Request` -> lazy, optionally paced sequence of chunks

mod framing;
mod request;
mod response;

pub use framing::{FramingError, LineDecoder};
pub use request::{ProtocolError, Request, RequestDecoder};
pub use response::{ChunkConfig, ChunkConfigError, Pull, RepeatChunks};
