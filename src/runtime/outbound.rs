//! Per-connection outbound queue with write watermarks.
//!
//! Queued response chunks are flushed to the socket with vectored writes.
//! The queue carries the connection's writability signal: crossing the high
//! watermark marks the connection unwritable (production pauses, read
//! demand goes ineligible), and draining back below the low watermark marks
//! it writable again. The gap between the two avoids flapping at the
//! boundary.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};

/// Segments handed to one vectored write call.
const MAX_WRITE_SLICES: usize = 64;

#[derive(Debug)]
pub(crate) struct WriteQueue {
    segments: VecDeque<Bytes>,
    /// Bytes of the front segment already written.
    head_written: usize,
    /// Total unwritten bytes across all segments.
    queued: usize,
    low_watermark: usize,
    high_watermark: usize,
    writable: bool,
}

impl WriteQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            head_written: 0,
            queued: 0,
            low_watermark,
            high_watermark,
            writable: true,
        }
    }

    /// Watermark-derived writability, not socket readiness.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// Enqueue a chunk. Returns true when this push crossed the high
    /// watermark and flipped the connection unwritable.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return false;
        }
        self.queued += chunk.len();
        self.segments.push_back(chunk);
        if self.writable && self.queued > self.high_watermark {
            self.writable = false;
            return true;
        }
        false
    }

    /// Write queued bytes until the queue empties or the socket would
    /// block. Returns true when the drain brought the queue back below the
    /// low watermark and flipped the connection writable.
    pub fn flush<W: Write>(&mut self, stream: &mut W) -> io::Result<bool> {
        while !self.segments.is_empty() {
            let written = {
                let mut slices: Vec<IoSlice<'_>> =
                    Vec::with_capacity(self.segments.len().min(MAX_WRITE_SLICES));
                for (i, segment) in self.segments.iter().take(MAX_WRITE_SLICES).enumerate() {
                    if i == 0 {
                        slices.push(IoSlice::new(&segment[self.head_written..]));
                    } else {
                        slices.push(IoSlice::new(segment));
                    }
                }

                match stream.write_vectored(&slices) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned 0",
                        ));
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            self.consume(written);
        }

        if !self.writable && self.queued <= self.low_watermark {
            self.writable = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn consume(&mut self, mut n: usize) {
        self.queued -= n;
        while n > 0 {
            let Some(front) = self.segments.front() else {
                break;
            };
            let remaining = front.len() - self.head_written;
            if n >= remaining {
                n -= remaining;
                self.segments.pop_front();
                self.head_written = 0;
            } else {
                self.head_written += n;
                n = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts up to a byte budget, then reports WouldBlock.
    struct ThrottledWriter {
        written: Vec<u8>,
        budget: usize,
    }

    impl ThrottledWriter {
        fn new(budget: usize) -> Self {
            Self {
                written: Vec::new(),
                budget,
            }
        }
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "throttled"));
            }
            let n = buf.len().min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_crosses_high_watermark_once() {
        let mut queue = WriteQueue::new(4, 8);
        assert!(queue.is_writable());

        assert!(!queue.push(Bytes::from_static(b"12345678"))); // exactly at high
        assert!(queue.is_writable());

        assert!(queue.push(Bytes::from_static(b"9"))); // crossed
        assert!(!queue.is_writable());

        // Further pushes do not re-report the transition.
        assert!(!queue.push(Bytes::from_static(b"0")));
        assert_eq!(queue.queued_bytes(), 10);
    }

    #[test]
    fn test_flush_drains_and_restores_writability() {
        let mut queue = WriteQueue::new(4, 8);
        queue.push(Bytes::from_static(b"abcdefghij"));
        assert!(!queue.is_writable());

        // Partial drain: still above low watermark.
        let mut writer = ThrottledWriter::new(3);
        assert!(!queue.flush(&mut writer).unwrap());
        assert!(!queue.is_writable());
        assert_eq!(queue.queued_bytes(), 7);

        // Drain to the low watermark: writable again, reported once.
        let mut writer = ThrottledWriter::new(3);
        assert!(queue.flush(&mut writer).unwrap());
        assert!(queue.is_writable());
        assert_eq!(queue.queued_bytes(), 4);

        // Idempotent: another flush with nothing to report.
        let mut writer = ThrottledWriter::new(100);
        assert!(!queue.flush(&mut writer).unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_preserves_byte_order_across_segments() {
        let mut queue = WriteQueue::new(0, 1024);
        queue.push(Bytes::from_static(b"hi\n"));
        queue.push(Bytes::from_static(b"hi\n"));
        queue.push(Bytes::from_static(b"\n"));

        let mut writer = ThrottledWriter::new(2);
        queue.flush(&mut writer).unwrap();
        let mut writer2 = ThrottledWriter::new(100);
        queue.flush(&mut writer2).unwrap();

        let mut all = writer.written;
        all.extend_from_slice(&writer2.written);
        assert_eq!(all, b"hi\nhi\n\n");
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_empty_chunk_ignored() {
        let mut queue = WriteQueue::new(4, 8);
        assert!(!queue.push(Bytes::new()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_write_zero_is_error() {
        struct ZeroWriter;
        impl Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = WriteQueue::new(4, 8);
        queue.push(Bytes::from_static(b"data"));
        let err = queue.flush(&mut ZeroWriter).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
