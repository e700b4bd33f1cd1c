//! Lazy chunk production for responses.
//!
//! A response is never materialized whole. [`RepeatChunks`] is pulled by the
//! connection one buffer at a time, so output in memory stays bounded by the
//! write watermark no matter how large the repeat count is. An optional
//! delay gate paces production to emulate a slow producer: after each pulled
//! chunk the gate arms for a jittered interval, and until it elapses `pull`
//! reports `NotReady` without ending the stream.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::time::{Duration, Instant};

/// Upper bound on a single chunk allocation. Long text lines reduce the
/// effective batch size rather than multiplying into huge buffers.
const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Invalid producer configuration, rejected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkConfigError {
    ZeroLinesPerChunk,
}

impl std::fmt::Display for ChunkConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkConfigError::ZeroLinesPerChunk => {
                write!(f, "lines_per_chunk must be at least 1")
            }
        }
    }
}

impl std::error::Error for ChunkConfigError {}

/// Batch size and pacing knobs shared by every producer on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    lines_per_chunk: usize,
    base_delay: Duration,
    jitter: Duration,
}

impl ChunkConfig {
    pub fn new(
        lines_per_chunk: usize,
        base_delay: Duration,
        jitter: Duration,
    ) -> Result<Self, ChunkConfigError> {
        if lines_per_chunk == 0 {
            return Err(ChunkConfigError::ZeroLinesPerChunk);
        }
        Ok(Self {
            lines_per_chunk,
            base_delay,
            jitter,
        })
    }

    fn paced(&self) -> bool {
        !self.base_delay.is_zero() || !self.jitter.is_zero()
    }

    /// Sample the inter-chunk delay: base plus uniform jitter in
    /// `[-jitter, +jitter]`, clamped at zero. `None` when the result would
    /// not delay anything.
    fn sample_delay(&self) -> Option<Duration> {
        if !self.paced() {
            return None;
        }
        let base = self.base_delay.as_millis() as i64;
        let spread = self.jitter.as_millis() as i64;
        let jitter = if spread > 0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0
        };
        let millis = (base + jitter).max(0);
        if millis == 0 {
            return None;
        }
        Some(Duration::from_millis(millis as u64))
    }
}

/// Result of one pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    /// A chunk to forward to the transport.
    Ready(Bytes),
    /// The delay gate is armed; retry at `until`, driven by a timer rather
    /// than a busy poll. Not an error and not end-of-stream.
    NotReady { until: Instant },
    /// Terminator emitted and acknowledged; nothing further will be
    /// produced.
    Done,
}

/// Pull-based producer of one response: the request text repeated `count`
/// times, batched `lines_per_chunk` lines per buffer, then a single blank
/// line.
#[derive(Debug)]
pub struct RepeatChunks {
    line: Bytes,
    repeat_total: u64,
    repeats_remaining: u64,
    lines_per_chunk: usize,
    config: ChunkConfig,
    terminator_sent: bool,
    gate: Option<Instant>,
}

impl RepeatChunks {
    pub fn new(request: crate::protocol::Request, config: ChunkConfig) -> Self {
        let mut line = BytesMut::with_capacity(request.text.len() + 1);
        line.put_slice(request.text.as_bytes());
        line.put_u8(b'\n');
        let line = line.freeze();

        // Cap per-chunk bytes; the configured batch size still applies to
        // short lines.
        let per_line = line.len().max(1);
        let lines_per_chunk = config
            .lines_per_chunk
            .min((MAX_CHUNK_BYTES / per_line).max(1));

        Self {
            line,
            repeat_total: request.count,
            repeats_remaining: request.count,
            lines_per_chunk,
            config,
            terminator_sent: false,
            gate: None,
        }
    }

    /// Non-blocking; callable repeatedly. See [`Pull`] for the contract.
    pub fn pull(&mut self, now: Instant) -> Pull {
        if self.is_done() {
            return Pull::Done;
        }

        if let Some(until) = self.gate {
            if now < until {
                return Pull::NotReady { until };
            }
            self.gate = None;
        }

        let chunk = if self.repeats_remaining == 0 {
            self.terminator_sent = true;
            Bytes::from_static(b"\n")
        } else {
            let lines = self.repeats_remaining.min(self.lines_per_chunk as u64) as usize;
            let mut chunk = BytesMut::with_capacity(lines * self.line.len());
            for _ in 0..lines {
                chunk.put_slice(&self.line);
            }
            self.repeats_remaining -= lines as u64;
            chunk.freeze()
        };

        if let Some(delay) = self.config.sample_delay() {
            self.gate = Some(now + delay);
        }

        Pull::Ready(chunk)
    }

    pub fn is_done(&self) -> bool {
        self.repeats_remaining == 0 && self.terminator_sent
    }

    /// Lines emitted so far. Observability only.
    pub fn produced(&self) -> u64 {
        self.repeat_total - self.repeats_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;

    fn request(count: u64, text: &str) -> Request {
        Request {
            count,
            text: text.to_string(),
        }
    }

    fn unpaced(lines_per_chunk: usize) -> ChunkConfig {
        ChunkConfig::new(lines_per_chunk, Duration::ZERO, Duration::ZERO).unwrap()
    }

    fn drain(producer: &mut RepeatChunks) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match producer.pull(Instant::now()) {
                Pull::Ready(chunk) => out.extend_from_slice(&chunk),
                Pull::Done => return out,
                Pull::NotReady { .. } => panic!("unpaced producer reported NotReady"),
            }
        }
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        assert_eq!(
            ChunkConfig::new(0, Duration::ZERO, Duration::ZERO),
            Err(ChunkConfigError::ZeroLinesPerChunk)
        );
    }

    #[test]
    fn test_zero_count_is_terminator_only() {
        let mut producer = RepeatChunks::new(request(0, ""), unpaced(128));
        assert_eq!(drain(&mut producer), b"\n");
        assert_eq!(producer.produced(), 0);
    }

    #[test]
    fn test_repeats_then_terminator() {
        let mut producer = RepeatChunks::new(request(3, "hi"), unpaced(128));
        assert_eq!(drain(&mut producer), b"hi\nhi\nhi\n\n");
        assert_eq!(producer.produced(), 3);
    }

    #[test]
    fn test_batching_does_not_change_bytes() {
        let mut expected = b"abc\n".repeat(7);
        expected.push(b'\n');
        for lines_per_chunk in [1, 2, 5, 7, 128] {
            let mut producer = RepeatChunks::new(request(7, "abc"), unpaced(lines_per_chunk));
            assert_eq!(drain(&mut producer), expected);
        }
    }

    #[test]
    fn test_chunk_boundaries() {
        let mut producer = RepeatChunks::new(request(5, "x"), unpaced(2));
        let now = Instant::now();
        assert_eq!(producer.pull(now), Pull::Ready(Bytes::from_static(b"x\nx\n")));
        assert_eq!(producer.pull(now), Pull::Ready(Bytes::from_static(b"x\nx\n")));
        assert_eq!(producer.pull(now), Pull::Ready(Bytes::from_static(b"x\n")));
        assert_eq!(producer.pull(now), Pull::Ready(Bytes::from_static(b"\n")));
        assert_eq!(producer.pull(now), Pull::Done);
        // Pulling past the end stays Done.
        assert_eq!(producer.pull(now), Pull::Done);
    }

    #[test]
    fn test_gate_blocks_until_elapsed() {
        let config =
            ChunkConfig::new(1, Duration::from_millis(50), Duration::ZERO).unwrap();
        let mut producer = RepeatChunks::new(request(2, "x"), config);
        let start = Instant::now();

        assert!(matches!(producer.pull(start), Pull::Ready(_)));

        // Without jitter the gate deadline is exactly base_delay out.
        let until = match producer.pull(start) {
            Pull::NotReady { until } => until,
            other => panic!("expected NotReady, got {other:?}"),
        };
        assert_eq!(until - start, Duration::from_millis(50));

        // Re-pulling before the deadline keeps reporting the same gate.
        assert_eq!(
            producer.pull(start + Duration::from_millis(49)),
            Pull::NotReady { until }
        );

        // At the deadline the next chunk comes out.
        assert!(matches!(producer.pull(until), Pull::Ready(_)));
    }

    #[test]
    fn test_jittered_gate_within_bounds() {
        let base = Duration::from_millis(20);
        let jitter = Duration::from_millis(5);
        let config = ChunkConfig::new(1, base, jitter).unwrap();

        for _ in 0..50 {
            let mut producer = RepeatChunks::new(request(2, "x"), config);
            let start = Instant::now();
            assert!(matches!(producer.pull(start), Pull::Ready(_)));
            match producer.pull(start) {
                Pull::NotReady { until } => {
                    let delay = until - start;
                    assert!(delay >= base - jitter, "delay {delay:?} below bound");
                    assert!(delay <= base + jitter, "delay {delay:?} above bound");
                }
                // A sampled delay can land exactly on zero only when jitter
                // >= base; not the case here.
                other => panic!("expected NotReady, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unpaced_never_arms_gate() {
        let mut producer = RepeatChunks::new(request(100, "line"), unpaced(1));
        let now = Instant::now();
        for _ in 0..101 {
            assert!(matches!(producer.pull(now), Pull::Ready(_)));
        }
        assert_eq!(producer.pull(now), Pull::Done);
    }

    #[test]
    fn test_long_lines_shrink_batch() {
        // text + '\n' is exactly half the chunk cap, so two lines fit.
        let text = "y".repeat(MAX_CHUNK_BYTES / 2 - 1);
        let producer = RepeatChunks::new(request(10, &text), unpaced(128));
        assert_eq!(producer.lines_per_chunk, 2);
    }

    #[test]
    fn test_done_checked_before_gate() {
        // Pacing arms the gate after the terminator too; Done must still win.
        let config =
            ChunkConfig::new(1, Duration::from_millis(1000), Duration::ZERO).unwrap();
        let mut producer = RepeatChunks::new(request(0, "x"), config);
        let now = Instant::now();
        assert_eq!(producer.pull(now), Pull::Ready(Bytes::from_static(b"\n")));
        assert_eq!(producer.pull(now), Pull::Done);
    }
}
