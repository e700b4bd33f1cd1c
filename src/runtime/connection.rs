//! Per-connection coordination.
//!
//! A connection owns its line decoder, request state machine, demand
//! controller, write queue, and at most one live chunk producer. All of it
//! is touched only from the connection's worker thread, so there is no
//! locking. Three signals re-enter a connection: input bytes arriving,
//! the socket becoming writable, and a delay gate elapsing. Side effects
//! that belong to the worker (arming a timer, scheduling a deferred read
//! request) are returned as [`Effects`] instead of performed inline.

use crate::config::Config;
use crate::protocol::{
    ChunkConfig, FramingError, LineDecoder, ProtocolError, Pull, RepeatChunks, RequestDecoder,
};
use crate::runtime::demand::{DemandController, DemandSnapshot};
use crate::runtime::outbound::WriteQueue;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::trace;

/// Worker-level follow-ups requested by a connection.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Queue a deferred read request for this connection.
    pub schedule_read: bool,
    /// Arm (or re-arm) the delay-gate timer for this deadline.
    pub arm_gate: Option<Instant>,
}

pub(crate) struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// Distinguishes this connection from earlier users of the same slab
    /// slot, so stale timers and actions are dropped.
    epoch: u64,
    registered: Interest,
    decoder: LineDecoder,
    requests: RequestDecoder,
    outbound: WriteQueue,
    chunk_config: ChunkConfig,
    producer: Option<RepeatChunks>,
    response_in_flight: bool,
    demand: DemandController,
    /// The transport owes the application one input line.
    line_wanted: bool,
    /// Deadline of the currently scheduled gate timer, if any. Prevents
    /// duplicate timer entries for the same gate.
    armed_gate: Option<Instant>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        epoch: u64,
        config: &Config,
        chunk_config: ChunkConfig,
    ) -> Self {
        Self {
            stream,
            peer,
            epoch,
            registered: Interest::WRITABLE,
            decoder: LineDecoder::new(config.max_line_len),
            requests: RequestDecoder::new(),
            outbound: WriteQueue::new(config.low_watermark, config.high_watermark),
            chunk_config,
            producer: None,
            response_in_flight: false,
            demand: DemandController::new(),
            line_wanted: false,
            armed_gate: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Initial registration. Parked on WRITABLE until read demand arrives;
    /// see `sync_interest`.
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::WRITABLE)?;
        self.registered = Interest::WRITABLE;
        Ok(())
    }

    /// Keep the poll registration in line with what the connection is
    /// actually waiting for: READABLE only while a line is owed, WRITABLE
    /// while output is queued. mio has no empty interest set, so an idle
    /// connection stays parked on WRITABLE (a spurious writable event is a
    /// no-op).
    pub fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let wanted = match (self.line_wanted, !self.outbound.is_empty()) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, _) => Interest::WRITABLE,
        };
        if self.registered != wanted {
            registry.reregister(&mut self.stream, token, wanted)?;
            self.registered = wanted;
        }
        Ok(())
    }

    /// Record the gate deadline; true when a timer entry is actually
    /// needed (the same deadline is never scheduled twice).
    pub fn arm_gate_if_new(&mut self, until: Instant) -> bool {
        if self.armed_gate == Some(until) {
            return false;
        }
        self.armed_gate = Some(until);
        true
    }

    pub fn on_connect(&mut self, effects: &mut Effects) {
        self.reconsider_demand(effects);
    }

    pub fn on_readable(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        // No read demand, no reads: backpressure toward the sender is the
        // kernel receive buffer filling up.
        if !self.line_wanted {
            return Ok(());
        }
        self.fill_from_socket(now, effects)
    }

    pub fn on_writable(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        self.drive(now, effects)
    }

    pub fn on_gate_elapsed(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        self.armed_gate = None;
        if self.response_in_flight {
            self.drive(now, effects)?;
        }
        Ok(())
    }

    /// The deferred half of a read request. Conditions may have changed
    /// since it was scheduled, so eligibility is checked again before any
    /// line is delivered.
    pub fn execute_read_request(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        if self.demand.execute(self.snapshot()) {
            self.request_next_line(now, effects)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> DemandSnapshot {
        DemandSnapshot {
            response_in_flight: self.response_in_flight,
            // Liveness is enforced by the worker: closed connections leave
            // the registry before any deferred work can reach them.
            active: true,
            writable: self.outbound.is_writable(),
        }
    }

    fn reconsider_demand(&mut self, effects: &mut Effects) {
        if self.demand.reconsider(self.snapshot()) {
            effects.schedule_read = true;
        }
    }

    /// Ask the transport for exactly one more line: buffered input first,
    /// then the socket, then (via interest) the poll loop.
    fn request_next_line(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        self.line_wanted = true;
        self.deliver_buffered(now, effects)?;
        if self.line_wanted {
            self.fill_from_socket(now, effects)?;
        }
        Ok(())
    }

    /// Surface buffered lines while one is owed. Stops as soon as demand
    /// is satisfied; anything else a pipelining client sent stays buffered
    /// until the current response completes.
    fn deliver_buffered(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        while self.line_wanted {
            match self.decoder.next_line() {
                Ok(Some(line)) => {
                    self.line_wanted = false;
                    self.handle_line(&line, now, effects)?;
                }
                Ok(None) => break,
                Err(e @ FramingError::Overflow { .. }) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e))
                }
            }
        }
        Ok(())
    }

    fn fill_from_socket(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        let mut buf = [0u8; 8192];
        while self.line_wanted {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF"));
                }
                Ok(n) => {
                    self.decoder.extend(&buf[..n]);
                    self.deliver_buffered(now, effects)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str, now: Instant, effects: &mut Effects) -> io::Result<()> {
        if self.response_in_flight {
            // Demand gating makes this unreachable from the wire; close
            // loudly rather than recover.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::UnexpectedLine,
            ));
        }

        match self.requests.on_line(line) {
            Ok(None) => {
                // Half a request parsed; the text line is owed immediately.
                self.line_wanted = true;
                Ok(())
            }
            Ok(Some(request)) => {
                trace!(
                    peer = %self.peer,
                    count = request.count,
                    text_len = request.text.len(),
                    "Request complete"
                );
                self.response_in_flight = true;
                self.producer = Some(RepeatChunks::new(request, self.chunk_config));
                self.drive(now, effects)
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }

    /// Advance the response pipeline: produce while under the high
    /// watermark, flush until the socket would block, resume production if
    /// the flush reopened the window, and finish the response once the
    /// producer is done and every byte has left the queue.
    fn drive(&mut self, now: Instant, effects: &mut Effects) -> io::Result<()> {
        loop {
            self.produce(now, effects);

            let became_writable = if self.outbound.is_empty() {
                false
            } else {
                self.outbound.flush(&mut self.stream)?
            };

            if self.response_in_flight && self.producer.is_none() && self.outbound.is_empty() {
                self.response_in_flight = false;
                trace!(peer = %self.peer, "Response complete");
                self.reconsider_demand(effects);
            }

            if became_writable {
                self.reconsider_demand(effects);
                if self.producer.is_some() {
                    continue;
                }
            }
            return Ok(());
        }
    }

    fn produce(&mut self, now: Instant, effects: &mut Effects) {
        while self.outbound.is_writable() {
            let Some(producer) = self.producer.as_mut() else {
                return;
            };
            match producer.pull(now) {
                Pull::Ready(chunk) => {
                    if self.outbound.push(chunk) {
                        trace!(
                            peer = %self.peer,
                            queued = self.outbound.queued_bytes(),
                            "High watermark reached, pausing production"
                        );
                    }
                }
                Pull::NotReady { until } => {
                    effects.arm_gate = Some(until);
                    return;
                }
                Pull::Done => {
                    let produced = producer.produced();
                    trace!(peer = %self.peer, produced, "Response fully produced");
                    self.producer = None;
                    return;
                }
            }
        }
    }
}
