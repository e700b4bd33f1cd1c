//! mio worker event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Each worker additionally drains two queues after every wakeup:
//!
//! - a timer queue for delay-gate deadlines (the earliest deadline becomes
//!   the poll timeout), and
//! - an action queue for deferred read requests, so a demand decision never
//!   turns into an inline re-entrant read.
//!
//! Any error on a connection closes that connection only.

use crate::config::Config;
use crate::protocol::ChunkConfig;
use crate::runtime::connection::{Connection, Effects};
use crate::runtime::timer::TimerQueue;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Deferred per-connection work, run after the current event batch.
enum Action {
    ReadRequest { conn_id: usize, epoch: u64 },
}

struct Worker<'a> {
    worker_id: usize,
    config: &'a Config,
    chunk_config: ChunkConfig,
    connections: Slab<Connection>,
    timers: TimerQueue,
    actions: VecDeque<Action>,
    /// Monotonic connection stamp; lets timers and actions detect a reused
    /// slab slot.
    next_epoch: u64,
}

pub(crate) fn worker_loop(
    worker_id: usize,
    listener: std::net::TcpListener,
    config: &Config,
    chunk_config: ChunkConfig,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(256);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut worker = Worker {
        worker_id,
        config,
        chunk_config,
        connections: Slab::with_capacity(config.max_connections),
        timers: TimerQueue::new(),
        actions: VecDeque::new(),
        next_epoch: 0,
    };

    info!(worker = worker_id, "Worker started");

    loop {
        let timeout = worker
            .timers
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()));
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        let now = Instant::now();

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => worker.accept(&listener, poll.registry()),
                Token(conn_id) => worker.dispatch(conn_id, event, now, poll.registry()),
            }
        }

        worker.expire_gates(now, poll.registry());
        worker.run_actions(now, poll.registry());
    }
}

impl Worker<'_> {
    fn accept(&mut self, listener: &TcpListener, registry: &Registry) {
        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if self.connections.len() >= self.config.max_connections {
                        warn!(
                            worker = self.worker_id,
                            peer = %peer_addr,
                            "Connection limit reached, rejecting"
                        );
                        continue;
                    }

                    self.next_epoch += 1;
                    let conn_id = self.connections.insert(Connection::new(
                        stream,
                        peer_addr,
                        self.next_epoch,
                        self.config,
                        self.chunk_config,
                    ));

                    let conn = &mut self.connections[conn_id];
                    if let Err(e) = conn.register(registry, Token(conn_id)) {
                        error!(conn_id, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(
                        worker = self.worker_id,
                        conn_id,
                        peer = %peer_addr,
                        "Accepted connection"
                    );

                    let mut effects = Effects::default();
                    conn.on_connect(&mut effects);
                    self.complete(conn_id, Ok(()), effects, registry);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(worker = self.worker_id, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        conn_id: usize,
        event: &mio::event::Event,
        now: Instant,
        registry: &Registry,
    ) {
        let mut effects = Effects::default();
        let result = self.handle_event(conn_id, event, now, &mut effects);
        self.complete(conn_id, result, effects, registry);
    }

    fn handle_event(
        &mut self,
        conn_id: usize,
        event: &mio::event::Event,
        now: Instant,
        effects: &mut Effects,
    ) -> io::Result<()> {
        if event.is_readable() {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                conn.on_readable(now, effects)?;
            }
        }
        if event.is_writable() {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                conn.on_writable(now, effects)?;
            }
        }
        Ok(())
    }

    /// Fire delay gates that came due while we slept (or while handling
    /// events).
    fn expire_gates(&mut self, now: Instant, registry: &Registry) {
        while let Some((conn_id, epoch)) = self.timers.pop_due(now) {
            let mut effects = Effects::default();
            let result = match self.connections.get_mut(conn_id) {
                Some(conn) if conn.epoch() == epoch => conn.on_gate_elapsed(now, &mut effects),
                // Connection went away between arming and expiry.
                _ => Ok(()),
            };
            self.complete(conn_id, result, effects, registry);
        }
    }

    /// Run deferred read requests, including ones queued by the handlers
    /// in this same wakeup. Pipelined requests resolve here back-to-back.
    fn run_actions(&mut self, now: Instant, registry: &Registry) {
        while let Some(Action::ReadRequest { conn_id, epoch }) = self.actions.pop_front() {
            let mut effects = Effects::default();
            let result = match self.connections.get_mut(conn_id) {
                Some(conn) if conn.epoch() == epoch => {
                    conn.execute_read_request(now, &mut effects)
                }
                _ => Ok(()),
            };
            self.complete(conn_id, result, effects, registry);
        }
    }

    /// Apply a handler's outcome: on success, arm timers, queue actions,
    /// and re-sync poll interest; on failure, close the connection.
    fn complete(
        &mut self,
        conn_id: usize,
        result: io::Result<()>,
        effects: Effects,
        registry: &Registry,
    ) {
        let result = result.and_then(|()| self.apply_effects(conn_id, effects, registry));
        if let Err(e) = result {
            debug!(conn_id, error = %e, "Connection error");
            self.close(conn_id, registry);
        }
    }

    fn apply_effects(
        &mut self,
        conn_id: usize,
        effects: Effects,
        registry: &Registry,
    ) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        if let Some(until) = effects.arm_gate {
            if conn.arm_gate_if_new(until) {
                self.timers.schedule(until, conn_id, conn.epoch());
            }
        }
        if effects.schedule_read {
            self.actions.push_back(Action::ReadRequest {
                conn_id,
                epoch: conn.epoch(),
            });
        }

        conn.sync_interest(registry, Token(conn_id))
    }

    fn close(&mut self, conn_id: usize, registry: &Registry) {
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            let _ = registry.deregister(conn.stream_mut());
            debug!(conn_id, peer = %conn.peer(), "Connection closed");
        }
    }
}
