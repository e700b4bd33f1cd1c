//! Readiness-based runtime for the dup server.
//!
//! One worker thread per SO_REUSEPORT listener; the kernel load-balances
//! accepted connections across workers, and every connection lives on
//! exactly one worker for its whole life. Per-connection state is therefore
//! exclusively owned and needs no locking; the only resource shared across
//! workers is the ref-counted buffer storage behind `bytes`.
//!
//! Module map:
//! - `connection`: per-connection coordinator (framing, request machine,
//!   producer, demand, write queue)
//! - `demand`: read-demand controller
//! - `outbound`: watermarked write queue
//! - `timer`: delay-gate deadlines
//! - `event_loop`: the mio poll loop tying it together

mod connection;
mod demand;
mod event_loop;
mod outbound;
mod timer;

use crate::config::Config;
use crate::protocol::ChunkConfig;
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// A bound but not yet running server.
pub struct Server {
    config: Config,
    chunk_config: ChunkConfig,
    listeners: Vec<std::net::TcpListener>,
    addr: SocketAddr,
}

impl Server {
    /// Bind one listener per worker. The requested address is resolved
    /// once, so an ephemeral port (`:0`) ends up shared by all workers.
    /// Rejects an invalid chunk configuration up front.
    pub fn bind(config: Config) -> io::Result<Self> {
        let requested: SocketAddr = config.listen.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address '{}': {e}", config.listen),
            )
        })?;

        let chunk_config = ChunkConfig::new(
            config.lines_per_chunk,
            Duration::from_millis(config.delay_ms),
            Duration::from_millis(config.delay_jitter_ms),
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let workers = config.workers.unwrap_or_else(num_cpus).max(1);

        let first = create_listener_with_reuseport(requested)?;
        let addr = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..workers {
            listeners.push(create_listener_with_reuseport(addr)?);
        }

        Ok(Self {
            config,
            chunk_config,
            listeners,
            addr,
        })
    }

    /// The resolved listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Spawn the workers and block until they exit (normally: forever).
    pub fn run(self) -> io::Result<()> {
        info!(
            addr = %self.local_addr(),
            workers = self.listeners.len(),
            delay_ms = self.config.delay_ms,
            delay_jitter_ms = self.config.delay_jitter_ms,
            lines_per_chunk = self.config.lines_per_chunk,
            "Server listening"
        );

        let mut handles = Vec::with_capacity(self.listeners.len());

        for (worker_id, listener) in self.listeners.into_iter().enumerate() {
            let config = self.config.clone();
            let chunk_config = self.chunk_config;

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) =
                        event_loop::worker_loop(worker_id, listener, &config, chunk_config)
                    {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        Ok(())
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
