//! Ethernet CAN TCP server.
//!
//! A dedicated acceptor thread serving one client at a time. Socket reads
//! are fed through the configured [`Assembler`], and each recovered record
//! is routed to the logical bus its tag addresses — one TCP stream may
//! interleave frames for several logical buses. Connection loss resets the
//! parser (dropping any partial record in flight) and the server goes back
//! to accepting.
//!
//! This is the only component that performs blocking I/O besides the log
//! flusher; the accept loop polls with the stop flag so shutdown never
//! waits on a silent peer.

use crate::config::Framing;
use crate::framing::{Assembler, WireFrame, MIN_BUS_TAG};
use crate::producer::BusIngress;
use frameslab::{monotonic_us, Level, LogQueue};
use serde::Serialize;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// Read timeout while a client is connected; bounds stop-flag latency.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Socket read buffer. Large enough for several thousand records per read
/// at sustained rates.
const READ_BUF: usize = 64 * 1024;

/// Wire-level counters owned by the server thread.
#[derive(Debug, Default)]
pub struct ServerStats {
    malformed_frames: AtomicU64,
    resync_bytes_skipped: AtomicU64,
    unknown_bus_frames: AtomicU64,
    connections: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            resync_bytes_skipped: self.resync_bytes_skipped.load(Ordering::Relaxed),
            unknown_bus_frames: self.unknown_bus_frames.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.malformed_frames.store(0, Ordering::Relaxed);
        self.resync_bytes_skipped.store(0, Ordering::Relaxed);
        self.unknown_bus_frames.store(0, Ordering::Relaxed);
        self.connections.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    pub malformed_frames: u64,
    pub resync_bytes_skipped: u64,
    pub unknown_bus_frames: u64,
    pub connections: u64,
}

/// A running server: the bound address plus the acceptor thread.
pub struct ServerHandle {
    local_addr: SocketAddr,
    handle: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// The address actually bound (resolves port 0 to the assigned port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the acceptor thread; returns immediately if already joined.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The Ethernet CAN server, ready to spawn.
pub struct EthernetServer {
    bind_addr: SocketAddr,
    framing: Framing,
    /// Ingress for logical bus i (bus tag `2 + i`).
    ingresses: Vec<BusIngress>,
    stats: Arc<ServerStats>,
    log: Arc<LogQueue>,
    stop: Arc<AtomicBool>,
}

impl EthernetServer {
    pub fn new(
        bind_addr: SocketAddr,
        framing: Framing,
        ingresses: Vec<BusIngress>,
        stats: Arc<ServerStats>,
        log: Arc<LogQueue>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bind_addr,
            framing,
            ingresses,
            stats,
            log,
            stop,
        }
    }

    /// Binds the listener and spawns the acceptor thread.
    ///
    /// Binding happens on the caller's thread so a bad address fails at
    /// startup instead of silently inside the acceptor.
    pub fn spawn(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.log.enqueue(
            Level::Info,
            &format!("ethernet CAN server listening on {local_addr}"),
        );

        let handle = thread::Builder::new()
            .name("can-eth-server".into())
            .spawn(move || self.run(listener))?;

        Ok(ServerHandle {
            local_addr,
            handle: Some(handle),
        })
    }

    fn run(self, listener: TcpListener) {
        // One assembler for the server's lifetime: its counters accumulate
        // across connections, buffered state is reset between them. The
        // shared stats advance by deltas so an epoch reset stays reset.
        let mut assembler = Assembler::new(self.framing);
        let mut seen = (0u64, 0u64);

        while !self.stop.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    self.log
                        .enqueue(Level::Info, &format!("ethernet CAN client {peer} connected"));
                    self.serve_client(stream, &mut assembler, &mut seen);
                    assembler.reset();
                    self.log
                        .enqueue(Level::Info, &format!("ethernet CAN client {peer} gone"));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    self.log
                        .enqueue(Level::Warn, &format!("ethernet CAN accept failed: {e}"));
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn serve_client(
        &self,
        stream: TcpStream,
        assembler: &mut Assembler,
        seen: &mut (u64, u64),
    ) {
        if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
            return;
        }
        let mut stream = stream;
        let mut buf = vec![0u8; READ_BUF];

        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            match stream.read(&mut buf) {
                Ok(0) => return, // orderly disconnect
                Ok(n) => {
                    assembler.extend(&buf[..n]);
                    while let Some(frame) = assembler.next_frame() {
                        self.route(&frame);
                    }
                    let (malformed, skipped) = (assembler.malformed(), assembler.bytes_skipped());
                    self.stats
                        .malformed_frames
                        .fetch_add(malformed - seen.0, Ordering::Relaxed);
                    self.stats
                        .resync_bytes_skipped
                        .fetch_add(skipped - seen.1, Ordering::Relaxed);
                    *seen = (malformed, skipped);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    // Read timeout: loop to re-check the stop flag.
                }
                Err(e) => {
                    self.log
                        .enqueue(Level::Warn, &format!("ethernet CAN read failed: {e}"));
                    return;
                }
            }
        }
    }

    fn route(&self, frame: &WireFrame) {
        let index = usize::from(frame.bus_tag - MIN_BUS_TAG);
        let Some(ingress) = self.ingresses.get(index) else {
            // A tag the parser accepted but no bus is configured for.
            self.stats.unknown_bus_frames.fetch_add(1, Ordering::Relaxed);
            return;
        };
        // Ingestion timestamp is local monotonic time; the record's own
        // timestamp is sender-side and may wrap.
        ingress.ingest(frame.can_id, frame.data(), monotonic_us());
    }
}

