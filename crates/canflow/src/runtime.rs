//! The composed ingest core.
//!
//! [`Core::build`] turns a validated [`CoreConfig`] into the long-lived
//! root structure: per-bus pools, the unified queue, frozen node tables,
//! stats blocks, and the async log queue, all shared by reference with the
//! producer and consumer threads. [`Core::start`] spawns the data plane and
//! returns a [`CoreHandle`] whose `shutdown` is idempotent and drains the
//! queue before joining.
//!
//! Physical and Ethernet logical buses are two distinct, self-describing
//! collections; a bus tag is only resolved against the collection it
//! belongs to, so the length of one can never be used to iterate the other.

use crate::config::{ConfigError, CoreConfig, Framing};
use crate::consumer::{Consumer, ConsumerTuning};
use crate::nodes::NodeTable;
use crate::producer::BusIngress;
use crate::server::{EthernetServer, ServerHandle, ServerStats, ServerStatsSnapshot};
use crate::store::SampleSink;
use frameslab::{
    BusStats, BusStatsSnapshot, BusTag, ConsumerStats, ConsumerStatsSnapshot, FramePool, LogQueue,
    LogSink, UnifiedQueue,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

/// All frame pools: the two physical controllers plus the Ethernet logical
/// buses, each collection self-describing in length.
pub struct PoolSet {
    physical: [Arc<FramePool>; 2],
    ethernet: Vec<Arc<FramePool>>,
}

impl PoolSet {
    /// Resolves a bus tag to its pool.
    pub fn pool(&self, tag: BusTag) -> Option<&Arc<FramePool>> {
        match tag.ethernet_index() {
            None => self.physical.get(usize::from(tag.raw())),
            Some(i) => self.ethernet.get(i),
        }
    }

    /// Every pool, physical buses first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FramePool>> {
        self.physical.iter().chain(self.ethernet.iter())
    }

    /// Number of buses (physical + logical).
    pub fn len(&self) -> usize {
        self.physical.len() + self.ethernet.len()
    }

    pub fn is_empty(&self) -> bool {
        false // two physical buses always exist
    }
}

/// All node tables, mirroring [`PoolSet`]'s two collections.
pub struct TableSet {
    physical: [NodeTable; 2],
    ethernet: Vec<NodeTable>,
}

impl TableSet {
    /// Resolves a bus tag to its node table.
    pub fn table(&self, tag: BusTag) -> Option<&NodeTable> {
        match tag.ethernet_index() {
            None => self.physical.get(usize::from(tag.raw())),
            Some(i) => self.ethernet.get(i),
        }
    }
}

struct MonitorState {
    taken_at: Instant,
    /// Per bus: (frames_rx, bytes_rx, drop total) at the last tick.
    last: Vec<(u64, u64, u64)>,
}

/// The ingest core: everything the data plane shares.
pub struct Core {
    config: CoreConfig,
    pools: Arc<PoolSet>,
    tables: Arc<TableSet>,
    queue: Arc<UnifiedQueue>,
    consumer_stats: Arc<ConsumerStats>,
    server_stats: Arc<ServerStats>,
    log: Arc<LogQueue>,
    stop: Arc<AtomicBool>,
    started: AtomicBool,
    monitor: Mutex<MonitorState>,
}

impl Core {
    /// Validates `config` and constructs the core. The node tables are
    /// frozen here; nothing mutates them afterwards.
    ///
    /// This is the only fatal error path in the pipeline.
    pub fn build(config: CoreConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let log = Arc::new(LogQueue::new(config.log_queue_capacity));

        let physical_pools = [
            Arc::new(FramePool::new(
                BusTag::CAN0,
                config.can0.capacity,
                Arc::new(BusStats::new()),
                Arc::clone(&log),
            )),
            Arc::new(FramePool::new(
                BusTag::CAN1,
                config.can1.capacity,
                Arc::new(BusStats::new()),
                Arc::clone(&log),
            )),
        ];
        let ethernet_pools: Vec<Arc<FramePool>> = config
            .ethernet
            .buses
            .iter()
            .enumerate()
            .map(|(i, bus)| {
                Arc::new(FramePool::new(
                    BusTag::ethernet(i),
                    bus.capacity,
                    Arc::new(BusStats::new()),
                    Arc::clone(&log),
                ))
            })
            .collect();

        let tables = TableSet {
            physical: [
                NodeTable::build(&config.can0.nodes),
                NodeTable::build(&config.can1.nodes),
            ],
            ethernet: config
                .ethernet
                .buses
                .iter()
                .map(|bus| NodeTable::build(&bus.nodes))
                .collect(),
        };

        let pools = PoolSet {
            physical: physical_pools,
            ethernet: ethernet_pools,
        };
        let bus_count = pools.len();

        Ok(Arc::new(Self {
            queue: Arc::new(UnifiedQueue::new(config.queue_capacity)),
            pools: Arc::new(pools),
            tables: Arc::new(tables),
            consumer_stats: Arc::new(ConsumerStats::new()),
            server_stats: Arc::new(ServerStats::default()),
            log,
            stop: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            monitor: Mutex::new(MonitorState {
                taken_at: Instant::now(),
                last: vec![(0, 0, 0); bus_count],
            }),
            config,
        }))
    }

    /// Starts the data plane: the consumer thread, and the Ethernet server
    /// when logical buses are configured. Decoded samples go to `sink`.
    ///
    /// The queue has a single consumer; a second `start` on the same core
    /// is refused.
    pub fn start(
        self: &Arc<Self>,
        sink: Arc<dyn SampleSink>,
    ) -> std::io::Result<CoreHandle> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "core already started",
            ));
        }

        let consumer = Consumer::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.pools),
            Arc::clone(&self.tables),
            Arc::clone(&self.consumer_stats),
            sink,
            Arc::clone(&self.log),
            Arc::clone(&self.stop),
            ConsumerTuning {
                batch_max: self.config.batch_max,
                idle_sleep_us: self.config.idle_sleep_us,
                busy_sleep_us: self.config.busy_sleep_us,
                drain_deadline_ms: self.config.drain_deadline_ms,
                priority: self.config.consumer_priority,
            },
        )
        .spawn()?;

        let server = if self.config.ethernet.buses.is_empty() {
            None
        } else {
            // Validation already checked the address parses.
            let addr: SocketAddr = self
                .config
                .ethernet
                .bind_addr
                .parse()
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
            let ingresses = (0..self.pools.ethernet.len())
                .map(|i| {
                    BusIngress::new(
                        Arc::clone(&self.pools.ethernet[i]),
                        Arc::clone(&self.queue),
                    )
                })
                .collect();
            Some(
                EthernetServer::new(
                    addr,
                    self.config.ethernet.framing,
                    ingresses,
                    Arc::clone(&self.server_stats),
                    Arc::clone(&self.log),
                    Arc::clone(&self.stop),
                )
                .spawn()?,
            )
        };

        Ok(CoreHandle {
            core: Arc::clone(self),
            consumer: Some(consumer),
            server,
        })
    }

    /// Ingest endpoint for a bus; hardware callbacks and replay feeds hold
    /// one per bus they produce on.
    pub fn ingress(&self, tag: BusTag) -> Option<BusIngress> {
        self.pools
            .pool(tag)
            .map(|pool| BusIngress::new(Arc::clone(pool), Arc::clone(&self.queue)))
    }

    /// The framing the Ethernet server speaks.
    pub fn framing(&self) -> Framing {
        self.config.ethernet.framing
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    pub fn queue(&self) -> &Arc<UnifiedQueue> {
        &self.queue
    }

    pub fn log_queue(&self) -> &Arc<LogQueue> {
        &self.log
    }

    pub fn consumer_stats(&self) -> &Arc<ConsumerStats> {
        &self.consumer_stats
    }

    /// Drains queued log lines within the given budgets; called from the
    /// embedding main loop each iteration (typically `(100, 200_000)`).
    pub fn flush_logs(&self, max_entries: usize, max_wall_us: u64, sink: &mut dyn LogSink) -> usize {
        self.log.flush(max_entries, max_wall_us, sink)
    }

    // ---------------------------------------------------------------------
    // OPERATIONAL SURFACE
    // ---------------------------------------------------------------------

    /// Full counter snapshot for the CLI's `stats` surface.
    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            buses: self
                .pools
                .iter()
                .map(|pool| BusSnapshot {
                    bus: pool.bus().to_string(),
                    capacity: pool.capacity(),
                    free: pool.free_count(),
                    fill_percent: pool.fill_percent(),
                    stats: pool.stats().snapshot(),
                })
                .collect(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            queue_depth_high_water: self.queue.depth_high_water(),
            consumer: self.consumer_stats.snapshot(),
            server: self.server_stats.snapshot(),
            log_dropped: self.log.dropped(),
        }
    }

    /// Clears every counter epoch, including the monitor baseline.
    pub fn reset_stats(&self) {
        for pool in self.pools.iter() {
            pool.stats().reset();
        }
        self.consumer_stats.reset();
        self.server_stats.reset();
        self.queue.reset_high_water();

        let mut monitor = self.monitor_lock();
        monitor.taken_at = Instant::now();
        monitor.last = vec![(0, 0, 0); self.pools.len()];
    }

    /// Per-second rates since the previous tick; sized for 1 Hz dashboard
    /// rendering. Also folds the measured rates into each bus's peaks.
    pub fn monitor_tick(&self) -> MonitorTick {
        let mut monitor = self.monitor_lock();
        let elapsed = monitor.taken_at.elapsed();
        let elapsed_us = elapsed.as_micros().max(1) as u64;

        let mut buses = Vec::with_capacity(self.pools.len());
        for (i, pool) in self.pools.iter().enumerate() {
            let snap = pool.stats().snapshot();
            let drops = snap.drops.total();
            let (last_frames, last_bytes, last_drops) = monitor.last[i];

            let frames_per_sec =
                rate_per_sec(snap.frames_rx.saturating_sub(last_frames), elapsed_us);
            let bytes_per_sec = rate_per_sec(snap.bytes_rx.saturating_sub(last_bytes), elapsed_us);
            pool.stats().note_rates(frames_per_sec, bytes_per_sec);

            buses.push(BusRates {
                bus: pool.bus().to_string(),
                frames_per_sec,
                bytes_per_sec,
                drops_per_sec: rate_per_sec(drops.saturating_sub(last_drops), elapsed_us),
                fill_percent: pool.fill_percent(),
            });
            monitor.last[i] = (snap.frames_rx, snap.bytes_rx, drops);
        }
        monitor.taken_at = Instant::now();

        MonitorTick {
            interval_us: elapsed_us,
            buses,
            queue_depth: self.queue.depth(),
            queue_fill_percent: (self.queue.depth() as u64 * 100) / self.queue.capacity() as u64,
            consumer: self.consumer_stats.snapshot(),
        }
    }

    fn monitor_lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn rate_per_sec(delta: u64, elapsed_us: u64) -> u64 {
    delta.saturating_mul(1_000_000) / elapsed_us
}

/// One bus's slice of a [`CoreSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct BusSnapshot {
    pub bus: String,
    pub capacity: usize,
    pub free: usize,
    pub fill_percent: u64,
    pub stats: BusStatsSnapshot,
}

/// Everything the read-only `stats` surface exposes.
#[derive(Debug, Clone, Serialize)]
pub struct CoreSnapshot {
    pub buses: Vec<BusSnapshot>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_depth_high_water: usize,
    pub consumer: ConsumerStatsSnapshot,
    pub server: ServerStatsSnapshot,
    pub log_dropped: u64,
}

/// One bus's rates in a [`MonitorTick`].
#[derive(Debug, Clone, Serialize)]
pub struct BusRates {
    pub bus: String,
    pub frames_per_sec: u64,
    pub bytes_per_sec: u64,
    pub drops_per_sec: u64,
    pub fill_percent: u64,
}

/// Small structure for 1 Hz dashboard rendering.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorTick {
    pub interval_us: u64,
    pub buses: Vec<BusRates>,
    pub queue_depth: usize,
    pub queue_fill_percent: u64,
    pub consumer: ConsumerStatsSnapshot,
}

/// The running data plane. `shutdown` (or drop) stops the threads; the
/// consumer drains the queue up to its deadline first.
pub struct CoreHandle {
    core: Arc<Core>,
    consumer: Option<thread::JoinHandle<()>>,
    server: Option<ServerHandle>,
}

impl CoreHandle {
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Address the Ethernet server is listening on, when one is running.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(ServerHandle::local_addr)
    }

    /// Signals stop, waits for the consumer to drain and the server to
    /// exit. Idempotent: later calls return immediately.
    pub fn shutdown(&mut self) {
        self.core.stop.store(true, Ordering::Release);
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
        if let Some(mut server) = self.server.take() {
            server.join();
        }
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
