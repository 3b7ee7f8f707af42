//! The dedicated consumer thread.
//!
//! One thread owns the receive side of the unified queue, decoupled from
//! the embedding service's main loop so slow orchestration work can never
//! starve frame processing. Each cycle pulls a batch of handles, decodes
//! every frame against its bus's node table, appends samples downstream,
//! and returns each slot to its source pool.
//!
//! Failure containment is per frame: lookup misses, decode errors, store
//! backpressure, and even a panic inside decode are counted and the slot is
//! still freed. Nothing a single frame does can halt the thread.

use crate::decode::decode_frame;
use crate::runtime::{PoolSet, TableSet};
use crate::store::SampleSink;
use frameslab::{ConsumerStats, Level, LogQueue, SlotHandle, UnifiedQueue};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Batch and sleep tuning for the consumer loop.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerTuning {
    /// Handles pulled per cycle.
    pub batch_max: usize,
    /// Sleep after an empty cycle.
    pub idle_sleep_us: u64,
    /// Sleep after a non-empty cycle; keeps latency low without pinning a
    /// core during sustained load.
    pub busy_sleep_us: u64,
    /// How long shutdown keeps decoding before it switches to free-only.
    pub drain_deadline_ms: u64,
    /// Fixed real-time priority (POSIX 0–99); `None` keeps the default
    /// scheduling class.
    pub priority: Option<i32>,
}

/// The consumer thread, ready to spawn.
pub struct Consumer {
    queue: Arc<UnifiedQueue>,
    pools: Arc<PoolSet>,
    tables: Arc<TableSet>,
    stats: Arc<ConsumerStats>,
    sink: Arc<dyn SampleSink>,
    log: Arc<LogQueue>,
    stop: Arc<AtomicBool>,
    tuning: ConsumerTuning,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<UnifiedQueue>,
        pools: Arc<PoolSet>,
        tables: Arc<TableSet>,
        stats: Arc<ConsumerStats>,
        sink: Arc<dyn SampleSink>,
        log: Arc<LogQueue>,
        stop: Arc<AtomicBool>,
        tuning: ConsumerTuning,
    ) -> Self {
        Self {
            queue,
            pools,
            tables,
            stats,
            sink,
            log,
            stop,
            tuning,
        }
    }

    /// Spawns the dedicated thread.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("can-consumer".into())
            .spawn(move || self.run())
    }

    fn run(self) {
        if let Some(priority) = self.tuning.priority {
            elevate_priority(priority, &self.log);
        }

        let idle = Duration::from_micros(self.tuning.idle_sleep_us);
        let busy = Duration::from_micros(self.tuning.busy_sleep_us);
        let mut batch: Vec<SlotHandle> = Vec::with_capacity(self.tuning.batch_max);

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            batch.clear();
            let pulled = self.queue.dequeue_batch(self.tuning.batch_max, &mut batch);
            if pulled == 0 {
                thread::sleep(idle);
                continue;
            }

            let start = Instant::now();
            for handle in batch.drain(..) {
                self.process_one(handle);
            }
            self.stats
                .record_cycle(start.elapsed().as_micros() as u64, pulled as u64);

            thread::sleep(busy);
        }

        self.drain();
    }

    /// Shutdown drain: keep decoding until the deadline, then free the
    /// remainder undecoded (counted) so no slot outlives the pipeline.
    /// Producers have stopped by the time this can complete.
    fn drain(&self) {
        let deadline = Instant::now() + Duration::from_millis(self.tuning.drain_deadline_ms);
        let mut batch: Vec<SlotHandle> = Vec::with_capacity(self.tuning.batch_max);

        loop {
            batch.clear();
            if self.queue.dequeue_batch(self.tuning.batch_max, &mut batch) == 0 {
                break;
            }

            let decode = Instant::now() < deadline;
            for handle in batch.drain(..) {
                if decode {
                    self.process_one(handle);
                } else {
                    self.stats.record_shutdown_drop();
                    self.free(handle);
                }
            }
        }
    }

    fn process_one(&self, handle: SlotHandle) {
        let Some(pool) = self.pools.pool(handle.bus()) else {
            // Unreachable through the normal pipeline: every handle was
            // minted by one of our pools.
            self.log.enqueue(
                Level::Error,
                &format!("handle for unknown bus {} dropped", handle.bus()),
            );
            return;
        };

        let frame = pool.frame(&handle);
        match self
            .tables
            .table(handle.bus())
            .and_then(|t| t.lookup(frame.can_id))
        {
            Some(node) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    decode_frame(&frame, node, self.sink.as_ref(), &self.stats);
                }));
                if outcome.is_err() {
                    self.stats.record_decode_panic();
                    self.log.enqueue(
                        Level::Error,
                        &format!("decode panicked for CAN id {:#x}; frame skipped", frame.can_id),
                    );
                }
            }
            None => self.stats.record_unmapped(),
        }

        let _ = pool.free(handle);
    }

    fn free(&self, handle: SlotHandle) {
        if let Some(pool) = self.pools.pool(handle.bus()) {
            let _ = pool.free(handle);
        }
    }
}

/// Best-effort switch to a fixed-priority scheduling class. The consumer
/// runs above cosmetic work but below the hardware-driven producers, which
/// the embedding service configures separately.
#[cfg(target_os = "linux")]
fn elevate_priority(priority: i32, log: &LogQueue) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: plain FFI call on the current thread with a valid sched_param.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        log.enqueue(
            Level::Info,
            &format!("consumer thread at SCHED_FIFO priority {priority}"),
        );
    } else {
        log.enqueue(
            Level::Warn,
            &format!("could not set consumer priority {priority}; staying in default class"),
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn elevate_priority(priority: i32, log: &LogQueue) {
    log.enqueue(
        Level::Debug,
        &format!("consumer priority {priority} requested; not supported on this platform"),
    );
}
