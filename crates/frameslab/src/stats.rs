//! Per-bus and per-consumer performance counters.
//!
//! Writers are restricted: pool counters are updated by the pool's own
//! methods and by the producer that owns the bus; consumer counters are
//! updated only by the consumer thread. Readers take relaxed snapshots, so
//! a snapshot is consistent per counter but not across counters — good
//! enough for a 1 Hz dashboard, and it keeps the hot path free of fences.
//!
//! All counters are monotonic within an epoch; `reset()` starts a new one.

use crate::time::monotonic_us;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Drop counters bucketed by the observed buffer fill at drop time.
///
/// Buckets are inclusive of their lower edge and mutually exclusive:
/// `at_100` is fill ≥ 100 %, `at_95` is 95–99 %, `at_90` is 90–94 %, and
/// `under_90` keeps the ledger total for preemptive drops below 90 %.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropBuckets {
    pub at_100: u64,
    pub at_95: u64,
    pub at_90: u64,
    pub under_90: u64,
}

impl DropBuckets {
    /// Total drops across all buckets.
    #[inline]
    pub fn total(&self) -> u64 {
        self.at_100 + self.at_95 + self.at_90 + self.under_90
    }
}

/// Counters owned by one bus: its pool, its producer, and the monitor tick.
#[derive(Debug, Default)]
pub struct BusStats {
    frames_rx: AtomicU64,
    bytes_rx: AtomicU64,
    frames_tx: AtomicU64,
    bytes_tx: AtomicU64,

    drops_at_100: AtomicU64,
    drops_at_95: AtomicU64,
    drops_at_90: AtomicU64,
    drops_under_90: AtomicU64,
    queue_full_drops: AtomicU64,
    consecutive_drops: AtomicU64,
    consecutive_drops_high_water: AtomicU64,

    accounting_anomalies: AtomicU64,
    mutex_waits: AtomicU64,
    mutex_wait_us: AtomicU64,

    in_use_high_water: AtomicU64,
    in_use_high_water_ts_us: AtomicU64,

    // Written by the monitor tick, not the data plane.
    peak_frames_per_sec: AtomicU64,
    peak_bytes_per_sec: AtomicU64,
}

impl BusStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one received frame of `bytes` payload bytes.
    #[inline]
    pub fn record_rx(&self, bytes: u64) {
        self.frames_rx.fetch_add(1, Relaxed);
        self.bytes_rx.fetch_add(bytes, Relaxed);
    }

    /// Records one transmitted frame of `bytes` payload bytes.
    #[inline]
    pub fn record_tx(&self, bytes: u64) {
        self.frames_tx.fetch_add(1, Relaxed);
        self.bytes_tx.fetch_add(bytes, Relaxed);
    }

    /// Records a dropped frame at the given buffer fill percentage.
    ///
    /// Fill is 100 by definition when the pool itself was exhausted; a
    /// caller that gave up earlier passes the fill it observed.
    pub fn record_drop(&self, fill_percent: u64) {
        let bucket = if fill_percent >= 100 {
            &self.drops_at_100
        } else if fill_percent >= 95 {
            &self.drops_at_95
        } else if fill_percent >= 90 {
            &self.drops_at_90
        } else {
            &self.drops_under_90
        };
        bucket.fetch_add(1, Relaxed);

        let streak = self.consecutive_drops.fetch_add(1, Relaxed) + 1;
        self.consecutive_drops_high_water.fetch_max(streak, Relaxed);
    }

    /// Records a drop caused by the unified queue rejecting the handle.
    pub fn record_queue_full_drop(&self, fill_percent: u64) {
        self.queue_full_drops.fetch_add(1, Relaxed);
        self.record_drop(fill_percent);
    }

    /// Ends the current consecutive-drop streak.
    #[inline]
    pub fn note_alloc_success(&self) {
        self.consecutive_drops.store(0, Relaxed);
    }

    /// Counts one self-heal of the pool's free-count accounting.
    #[inline]
    pub fn record_accounting_anomaly(&self) {
        self.accounting_anomalies.fetch_add(1, Relaxed);
    }

    /// Records a contended pool-lock acquisition that waited `wait_us`.
    #[inline]
    pub fn record_mutex_wait(&self, wait_us: u64) {
        self.mutex_waits.fetch_add(1, Relaxed);
        self.mutex_wait_us.fetch_add(wait_us, Relaxed);
    }

    /// Tracks the pool's in-use high-water mark and when it was set.
    pub fn record_occupancy(&self, in_use: u64) {
        let prev = self.in_use_high_water.fetch_max(in_use, Relaxed);
        if in_use > prev {
            self.in_use_high_water_ts_us.store(monotonic_us(), Relaxed);
        }
    }

    /// Updates peak rates from a monitor-tick measurement.
    pub fn note_rates(&self, frames_per_sec: u64, bytes_per_sec: u64) {
        self.peak_frames_per_sec.fetch_max(frames_per_sec, Relaxed);
        self.peak_bytes_per_sec.fetch_max(bytes_per_sec, Relaxed);
    }

    /// Total drops across all fill buckets.
    pub fn total_drops(&self) -> u64 {
        self.snapshot().drops.total()
    }

    /// Relaxed snapshot of every counter.
    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            frames_rx: self.frames_rx.load(Relaxed),
            bytes_rx: self.bytes_rx.load(Relaxed),
            frames_tx: self.frames_tx.load(Relaxed),
            bytes_tx: self.bytes_tx.load(Relaxed),
            drops: DropBuckets {
                at_100: self.drops_at_100.load(Relaxed),
                at_95: self.drops_at_95.load(Relaxed),
                at_90: self.drops_at_90.load(Relaxed),
                under_90: self.drops_under_90.load(Relaxed),
            },
            queue_full_drops: self.queue_full_drops.load(Relaxed),
            consecutive_drops: self.consecutive_drops.load(Relaxed),
            consecutive_drops_high_water: self.consecutive_drops_high_water.load(Relaxed),
            accounting_anomalies: self.accounting_anomalies.load(Relaxed),
            mutex_waits: self.mutex_waits.load(Relaxed),
            mutex_wait_us: self.mutex_wait_us.load(Relaxed),
            in_use_high_water: self.in_use_high_water.load(Relaxed),
            in_use_high_water_ts_us: self.in_use_high_water_ts_us.load(Relaxed),
            peak_frames_per_sec: self.peak_frames_per_sec.load(Relaxed),
            peak_bytes_per_sec: self.peak_bytes_per_sec.load(Relaxed),
        }
    }

    /// Starts a new counter epoch.
    pub fn reset(&self) {
        self.frames_rx.store(0, Relaxed);
        self.bytes_rx.store(0, Relaxed);
        self.frames_tx.store(0, Relaxed);
        self.bytes_tx.store(0, Relaxed);
        self.drops_at_100.store(0, Relaxed);
        self.drops_at_95.store(0, Relaxed);
        self.drops_at_90.store(0, Relaxed);
        self.drops_under_90.store(0, Relaxed);
        self.queue_full_drops.store(0, Relaxed);
        self.consecutive_drops.store(0, Relaxed);
        self.consecutive_drops_high_water.store(0, Relaxed);
        self.accounting_anomalies.store(0, Relaxed);
        self.mutex_waits.store(0, Relaxed);
        self.mutex_wait_us.store(0, Relaxed);
        self.in_use_high_water.store(0, Relaxed);
        self.in_use_high_water_ts_us.store(0, Relaxed);
        self.peak_frames_per_sec.store(0, Relaxed);
        self.peak_bytes_per_sec.store(0, Relaxed);
    }
}

/// Point-in-time copy of [`BusStats`], suitable for the monitoring surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStatsSnapshot {
    pub frames_rx: u64,
    pub bytes_rx: u64,
    pub frames_tx: u64,
    pub bytes_tx: u64,
    pub drops: DropBuckets,
    pub queue_full_drops: u64,
    pub consecutive_drops: u64,
    pub consecutive_drops_high_water: u64,
    pub accounting_anomalies: u64,
    pub mutex_waits: u64,
    pub mutex_wait_us: u64,
    pub in_use_high_water: u64,
    pub in_use_high_water_ts_us: u64,
    pub peak_frames_per_sec: u64,
    pub peak_bytes_per_sec: u64,
}

/// Counters owned by the single consumer thread.
#[derive(Debug)]
pub struct ConsumerStats {
    batches: AtomicU64,
    frames: AtomicU64,
    cycle_count: AtomicU64,
    cycle_us_total: AtomicU64,
    cycle_us_min: AtomicU64,
    cycle_us_max: AtomicU64,
    frames_unmapped: AtomicU64,
    mux_misses: AtomicU64,
    decode_errors: AtomicU64,
    decode_panics: AtomicU64,
    store_full: AtomicU64,
    shutdown_drops: AtomicU64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self {
            batches: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            cycle_count: AtomicU64::new(0),
            cycle_us_total: AtomicU64::new(0),
            cycle_us_min: AtomicU64::new(u64::MAX),
            cycle_us_max: AtomicU64::new(0),
            frames_unmapped: AtomicU64::new(0),
            mux_misses: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            decode_panics: AtomicU64::new(0),
            store_full: AtomicU64::new(0),
            shutdown_drops: AtomicU64::new(0),
        }
    }

    /// Records one non-empty processing cycle.
    pub fn record_cycle(&self, elapsed_us: u64, frames: u64) {
        self.batches.fetch_add(1, Relaxed);
        self.frames.fetch_add(frames, Relaxed);
        self.cycle_count.fetch_add(1, Relaxed);
        self.cycle_us_total.fetch_add(elapsed_us, Relaxed);
        self.cycle_us_min.fetch_min(elapsed_us, Relaxed);
        self.cycle_us_max.fetch_max(elapsed_us, Relaxed);
    }

    #[inline]
    pub fn record_unmapped(&self) {
        self.frames_unmapped.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn record_mux_miss(&self) {
        self.mux_misses.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn record_decode_panic(&self) {
        self.decode_panics.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn record_store_full(&self) {
        self.store_full.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn record_shutdown_drop(&self) {
        self.shutdown_drops.fetch_add(1, Relaxed);
    }

    /// Relaxed snapshot; `cycle_us_min` reads 0 before the first cycle.
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        let count = self.cycle_count.load(Relaxed);
        let total = self.cycle_us_total.load(Relaxed);
        let min = self.cycle_us_min.load(Relaxed);
        ConsumerStatsSnapshot {
            batches: self.batches.load(Relaxed),
            frames: self.frames.load(Relaxed),
            cycle_count: count,
            cycle_us_total: total,
            cycle_us_min: if min == u64::MAX { 0 } else { min },
            cycle_us_max: self.cycle_us_max.load(Relaxed),
            cycle_us_avg: if count == 0 { 0 } else { total / count },
            frames_unmapped: self.frames_unmapped.load(Relaxed),
            mux_misses: self.mux_misses.load(Relaxed),
            decode_errors: self.decode_errors.load(Relaxed),
            decode_panics: self.decode_panics.load(Relaxed),
            store_full: self.store_full.load(Relaxed),
            shutdown_drops: self.shutdown_drops.load(Relaxed),
        }
    }

    /// Starts a new counter epoch.
    pub fn reset(&self) {
        self.batches.store(0, Relaxed);
        self.frames.store(0, Relaxed);
        self.cycle_count.store(0, Relaxed);
        self.cycle_us_total.store(0, Relaxed);
        self.cycle_us_min.store(u64::MAX, Relaxed);
        self.cycle_us_max.store(0, Relaxed);
        self.frames_unmapped.store(0, Relaxed);
        self.mux_misses.store(0, Relaxed);
        self.decode_errors.store(0, Relaxed);
        self.decode_panics.store(0, Relaxed);
        self.store_full.store(0, Relaxed);
        self.shutdown_drops.store(0, Relaxed);
    }
}

impl Default for ConsumerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub batches: u64,
    pub frames: u64,
    pub cycle_count: u64,
    pub cycle_us_total: u64,
    pub cycle_us_min: u64,
    pub cycle_us_max: u64,
    pub cycle_us_avg: u64,
    pub frames_unmapped: u64,
    pub mux_misses: u64,
    pub decode_errors: u64,
    pub decode_panics: u64,
    pub store_full: u64,
    pub shutdown_drops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_buckets_inclusive_lower_edge() {
        let stats = BusStats::new();
        stats.record_drop(100);
        stats.record_drop(112); // exhausted pool reported past 100
        stats.record_drop(99);
        stats.record_drop(95);
        stats.record_drop(94);
        stats.record_drop(90);
        stats.record_drop(42);

        let snap = stats.snapshot();
        assert_eq!(snap.drops.at_100, 2);
        assert_eq!(snap.drops.at_95, 2);
        assert_eq!(snap.drops.at_90, 2);
        assert_eq!(snap.drops.under_90, 1);
        assert_eq!(snap.drops.total(), 7);
    }

    #[test]
    fn test_consecutive_drop_streak() {
        let stats = BusStats::new();
        for _ in 0..5 {
            stats.record_drop(100);
        }
        assert_eq!(stats.snapshot().consecutive_drops, 5);

        stats.note_alloc_success();
        let snap = stats.snapshot();
        assert_eq!(snap.consecutive_drops, 0);
        assert_eq!(snap.consecutive_drops_high_water, 5);
    }

    #[test]
    fn test_cycle_min_max_avg() {
        let stats = ConsumerStats::new();
        stats.record_cycle(10, 3);
        stats.record_cycle(30, 5);
        stats.record_cycle(20, 2);

        let snap = stats.snapshot();
        assert_eq!(snap.cycle_us_min, 10);
        assert_eq!(snap.cycle_us_max, 30);
        assert_eq!(snap.cycle_us_avg, 20);
        assert_eq!(snap.frames, 10);
    }

    #[test]
    fn test_reset_starts_new_epoch() {
        let stats = BusStats::new();
        stats.record_rx(8);
        stats.record_drop(100);
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap, BusStatsSnapshot::default());

        let consumer = ConsumerStats::new();
        consumer.record_cycle(5, 1);
        consumer.reset();
        assert_eq!(consumer.snapshot().cycle_us_min, 0);
    }
}
