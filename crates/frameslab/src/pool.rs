use crate::guard::SlotGuard;
use crate::invariants::{debug_assert_free_count, debug_assert_handle_in_range};
use crate::logq::{Level, LogQueue};
use crate::stats::BusStats;
use crate::{BusTag, Frame, SlotHandle};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;

// =============================================================================
// OWNERSHIP & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// The pool is a fixed slab of `Frame` slots plus bookkeeping. The two halves
// are synchronized differently:
//
// ## Bookkeeping (under the pool mutex)
//
// `in_use[]`, `free_count` and the circular allocation hint are only touched
// inside `alloc`/`free` critical sections. The mutex is held for a bounded
// scan, never across I/O or a suspension point.
//
// ## Slot contents (no lock)
//
// Frame bytes are read and written through `UnsafeCell` WITHOUT holding the
// mutex. This is sound because of the handle protocol:
//
// - `alloc` marks a slot in-use and hands out the only `SlotHandle` for it.
//   `SlotHandle` is neither `Copy` nor `Clone`, so exactly one owner exists
//   until `free` consumes the handle.
// - The producer writes the frame while holding the handle, then transfers
//   the handle through the unified queue. The queue's release/acquire cell
//   protocol publishes the frame bytes to the consumer.
// - Slot reuse after `free` is ordered by the pool mutex: the freeing
//   thread's critical section happens-before the next `alloc` of that slot.
//
// ## Self-healing free count
//
// `free_count` is an optimization over scanning `in_use[]`; the bitmap is
// authoritative. When the counter claims exhaustion, `alloc` rescans the
// bitmap before failing, corrects any drift, and counts the anomaly so a
// genuine bookkeeping bug stays visible in the monitoring surface.
//
// =============================================================================

/// Errors raised by pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every slot is in use; the caller records the drop and moves on.
    #[error("frame pool exhausted")]
    Exhausted,
    /// The handle was minted by a different pool.
    #[error("handle belongs to bus {handle_bus}, pool is bus {pool_bus}")]
    ForeignHandle { handle_bus: u8, pool_bus: u8 },
    /// The slot is already free; a second `free` on the same handle.
    #[error("slot {index} is not in use")]
    SlotNotInUse { index: u32 },
}

struct Bookkeeping {
    in_use: Box<[bool]>,
    free_count: usize,
    /// Circular hint for the next first-free scan.
    alloc_hint: usize,
    /// Lifetime allocation/free totals; allocated ≥ freed always, equal
    /// exactly when no slot is in flight.
    total_allocated: u64,
    total_freed: u64,
}

/// Fixed-capacity slab of frame slots for one CAN bus.
///
/// Constructed once at startup, never resized. `alloc` is O(1) amortized
/// under light load (the hint points just past the last allocation) and
/// O(capacity) worst case, which is acceptable because capacity is bounded
/// and lock contention dominates the real cost.
pub struct FramePool {
    bus: BusTag,
    slots: Box<[UnsafeCell<Frame>]>,
    state: CachePadded<Mutex<Bookkeeping>>,
    /// Lock-free mirror of slots-in-use, for fill queries off the hot lock.
    occupancy: CachePadded<AtomicUsize>,
    stats: Arc<BusStats>,
    log: Arc<LogQueue>,
}

// SAFETY: slot contents are `Copy` data reachable only through the unique
// `SlotHandle` protocol described in the header; bookkeeping is behind a
// mutex. No interior reference ever escapes the pool.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Creates a pool of `capacity` zeroed slots for `bus`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or its slot indices would not fit the
    /// handle's 32-bit index space.
    pub fn new(bus: BusTag, capacity: usize, stats: Arc<BusStats>, log: Arc<LogQueue>) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");
        assert!(capacity <= u32::MAX as usize, "pool capacity exceeds handle index space");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(Frame::default()));

        Self {
            bus,
            slots: slots.into_boxed_slice(),
            state: CachePadded::new(Mutex::new(Bookkeeping {
                in_use: vec![false; capacity].into_boxed_slice(),
                free_count: capacity,
                alloc_hint: 0,
                total_allocated: 0,
                total_freed: 0,
            })),
            occupancy: CachePadded::new(AtomicUsize::new(0)),
            stats,
            log,
        }
    }

    /// The bus whose frames this pool stores.
    #[inline]
    pub fn bus(&self) -> BusTag {
        self.bus
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently allocated (lock-free approximation).
    #[inline]
    pub fn in_use(&self) -> usize {
        self.occupancy.load(Ordering::Relaxed)
    }

    /// Current fill as a percentage, 0–100.
    #[inline]
    pub fn fill_percent(&self) -> u64 {
        (self.in_use() as u64 * 100) / self.capacity() as u64
    }

    /// Exact free-slot count (takes the pool lock).
    pub fn free_count(&self) -> usize {
        self.lock_timed().free_count
    }

    /// This pool's statistics block.
    #[inline]
    pub fn stats(&self) -> &Arc<BusStats> {
        &self.stats
    }

    // ---------------------------------------------------------------------
    // ALLOC / FREE
    // ---------------------------------------------------------------------

    /// Allocates a slot, scanning circularly from the allocation hint.
    ///
    /// When the free counter claims exhaustion the bitmap is rescanned
    /// first; drift is corrected, counted, and logged, and the allocation
    /// proceeds. Only a confirmed-full bitmap returns [`PoolError::Exhausted`].
    pub fn alloc(&self) -> Result<SlotHandle, PoolError> {
        let mut state = self.lock_timed();

        if state.free_count == 0 {
            let actually_free = state.in_use.iter().filter(|u| !**u).count();
            if actually_free == 0 {
                return Err(PoolError::Exhausted);
            }
            state.free_count = actually_free;
            self.heal_logged(actually_free);
        }

        let capacity = self.capacity();
        for step in 0..capacity {
            let idx = (state.alloc_hint + step) % capacity;
            if !state.in_use[idx] {
                state.in_use[idx] = true;
                state.free_count -= 1;
                state.alloc_hint = (idx + 1) % capacity;
                state.total_allocated += 1;
                debug_assert_free_count!(state.free_count, state.in_use);

                let in_use_now = capacity - state.free_count;
                self.occupancy.store(in_use_now, Ordering::Relaxed);
                self.stats.record_occupancy(in_use_now as u64);
                self.stats.note_alloc_success();
                return Ok(SlotHandle::new(self.bus, idx as u32));
            }
        }

        // The counter promised a free slot the bitmap does not have. The
        // bitmap is authoritative; heal the counter downward and fail.
        state.free_count = 0;
        self.heal_logged(0);
        Err(PoolError::Exhausted)
    }

    /// [`alloc`](Self::alloc) wrapped in a guard that frees the slot on
    /// every exit path except a successful queue commit.
    pub fn alloc_guarded(&self) -> Result<SlotGuard<'_>, PoolError> {
        self.alloc().map(|handle| SlotGuard::new(self, handle))
    }

    /// Returns a slot to the pool, consuming its handle.
    pub fn free(&self, handle: SlotHandle) -> Result<(), PoolError> {
        if handle.bus() != self.bus {
            return Err(PoolError::ForeignHandle {
                handle_bus: handle.bus().raw(),
                pool_bus: self.bus.raw(),
            });
        }
        let idx = handle.index() as usize;
        debug_assert_handle_in_range!(idx, self.capacity());

        let mut state = self.lock_timed();
        if !state.in_use[idx] {
            return Err(PoolError::SlotNotInUse {
                index: handle.index(),
            });
        }
        state.in_use[idx] = false;
        state.free_count += 1;
        state.total_freed += 1;
        debug_assert!(
            state.total_allocated >= state.total_freed,
            "freed more slots than were ever allocated"
        );
        debug_assert_free_count!(state.free_count, state.in_use);
        self.occupancy
            .store(self.capacity() - state.free_count, Ordering::Relaxed);
        Ok(())
    }

    /// Lifetime `(allocated, freed)` totals. Allocated is never below
    /// freed; the two are equal exactly when no slot is in flight.
    pub fn totals(&self) -> (u64, u64) {
        let state = self.lock_timed();
        (state.total_allocated, state.total_freed)
    }

    // ---------------------------------------------------------------------
    // SLOT ACCESS
    // ---------------------------------------------------------------------

    /// Writes `frame` into the slot named by `handle`.
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to another pool; that is a pipeline
    /// wiring bug, not a runtime condition.
    pub fn fill(&self, handle: &SlotHandle, frame: Frame) {
        assert_eq!(handle.bus(), self.bus, "handle filled against wrong pool");
        let idx = handle.index() as usize;
        debug_assert_handle_in_range!(idx, self.capacity());

        // SAFETY: `handle` is the unique reference to this in-use slot (see
        // module header); no other thread reads or writes the cell until
        // the handle is transferred or freed.
        unsafe {
            *self.slots[idx].get() = frame;
        }
    }

    /// Copies the frame out of the slot named by `handle`.
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to another pool.
    pub fn frame(&self, handle: &SlotHandle) -> Frame {
        assert_eq!(handle.bus(), self.bus, "handle read against wrong pool");
        let idx = handle.index() as usize;
        debug_assert_handle_in_range!(idx, self.capacity());

        // SAFETY: same unique-handle argument as `fill`; the queue's
        // release/acquire handoff ordered the producer's write before this
        // read.
        unsafe { *self.slots[idx].get() }
    }

    // ---------------------------------------------------------------------
    // INTERNAL
    // ---------------------------------------------------------------------

    fn heal_logged(&self, recovered: usize) {
        self.stats.record_accounting_anomaly();
        self.log.enqueue(
            Level::Warn,
            &format!(
                "{}: free_count drift healed, {recovered} slot(s) actually free",
                self.bus
            ),
        );
    }

    /// Uncontended acquisitions take the `try_lock` fast path; contended
    /// ones are timed into the bus's mutex-wait counters.
    fn lock_timed(&self) -> MutexGuard<'_, Bookkeeping> {
        if let Ok(guard) = self.state.try_lock() {
            return guard;
        }
        let start = Instant::now();
        // A poisoned pool lock still guards a consistent bitmap; the
        // self-heal path covers any torn counter.
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.stats
            .record_mutex_wait(start.elapsed().as_micros() as u64);
        guard
    }

    /// Test hook: corrupts the free counter to exercise self-healing.
    #[cfg(test)]
    pub(crate) fn clobber_free_count(&self, value: usize) {
        self.lock_timed().free_count = value;
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("bus", &self.bus)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logq::MemorySink;

    fn pool(capacity: usize) -> FramePool {
        FramePool::new(
            BusTag::CAN0,
            capacity,
            Arc::new(BusStats::new()),
            Arc::new(LogQueue::new(64)),
        )
    }

    #[test]
    fn test_alloc_free_cycle() {
        let p = pool(4);
        assert_eq!(p.free_count(), 4);

        let h = p.alloc().unwrap();
        assert_eq!(p.free_count(), 3);
        assert_eq!(p.in_use(), 1);

        p.fill(&h, Frame::new(BusTag::CAN0, 0x42, &[1, 2, 3], 7));
        let f = p.frame(&h);
        assert_eq!(f.can_id, 0x42);
        assert_eq!(f.data(), &[1, 2, 3]);

        p.free(h).unwrap();
        assert_eq!(p.free_count(), 4);
        assert_eq!(p.in_use(), 0);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let p = pool(3);
        let handles: Vec<_> = (0..3).map(|_| p.alloc().unwrap()).collect();
        assert_eq!(p.alloc().unwrap_err(), PoolError::Exhausted);
        assert_eq!(p.fill_percent(), 100);

        for h in handles {
            p.free(h).unwrap();
        }
        assert_eq!(p.free_count(), 3);
        assert!(p.alloc().is_ok());
        // True exhaustion is not an accounting anomaly.
        assert_eq!(p.stats().snapshot().accounting_anomalies, 0);
    }

    #[test]
    fn test_alloc_hint_advances_circularly() {
        let p = pool(4);
        let a = p.alloc().unwrap();
        let b = p.alloc().unwrap();
        assert_ne!(a.index(), b.index());

        let a_idx = a.index();
        p.free(a).unwrap();
        // The hint points past `b`; the scan reaches slot a only after
        // wrapping past the end of the slab.
        let c = p.alloc().unwrap();
        let d = p.alloc().unwrap();
        let e = p.alloc().unwrap();
        assert_ne!(c.index(), a_idx);
        assert_ne!(d.index(), a_idx);
        assert_eq!(e.index(), a_idx);
        assert_eq!(p.free_count(), 0);
        drop((b, c, d, e));
    }

    #[test]
    fn test_double_free_rejected() {
        let p = pool(2);
        let h = p.alloc().unwrap();
        let forged = h.duplicate();
        p.free(h).unwrap();
        assert_eq!(
            p.free(forged).unwrap_err(),
            PoolError::SlotNotInUse { index: 0 }
        );
        // The failed free must not inflate the counter.
        assert_eq!(p.free_count(), 2);
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let p0 = pool(2);
        let p1 = FramePool::new(
            BusTag::CAN1,
            2,
            Arc::new(BusStats::new()),
            Arc::new(LogQueue::new(16)),
        );
        let h = p0.alloc().unwrap();
        assert_eq!(
            p1.free(h).unwrap_err(),
            PoolError::ForeignHandle {
                handle_bus: 0,
                pool_bus: 1
            }
        );
    }

    #[test]
    fn test_self_heal_from_clobbered_free_count() {
        // Scenario: accounting corruption claims exhaustion while every
        // slot is actually free.
        let log = Arc::new(LogQueue::new(64));
        let stats = Arc::new(BusStats::new());
        let p = FramePool::new(BusTag::CAN0, 8, Arc::clone(&stats), Arc::clone(&log));

        p.clobber_free_count(0);
        let h = p.alloc().expect("self-heal must allow the allocation");
        assert_eq!(p.free_count(), 7);
        assert_eq!(stats.snapshot().accounting_anomalies, 1);

        let mut sink = MemorySink::default();
        log.flush(10, 200_000, &mut sink);
        assert!(sink.lines.iter().any(|(level, line)| {
            *level == Level::Warn && line.contains("free_count drift healed")
        }));

        p.free(h).unwrap();
        assert_eq!(p.free_count(), 8);
    }

    #[test]
    fn test_heal_downward_when_counter_overstates() {
        let p = pool(2);
        let _a = p.alloc().unwrap();
        let _b = p.alloc().unwrap();
        // Counter claims a free slot that the bitmap does not have.
        p.clobber_free_count(1);
        assert_eq!(p.alloc().unwrap_err(), PoolError::Exhausted);
        assert_eq!(p.free_count(), 0);
        assert_eq!(p.stats().snapshot().accounting_anomalies, 1);
    }

    #[test]
    fn test_occupancy_high_water_tracked() {
        let p = pool(4);
        let a = p.alloc().unwrap();
        let b = p.alloc().unwrap();
        let c = p.alloc().unwrap();
        p.free(b).unwrap();
        p.free(a).unwrap();
        p.free(c).unwrap();
        assert_eq!(p.stats().snapshot().in_use_high_water, 3);
    }

    #[test]
    fn test_concurrent_alloc_free_conserves_slots() {
        use std::thread;

        let p = Arc::new(pool(64));
        let mut workers = vec![];
        for _ in 0..4 {
            let p = Arc::clone(&p);
            workers.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    if let Ok(h) = p.alloc() {
                        p.fill(&h, Frame::default());
                        p.free(h).unwrap();
                    }
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(p.free_count(), 64);
        assert_eq!(p.in_use(), 0);
        assert_eq!(p.stats().snapshot().accounting_anomalies, 0);
    }
}
