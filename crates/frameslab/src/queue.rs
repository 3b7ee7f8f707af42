use crate::invariants::debug_assert_cursor_advances;
use crate::SlotHandle;
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Bounded MPSC queue of slot handles, using per-cell sequence numbers.
// Every cell carries a `seq` that encodes which lap of the ring it is on:
//
// - `seq == pos`            the cell is empty and owned by the producer
//                           whose CAS claims `tail == pos`.
// - `seq == pos + 1`        the cell holds a handle and is ready for the
//                           consumer at `head == pos`.
// - `seq == pos + capacity` the cell has been consumed and waits for the
//                           producer one lap ahead.
//
// ## Producer (enqueue)
//
// 1. Load `tail` (Relaxed) and the target cell's `seq` (Acquire).
// 2. `seq == tail`: CAS `tail -> tail + 1` (Relaxed). The CAS only claims
//    the cell; it publishes nothing.
// 3. Write the handle into the cell, then store `seq = tail + 1` (Release).
//    This store is what publishes the handle — and, transitively, the frame
//    bytes the producer wrote into the pool slot before enqueueing.
// 4. `seq < tail`: the cell still holds an unconsumed handle from the
//    previous lap — the queue is full. Ownership of the handle goes back to
//    the caller via `Err(handle)`.
//
// ## Consumer (dequeue_batch)
//
// Single-consumer: `head` has exactly one writer, so it needs no CAS. For
// each cell with `seq == head + 1` (Acquire), move the handle out and store
// `seq = head + capacity` (Release) to hand the cell to the next lap's
// producer.
//
// Cursors are unbounded `usize` sequence numbers; the buffer index is
// `pos & mask`. At ingest rates this cannot wrap within the gateway's
// uptime on 64-bit targets.
//
// =============================================================================

/// The queue rejected a handle because every cell was occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unified work queue is full")]
pub struct QueueFullError;

/// Enqueue seam between producers and the unified queue.
///
/// The trait exists so the producer contract can be exercised against a
/// fault-injecting queue in tests; production code only ever sees
/// [`UnifiedQueue`]. A rejected enqueue returns the handle to the caller —
/// ownership is never silently dropped.
pub trait HandleQueue {
    /// Attempts to enqueue; gives the handle back on a full queue.
    fn enqueue(&self, handle: SlotHandle) -> Result<(), SlotHandle>;
}

struct Cell {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<SlotHandle>>,
}

/// Bounded MPSC queue carrying slot handles from all producers to the
/// single consumer thread.
///
/// Carries only handles, never frame copies. `enqueue` is wait-free in the
/// common case (one CAS on the tail); `dequeue_batch` takes no CAS at all.
pub struct UnifiedQueue {
    cells: Box<[Cell]>,
    mask: usize,
    tail: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
    depth_high_water: AtomicUsize,
}

// SAFETY: cells are accessed under the sequence protocol above; a handle is
// visible to exactly one thread at a time.
unsafe impl Send for UnifiedQueue {}
unsafe impl Sync for UnifiedQueue {}

impl UnifiedQueue {
    /// Creates a queue with at least `min_capacity` cells, rounded up to
    /// the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if `min_capacity` is zero.
    pub fn new(min_capacity: usize) -> Self {
        assert!(min_capacity > 0, "queue capacity must be non-zero");
        let capacity = min_capacity.next_power_of_two();

        let mut cells = Vec::with_capacity(capacity);
        for i in 0..capacity {
            cells.push(Cell {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }

        Self {
            cells: cells.into_boxed_slice(),
            mask: capacity - 1,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            depth_high_water: AtomicUsize::new(0),
        }
    }

    /// Actual cell count (the requested minimum rounded up to a power of two).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Approximate number of queued handles, consistent within one
    /// producer's view.
    #[inline]
    pub fn depth(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    /// Deepest the queue has been since startup or the last reset.
    #[inline]
    pub fn depth_high_water(&self) -> usize {
        self.depth_high_water.load(Ordering::Relaxed)
    }

    /// Clears the depth high-water mark (stats epoch reset).
    pub fn reset_high_water(&self) {
        self.depth_high_water.store(0, Ordering::Relaxed);
    }

    /// Pulls up to `max` handles, appending to `out`. Returns the number
    /// pulled. Never blocks and never spins.
    ///
    /// Single-consumer: must only be called from the consumer thread.
    pub fn dequeue_batch(&self, max: usize, out: &mut Vec<SlotHandle>) -> usize {
        let start = self.head.load(Ordering::Relaxed);
        let mut head = start;
        let mut pulled = 0;

        while pulled < max {
            let cell = &self.cells[head & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            if seq != head.wrapping_add(1) {
                // Empty (or a producer mid-write); stop the batch here.
                break;
            }

            // SAFETY: seq == head + 1 means the producer's Release store
            // published a fully written handle, and only this consumer
            // thread reads cells at `head`.
            let handle = unsafe { (*cell.value.get()).assume_init_read() };
            cell.seq
                .store(head.wrapping_add(self.mask + 1), Ordering::Release);
            out.push(handle);
            head = head.wrapping_add(1);
            pulled += 1;
        }

        if pulled > 0 {
            debug_assert_cursor_advances!("head", start, head);
            // Producers learn about freed cells through the per-cell seq
            // stores above; head itself is consumer-private.
            self.head.store(head, Ordering::Relaxed);
        }
        pulled
    }
}

impl HandleQueue for UnifiedQueue {
    fn enqueue(&self, handle: SlotHandle) -> Result<(), SlotHandle> {
        let backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let cell = &self.cells[tail & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);

            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this producer exclusive
                        // ownership of the cell for this lap.
                        unsafe {
                            (*cell.value.get()).write(handle);
                        }
                        cell.seq.store(tail.wrapping_add(1), Ordering::Release);

                        let depth = tail
                            .wrapping_add(1)
                            .saturating_sub(self.head.load(Ordering::Relaxed));
                        self.depth_high_water.fetch_max(depth, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(current) => {
                        tail = current;
                        backoff.spin();
                    }
                }
            } else if seq.wrapping_sub(tail) as isize > 0 {
                // Another producer claimed this cell and moved on; retry at
                // the fresh tail.
                tail = self.tail.load(Ordering::Relaxed);
            } else {
                // Cell still holds last lap's handle: full.
                return Err(handle);
            }
        }
    }
}

impl Drop for UnifiedQueue {
    fn drop(&mut self) {
        // Drop any handles still queued; their pools are being torn down
        // with the queue at shutdown.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for pos in head..tail {
            let cell = &self.cells[pos & self.mask];
            if cell.seq.load(Ordering::Relaxed) == pos.wrapping_add(1) {
                // SAFETY: `&mut self` means no other thread touches cells;
                // seq marks this one initialized.
                unsafe {
                    (*cell.value.get()).assume_init_drop();
                }
            }
        }
    }
}

impl std::fmt::Debug for UnifiedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedQueue")
            .field("capacity", &self.capacity())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}
