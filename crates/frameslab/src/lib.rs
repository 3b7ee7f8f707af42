//! Frame slot pools and the unified work queue for a CAN telematics gateway.
//!
//! This crate is the concurrency core of the gateway's ingest data plane.
//! It owns four pieces:
//!
//! - **Per-bus ring-buffer pools** ([`FramePool`]): fixed slabs of frame
//!   slots with `free_count` accounting and a self-healing allocator that
//!   recovers from counter drift instead of wedging the bus.
//! - **The unified work queue** ([`UnifiedQueue`]): a bounded MPSC queue of
//!   slot handles carrying frames from every producer to the single
//!   consumer thread.
//! - **Slot handles and commit guards** ([`SlotHandle`], [`SlotGuard`]):
//!   a non-clonable handle models the slot's single-owner lifecycle, and
//!   the guard frees the slot on every path that does not end in a
//!   successful enqueue.
//! - **Per-bus statistics and the async log queue** ([`BusStats`],
//!   [`LogQueue`]): relaxed-atomic counters for the monitoring surface and
//!   a bounded log ring so no producer ever blocks on console I/O.
//!
//! # Slot lifecycle
//!
//! ```text
//! FramePool::alloc_guarded ── fill ── commit_into(queue) ──► UnifiedQueue
//!        ▲                                                        │
//!        └──────────────── FramePool::free ◄── consumer ◄─ dequeue_batch
//! ```
//!
//! A handle is always in exactly one place: inside its pool marked free,
//! held by a producer guard, inside a queue cell, or held by the consumer.
//! Every error path between `alloc` and a successful enqueue returns the
//! slot to its source pool before the producer returns.

mod frame;
mod guard;
mod handle;
mod invariants;
mod logq;
mod pool;
mod queue;
mod stats;
mod time;

pub use frame::{BusTag, Frame, CAN_EFF_FLAG, CAN_ID_MASK, MAX_DLC};
pub use guard::SlotGuard;
pub use handle::SlotHandle;
pub use logq::{Level, LogQueue, LogSink, MemorySink, StdoutSink, MAX_LOG_LINE};
pub use pool::{FramePool, PoolError};
pub use queue::{HandleQueue, QueueFullError, UnifiedQueue};
pub use stats::{
    BusStats, BusStatsSnapshot, ConsumerStats, ConsumerStatsSnapshot, DropBuckets,
};
pub use time::monotonic_us;
