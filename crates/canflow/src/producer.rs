//! Producer-side ingest contract.
//!
//! Every producer — hardware callback, Ethernet server, replay — funnels
//! through [`BusIngress::ingest`]: allocate a slot in the bus's pool, fill
//! it, hand it to the unified queue. The slot guard makes the freeing
//! contract unconditional: any failure after allocation returns the slot to
//! its source pool before `ingest` returns, and the drop is recorded in the
//! bus's counters at the fill level observed.

use frameslab::{BusTag, Frame, FramePool, HandleQueue, UnifiedQueue};
use std::sync::Arc;

/// Shared ingest endpoint for one bus.
///
/// Cheap to clone; hardware callbacks and the server thread each hold one.
#[derive(Clone)]
pub struct BusIngress {
    pool: Arc<FramePool>,
    queue: Arc<UnifiedQueue>,
}

impl BusIngress {
    pub fn new(pool: Arc<FramePool>, queue: Arc<UnifiedQueue>) -> Self {
        Self { pool, queue }
    }

    /// The bus this ingress feeds.
    pub fn bus(&self) -> BusTag {
        self.pool.bus()
    }

    /// Ingests one raw frame. Returns `true` if it was handed to the
    /// consumer, `false` if it was dropped (and counted).
    ///
    /// Within one producer thread, successful ingests preserve arrival
    /// order into the unified queue.
    pub fn ingest(&self, can_id: u32, data: &[u8], timestamp_us: u64) -> bool {
        self.ingest_via(self.queue.as_ref(), can_id, data, timestamp_us)
    }

    /// [`ingest`](Self::ingest) against an explicit queue seam; lets tests
    /// inject enqueue failures.
    pub fn ingest_via<Q: HandleQueue + ?Sized>(
        &self,
        queue: &Q,
        can_id: u32,
        data: &[u8],
        timestamp_us: u64,
    ) -> bool {
        let stats = self.pool.stats();
        stats.record_rx(data.len() as u64);

        let guard = match self.pool.alloc_guarded() {
            Ok(guard) => guard,
            Err(_) => {
                // Exhaustion means 100 % fill by definition.
                stats.record_drop(100);
                return false;
            }
        };

        guard.fill(Frame::new(self.pool.bus(), can_id, data, timestamp_us));

        match guard.commit_into(queue) {
            Ok(()) => true,
            Err(_) => {
                // The guard already freed the slot; account for the drop at
                // the fill the pool is actually at.
                stats.record_queue_full_drop(self.pool.fill_percent());
                false
            }
        }
    }
}

impl std::fmt::Debug for BusIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusIngress")
            .field("bus", &self.bus())
            .finish_non_exhaustive()
    }
}

/// A recorded frame for replay feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRecord {
    pub can_id: u32,
    pub dlc: u8,
    pub payload: [u8; frameslab::MAX_DLC],
    /// Offset from the start of the recording, microseconds.
    pub offset_us: u64,
}

impl ReplayRecord {
    pub fn new(can_id: u32, data: &[u8], offset_us: u64) -> Self {
        assert!(data.len() <= frameslab::MAX_DLC);
        let mut payload = [0u8; frameslab::MAX_DLC];
        payload[..data.len()].copy_from_slice(data);
        Self {
            can_id,
            dlc: data.len() as u8,
            payload,
            offset_us,
        }
    }
}

/// Feeds a recorded frame sequence through the normal ingest contract.
///
/// The optional fourth producer: used by the demo binary and by soak tests
/// to drive the pipeline without hardware.
#[derive(Debug)]
pub struct ReplayProducer {
    ingress: BusIngress,
    records: Vec<ReplayRecord>,
}

impl ReplayProducer {
    pub fn new(ingress: BusIngress, records: Vec<ReplayRecord>) -> Self {
        Self { ingress, records }
    }

    /// Replays every record back-to-back (no pacing). Returns how many
    /// frames were accepted.
    pub fn run(&self) -> usize {
        let mut accepted = 0;
        for rec in &self.records {
            let data = &rec.payload[..usize::from(rec.dlc)];
            if self
                .ingress
                .ingest(rec.can_id, data, frameslab::monotonic_us())
            {
                accepted += 1;
            }
        }
        accepted
    }
}
