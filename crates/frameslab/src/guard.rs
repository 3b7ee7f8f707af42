use crate::pool::FramePool;
use crate::queue::{HandleQueue, QueueFullError};
use crate::{BusTag, Frame, SlotHandle};

/// An allocated slot that frees itself on every path except a successful
/// queue commit.
///
/// The producer contract is `alloc → fill → enqueue`, and the slot must
/// return to its source pool on *any* failure between the first and last
/// step — not just on a specific error code. Wrapping the allocation in a
/// guard makes that unconditional: [`commit_into`](Self::commit_into)
/// transfers ownership to the queue on success and frees immediately on a
/// full queue, and `Drop` covers early returns and panics in between.
///
/// # Example
///
/// ```ignore
/// let guard = pool.alloc_guarded()?;
/// guard.fill(frame);
/// guard.commit_into(&queue)?; // slot freed here if the queue is full
/// ```
#[must_use = "an uncommitted guard frees its slot on drop"]
pub struct SlotGuard<'a> {
    pool: &'a FramePool,
    handle: Option<SlotHandle>,
}

impl<'a> SlotGuard<'a> {
    pub(crate) fn new(pool: &'a FramePool, handle: SlotHandle) -> Self {
        Self {
            pool,
            handle: Some(handle),
        }
    }

    /// The bus of the underlying slot.
    #[inline]
    pub fn bus(&self) -> BusTag {
        self.pool.bus()
    }

    /// Writes `frame` into the guarded slot.
    pub fn fill(&self, frame: Frame) {
        if let Some(handle) = &self.handle {
            self.pool.fill(handle, frame);
        }
    }

    /// Hands the slot to the queue.
    ///
    /// On success the queue owns the handle and nothing is freed here. On a
    /// full queue the slot is freed back to its source pool before the
    /// error is returned, regardless of why the enqueue failed.
    pub fn commit_into<Q: HandleQueue + ?Sized>(mut self, queue: &Q) -> Result<(), QueueFullError> {
        let handle = self
            .handle
            .take()
            .expect("guard holds its handle until committed");
        match queue.enqueue(handle) {
            Ok(()) => Ok(()),
            Err(handle) => {
                // Unconditional: the pool gets the slot back on any non-ok
                // result. The free can only fail for a forged handle.
                let _ = self.pool.free(handle);
                Err(QueueFullError)
            }
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.pool.free(handle);
        }
    }
}
