//! Debug assertion macros for pool and queue bookkeeping.
//!
//! Active only in debug builds (`debug_assert!`), so there is zero overhead
//! on release hot paths. The release-mode counterpart of the free-count
//! check is the allocator's self-heal scan, which corrects drift instead of
//! aborting.

/// Assert that `free_count` matches the bitmap it summarizes.
///
/// Checked after every pool operation leaves its critical section.
macro_rules! debug_assert_free_count {
    ($free_count:expr, $in_use:expr) => {
        debug_assert_eq!(
            $free_count,
            $in_use.iter().filter(|u| !**u).count(),
            "free_count {} diverged from bitmap",
            $free_count
        )
    };
}

/// Assert that a handle's slot index addresses a real slot.
macro_rules! debug_assert_handle_in_range {
    ($index:expr, $capacity:expr) => {
        debug_assert!(
            $index < $capacity,
            "slot index {} out of range for capacity {}",
            $index,
            $capacity
        )
    };
}

/// Assert that a queue cursor only moves forward.
macro_rules! debug_assert_cursor_advances {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} cursor moved backwards: {} -> {}",
            $name,
            $old,
            $new
        )
    };
}

pub(crate) use debug_assert_cursor_advances;
pub(crate) use debug_assert_free_count;
pub(crate) use debug_assert_handle_in_range;
