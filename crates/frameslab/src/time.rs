use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the first call in this process.
///
/// Used for ingestion timestamps and stats high-water capture times; never
/// goes backwards and is unaffected by wall-clock adjustments.
#[inline]
pub fn monotonic_us() -> u64 {
    ANCHOR.get_or_init(Instant::now).elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }
}
