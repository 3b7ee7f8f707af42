//! Downstream time-series store seam.
//!
//! The store itself is an external collaborator; the decoder only needs a
//! narrow append interface. On backpressure the decoder counts the drop and
//! keeps going — it never blocks or retries.

use std::sync::Mutex;
use thiserror::Error;

/// The store rejected a sample; the caller counts the drop and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("downstream store is full")]
pub struct StoreFull;

/// Opaque reference to one sensor series in the downstream store.
///
/// Assigned when the configuration is built; the core never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SensorHandle(pub u32);

/// Append interface consumed by the signal decoder.
///
/// Implementations must be cheap and non-blocking; the consumer thread
/// calls this on its hot path.
pub trait SampleSink: Send + Sync {
    fn append(&self, sensor: SensorHandle, value: f64, timestamp_us: u64) -> Result<(), StoreFull>;
}

/// Collects samples in memory; the test and demo store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    samples: Mutex<Vec<(SensorHandle, f64, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out everything appended so far.
    pub fn samples(&self) -> Vec<(SensorHandle, f64, u64)> {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSink for MemoryStore {
    fn append(&self, sensor: SensorHandle, value: f64, timestamp_us: u64) -> Result<(), StoreFull> {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((sensor, value, timestamp_us));
        Ok(())
    }
}

/// Discards every sample; for throughput measurement.
#[derive(Debug, Default)]
pub struct NullStore;

impl SampleSink for NullStore {
    fn append(&self, _: SensorHandle, _: f64, _: u64) -> Result<(), StoreFull> {
        Ok(())
    }
}

/// Accepts a fixed number of samples, then reports full. Exercises the
/// decoder's backpressure counting.
#[derive(Debug)]
pub struct BoundedStore {
    inner: MemoryStore,
    capacity: usize,
}

impl BoundedStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            capacity,
        }
    }

    pub fn samples(&self) -> Vec<(SensorHandle, f64, u64)> {
        self.inner.samples()
    }
}

impl SampleSink for BoundedStore {
    fn append(&self, sensor: SensorHandle, value: f64, timestamp_us: u64) -> Result<(), StoreFull> {
        if self.inner.len() >= self.capacity {
            return Err(StoreFull);
        }
        self.inner.append(sensor, value, timestamp_us)
    }
}
