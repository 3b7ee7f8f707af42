//! CAN ingest data plane for a telematics gateway.
//!
//! Builds the full frame pipeline on top of [`frameslab`]'s pools and
//! unified queue:
//!
//! - **Producers** ([`BusIngress`], [`EthernetServer`], [`ReplayProducer`]):
//!   hardware-callback ingress for the two physical controllers, a TCP
//!   server parsing PCAN or APTERA framing for a dynamic set of logical
//!   buses, and a replay feed — all sharing one alloc → fill → enqueue
//!   contract with unconditional freeing on failure.
//! - **Consumer** ([`Consumer`]): a dedicated thread that batches handles
//!   off the unified queue, routes each frame to its bus's node table,
//!   extracts signals, appends samples downstream, and returns every slot
//!   to its source pool.
//! - **Node tables** ([`NodeTable`]): immutable per-bus hash maps from CAN
//!   ID to signal descriptors, built once from configuration.
//! - **The composed core** ([`Core`], [`CoreHandle`]): `build(config)`,
//!   start/shutdown, stats snapshots, and the 1 Hz monitor tick.
//!
//! The pipeline is always live: ingest-time failures (exhausted pools, a
//! full queue, malformed wire records, unmapped IDs, store backpressure)
//! are counters on the monitoring surface, never propagated errors. Only
//! configuration problems are fatal, at build time.

pub mod config;
pub mod consumer;
pub mod decode;
pub mod framing;
pub mod nodes;
pub mod producer;
pub mod runtime;
pub mod server;
pub mod store;

pub use config::{
    BusConfig, ConfigError, CoreConfig, EthernetConfig, Framing, MuxConfig, NodeConfig,
    SignalByteOrder, SignalConfig,
};
pub use consumer::{Consumer, ConsumerTuning};
pub use framing::{Assembler, WireFrame};
pub use nodes::{NodeDescriptor, NodeTable, Signal};
pub use producer::{BusIngress, ReplayProducer, ReplayRecord};
pub use runtime::{
    BusRates, BusSnapshot, Core, CoreHandle, CoreSnapshot, MonitorTick, PoolSet, TableSet,
};
pub use server::{EthernetServer, ServerHandle, ServerStats, ServerStatsSnapshot};
pub use store::{BoundedStore, MemoryStore, NullStore, SampleSink, SensorHandle, StoreFull};
