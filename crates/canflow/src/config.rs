//! Typed configuration for the ingest core.
//!
//! The persistent blob format lives outside the core; whatever parses it
//! produces this tree, and [`CoreConfig::validate`] is the only fatal error
//! path in the pipeline. Everything validated here is assumed by the hot
//! path: capacities are non-zero, signals fit in the payload word, node IDs
//! are unique per bus, mux cases are non-empty.

use crate::store::SensorHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

/// Default Ethernet CAN server address. The embedding service may replace
/// the IP with the outbound interface's current address at each start.
pub const DEFAULT_SERVER_ADDR: &str = "192.168.7.1:5555";

/// Default consumer batch size.
pub const DEFAULT_BATCH_MAX: usize = 200;
/// Default consumer sleep when the queue was empty, in microseconds.
pub const DEFAULT_IDLE_SLEEP_US: u64 = 1_000;
/// Default consumer sleep after a non-empty batch, in microseconds.
pub const DEFAULT_BUSY_SLEEP_US: u64 = 100;
/// Default shutdown drain deadline, in milliseconds.
pub const DEFAULT_DRAIN_DEADLINE_MS: u64 = 2_000;

/// Smallest accepted pool capacity. Physical buses are normally sized for
/// about one second of burst (4096+ slots); the floor only guards against
/// configurations that could not buffer a single batch.
pub const MIN_POOL_CAPACITY: usize = 16;

/// Configuration-time errors; the only fatal errors the core raises.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("bus {bus}: pool capacity {capacity} below minimum {min}")]
    PoolTooSmall {
        bus: String,
        capacity: usize,
        min: usize,
    },
    #[error("queue capacity {queue} smaller than largest pool capacity {pool}")]
    QueueTooSmall { queue: usize, pool: usize },
    #[error("bus {bus}: duplicate node for CAN id {can_id:#x}")]
    DuplicateCanId { bus: String, can_id: u32 },
    #[error("bus {bus}: node {can_id:#x} signal '{signal}' does not fit the payload word (start {start_bit}, width {width})")]
    SignalOutOfBounds {
        bus: String,
        can_id: u32,
        signal: String,
        start_bit: u8,
        width: u8,
    },
    #[error("bus {bus}: node {can_id:#x} declares a mux selector with no cases")]
    EmptyMux { bus: String, can_id: u32 },
    #[error("bus {bus}: node {can_id:#x} has neither signals nor a mux selector")]
    EmptyNode { bus: String, can_id: u32 },
    #[error("invalid server address '{addr}'")]
    BadServerAddr { addr: String },
    #[error("batch size must be non-zero")]
    ZeroBatch,
}

/// Byte order of a signal's bit field inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalByteOrder {
    /// Intel: `start_bit` is the field's least-significant bit in the
    /// little-endian payload word.
    LittleEndian,
    /// Motorola: `start_bit` counts from the most-significant bit of
    /// payload byte 0 in the big-endian payload word.
    BigEndian,
}

/// One extractable signal of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub name: String,
    pub start_bit: u8,
    pub width: u8,
    pub byte_order: SignalByteOrder,
    pub signed: bool,
    pub scale: f64,
    pub offset: f64,
    /// Series in the downstream store this signal feeds.
    pub sensor: SensorHandle,
}

/// Mux selector for multiplexed nodes: which signal set applies is chosen
/// by a small bit field in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxConfig {
    pub start_bit: u8,
    pub width: u8,
    pub byte_order: SignalByteOrder,
    /// Mux value → signal set. Values absent here are discarded (counted).
    pub cases: Vec<(u64, Vec<SignalConfig>)>,
}

/// One CAN-ID-addressed node on a bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub can_id: u32,
    /// Signals decoded from every instance of the frame.
    pub signals: Vec<SignalConfig>,
    pub mux: Option<MuxConfig>,
}

/// Pool sizing and node set for one bus (physical or logical).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub capacity: usize,
    pub nodes: Vec<NodeConfig>,
}

impl BusConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(capacity: usize, nodes: Vec<NodeConfig>) -> Self {
        Self { capacity, nodes }
    }
}

/// Record framing spoken by the Ethernet CAN server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framing {
    /// Legacy fixed-layout records; all frames land on logical bus 0.
    Pcan,
    /// Length-prefixed records carrying an explicit logical-bus tag.
    Aptera,
}

/// Ethernet CAN server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EthernetConfig {
    /// Listen address, `host:port`.
    pub bind_addr: String,
    pub framing: Framing,
    /// Logical buses, index i served as bus tag 2 + i.
    pub buses: Vec<BusConfig>,
}

impl EthernetConfig {
    pub fn disabled() -> Self {
        Self {
            bind_addr: DEFAULT_SERVER_ADDR.to_owned(),
            framing: Framing::Aptera,
            buses: Vec::new(),
        }
    }
}

/// Complete configuration of the ingest core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub can0: BusConfig,
    pub can1: BusConfig,
    pub ethernet: EthernetConfig,
    /// Minimum unified queue capacity; rounded up to a power of two.
    /// Size for bursts: three times the pool sum keeps the queue below
    /// 10 % depth under design load.
    pub queue_capacity: usize,
    pub batch_max: usize,
    pub idle_sleep_us: u64,
    pub busy_sleep_us: u64,
    pub drain_deadline_ms: u64,
    /// Fixed real-time priority for the consumer thread (POSIX 0–99);
    /// `None` keeps the default scheduling class.
    pub consumer_priority: Option<i32>,
    pub log_queue_capacity: usize,
}

impl CoreConfig {
    /// A configuration with spec-default tuning and empty node sets.
    pub fn new(can0_capacity: usize, can1_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            can0: BusConfig::new(can0_capacity),
            can1: BusConfig::new(can1_capacity),
            ethernet: EthernetConfig::disabled(),
            queue_capacity,
            batch_max: DEFAULT_BATCH_MAX,
            idle_sleep_us: DEFAULT_IDLE_SLEEP_US,
            busy_sleep_us: DEFAULT_BUSY_SLEEP_US,
            drain_deadline_ms: DEFAULT_DRAIN_DEADLINE_MS,
            consumer_priority: Some(70),
            log_queue_capacity: 10_000,
        }
    }

    /// Every configured bus, physical first, then Ethernet logical buses in
    /// tag order.
    pub fn buses(&self) -> impl Iterator<Item = (String, &BusConfig)> {
        let eth = self
            .ethernet
            .buses
            .iter()
            .enumerate()
            .map(|(i, b)| (format!("eth{i}"), b));
        [("can0".to_owned(), &self.can0), ("can1".to_owned(), &self.can1)]
            .into_iter()
            .chain(eth)
    }

    /// Checks everything the hot path assumes. Called by `Core::build`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_max == 0 {
            return Err(ConfigError::ZeroBatch);
        }

        if self.ethernet.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::BadServerAddr {
                addr: self.ethernet.bind_addr.clone(),
            });
        }

        let mut largest_pool = 0;
        for (name, bus) in self.buses() {
            if bus.capacity < MIN_POOL_CAPACITY {
                return Err(ConfigError::PoolTooSmall {
                    bus: name,
                    capacity: bus.capacity,
                    min: MIN_POOL_CAPACITY,
                });
            }
            largest_pool = largest_pool.max(bus.capacity);
            validate_nodes(&name, &bus.nodes)?;
        }

        if self.queue_capacity < largest_pool {
            return Err(ConfigError::QueueTooSmall {
                queue: self.queue_capacity,
                pool: largest_pool,
            });
        }

        Ok(())
    }
}

fn validate_nodes(bus: &str, nodes: &[NodeConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.can_id) {
            return Err(ConfigError::DuplicateCanId {
                bus: bus.to_owned(),
                can_id: node.can_id,
            });
        }

        if node.signals.is_empty() && node.mux.is_none() {
            return Err(ConfigError::EmptyNode {
                bus: bus.to_owned(),
                can_id: node.can_id,
            });
        }

        for sig in &node.signals {
            validate_signal(bus, node.can_id, sig)?;
        }

        if let Some(mux) = &node.mux {
            if mux.cases.is_empty() {
                return Err(ConfigError::EmptyMux {
                    bus: bus.to_owned(),
                    can_id: node.can_id,
                });
            }
            if !field_fits(mux.start_bit, mux.width) {
                return Err(ConfigError::SignalOutOfBounds {
                    bus: bus.to_owned(),
                    can_id: node.can_id,
                    signal: "<mux selector>".to_owned(),
                    start_bit: mux.start_bit,
                    width: mux.width,
                });
            }
            for (_, signals) in &mux.cases {
                for sig in signals {
                    validate_signal(bus, node.can_id, sig)?;
                }
            }
        }
    }
    Ok(())
}

fn validate_signal(bus: &str, can_id: u32, sig: &SignalConfig) -> Result<(), ConfigError> {
    if !field_fits(sig.start_bit, sig.width) {
        return Err(ConfigError::SignalOutOfBounds {
            bus: bus.to_owned(),
            can_id,
            signal: sig.name.clone(),
            start_bit: sig.start_bit,
            width: sig.width,
        });
    }
    Ok(())
}

fn field_fits(start_bit: u8, width: u8) -> bool {
    width >= 1 && width <= 64 && u32::from(start_bit) + u32::from(width) <= 64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(name: &str, start: u8, width: u8) -> SignalConfig {
        SignalConfig {
            name: name.to_owned(),
            start_bit: start,
            width,
            byte_order: SignalByteOrder::LittleEndian,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            sensor: SensorHandle(0),
        }
    }

    fn minimal() -> CoreConfig {
        CoreConfig::new(4_096, 4_096, 16_384)
    }

    #[test]
    fn test_minimal_config_validates() {
        minimal().validate().unwrap();
    }

    #[test]
    fn test_pool_floor_enforced() {
        let mut cfg = minimal();
        cfg.can1.capacity = 4;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PoolTooSmall { capacity: 4, .. })
        ));
    }

    #[test]
    fn test_queue_must_cover_largest_pool() {
        let mut cfg = minimal();
        cfg.queue_capacity = 1_024;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::QueueTooSmall { queue: 1_024, .. })
        ));
    }

    #[test]
    fn test_duplicate_can_id_rejected() {
        let mut cfg = minimal();
        cfg.can0.nodes = vec![
            NodeConfig {
                can_id: 0x1A0,
                signals: vec![signal("a", 0, 8)],
                mux: None,
            },
            NodeConfig {
                can_id: 0x1A0,
                signals: vec![signal("b", 8, 8)],
                mux: None,
            },
        ];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateCanId { can_id: 0x1A0, .. })
        ));
    }

    #[test]
    fn test_signal_must_fit_payload_word() {
        let mut cfg = minimal();
        cfg.can0.nodes = vec![NodeConfig {
            can_id: 0x200,
            signals: vec![signal("wide", 60, 8)],
            mux: None,
        }];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SignalOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_mux_without_cases_rejected() {
        let mut cfg = minimal();
        cfg.can0.nodes = vec![NodeConfig {
            can_id: 0x300,
            signals: vec![],
            mux: Some(MuxConfig {
                start_bit: 0,
                width: 4,
                byte_order: SignalByteOrder::LittleEndian,
                cases: vec![],
            }),
        }];
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyMux { .. })));
    }

    #[test]
    fn test_ethernet_buses_validated_too() {
        let mut cfg = minimal();
        cfg.ethernet.buses.push(BusConfig::new(8));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PoolTooSmall { .. })
        ));
    }

    #[test]
    fn test_bad_server_addr_rejected() {
        let mut cfg = minimal();
        cfg.ethernet.bind_addr = "not-an-addr".to_owned();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadServerAddr { .. })
        ));
    }
}
