//! Demo: drives the ingest core with synthetic traffic on both physical
//! buses and prints a JSON monitor tick once per second.
//!
//! ```text
//! cargo run --bin demo -- [seconds] [frames_per_sec_per_bus]
//! ```

use canflow::{
    Core, CoreConfig, MemoryStore, NodeConfig, SampleSink, SensorHandle, SignalByteOrder,
    SignalConfig,
};
use frameslab::{monotonic_us, BusTag, StdoutSink};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn vehicle_node(can_id: u32, sensor_base: u32) -> NodeConfig {
    NodeConfig {
        can_id,
        signals: vec![
            SignalConfig {
                name: "speed_kph".to_owned(),
                start_bit: 0,
                width: 16,
                byte_order: SignalByteOrder::LittleEndian,
                signed: false,
                scale: 0.01,
                offset: 0.0,
                sensor: SensorHandle(sensor_base),
            },
            SignalConfig {
                name: "batt_temp_c".to_owned(),
                start_bit: 16,
                width: 8,
                byte_order: SignalByteOrder::LittleEndian,
                signed: true,
                scale: 1.0,
                offset: -40.0,
                sensor: SensorHandle(sensor_base + 1),
            },
        ],
        mux: None,
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let seconds: u64 = args.next().and_then(|a| a.parse().ok()).unwrap_or(10);
    let rate: u64 = args.next().and_then(|a| a.parse().ok()).unwrap_or(5_000);

    let mut config = CoreConfig::new(4_096, 4_096, 24_576);
    config.consumer_priority = None; // demo runs unprivileged
    config.can0.nodes = vec![vehicle_node(0x1A0, 100)];
    config.can1.nodes = vec![vehicle_node(0x2B0, 200)];

    let core = Core::build(config).expect("demo config is valid");
    let sink = Arc::new(MemoryStore::new());
    let mut handle = core
        .start(Arc::clone(&sink) as Arc<dyn SampleSink>)
        .expect("core starts");

    let stop = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::new();
    for (bus, can_id, seed) in [(BusTag::CAN0, 0x1A0u32, 1u64), (BusTag::CAN1, 0x2B0, 2)] {
        let ingress = core.ingress(bus).expect("bus exists");
        let stop = Arc::clone(&stop);
        producers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let interval = Duration::from_micros(1_000_000 / rate.max(1));
            let mut next = Instant::now();
            while !stop.load(Ordering::Acquire) {
                let speed: u16 = rng.gen_range(0..12_000); // 0–120 kph
                let temp: u8 = rng.gen_range(30..90); // raw, offset −40
                let mut payload = [0u8; 4];
                payload[..2].copy_from_slice(&speed.to_le_bytes());
                payload[2] = temp;
                ingress.ingest(can_id, &payload, monotonic_us());

                next += interval;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
        }));
    }

    let mut log_sink = StdoutSink;
    for _ in 0..seconds {
        thread::sleep(Duration::from_secs(1));
        core.flush_logs(100, 200_000, &mut log_sink);
        let tick = core.monitor_tick();
        match serde_json::to_string(&tick) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("monitor tick failed to serialize: {e}"),
        }
    }

    stop.store(true, Ordering::Release);
    for p in producers {
        let _ = p.join();
    }
    handle.shutdown();
    core.flush_logs(100, 200_000, &mut log_sink);

    let snapshot = core.snapshot();
    println!(
        "done: {} samples, {} drops, {} anomalies",
        sink.len(),
        snapshot
            .buses
            .iter()
            .map(|b| b.stats.drops.total())
            .sum::<u64>(),
        snapshot
            .buses
            .iter()
            .map(|b| b.stats.accounting_anomalies)
            .sum::<u64>()
    );
}
