//! Signal extraction: from a frame's payload to scaled samples.
//!
//! The whole path is allocation-free: the payload is widened to one u64 in
//! each byte order and fields are pulled out with shifts and masks. Errors
//! are contained per signal — a field that no longer fits (possible only if
//! a table was built bypassing validation) skips that signal, never the
//! frame.

use crate::config::SignalByteOrder;
use crate::nodes::{NodeDescriptor, Signal};
use crate::store::SampleSink;
use frameslab::{ConsumerStats, Frame};

/// Why a single signal was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// start_bit + width exceeds the 64-bit payload word.
    FieldOutOfBounds,
}

/// Extracts the raw (unsigned, unscaled) field value.
///
/// Little-endian fields give `start_bit` as the LSB position in the
/// little-endian payload word; big-endian fields count `start_bit` from the
/// MSB of payload byte 0, with the field read MSB-first.
pub fn extract_raw(
    payload: &[u8; 8],
    start_bit: u8,
    width: u8,
    byte_order: SignalByteOrder,
) -> Result<u64, DecodeError> {
    let start = u32::from(start_bit);
    let width = u32::from(width);
    if width == 0 || width > 64 || start + width > 64 {
        return Err(DecodeError::FieldOutOfBounds);
    }

    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
    let raw = match byte_order {
        SignalByteOrder::LittleEndian => u64::from_le_bytes(*payload) >> start,
        SignalByteOrder::BigEndian => u64::from_be_bytes(*payload) >> (64 - start - width),
    };
    Ok(raw & mask)
}

/// Sign-extends a `width`-bit raw value.
#[inline]
fn sign_extend(raw: u64, width: u8) -> i64 {
    if width >= 64 {
        return raw as i64;
    }
    let shift = 64 - u32::from(width);
    ((raw << shift) as i64) >> shift
}

/// Decodes one signal to its physical value.
pub fn decode_signal(payload: &[u8; 8], sig: &Signal) -> Result<f64, DecodeError> {
    let raw = extract_raw(payload, sig.start_bit, sig.width, sig.byte_order)?;
    let value = if sig.signed {
        sign_extend(raw, sig.width) as f64
    } else {
        raw as f64
    };
    Ok(value * sig.scale + sig.offset)
}

/// Decodes every signal the node declares for this frame and appends the
/// samples downstream.
///
/// Multiplexed nodes first read the selector; a mux value with no declared
/// signal set discards the frame silently (counted). Per-signal failures
/// and store backpressure are counted and the remaining signals continue.
pub fn decode_frame(
    frame: &Frame,
    node: &NodeDescriptor,
    sink: &dyn SampleSink,
    stats: &ConsumerStats,
) {
    decode_signal_set(frame, &node.signals, sink, stats);

    if let Some(mux) = &node.mux {
        let selector = match extract_raw(&frame.payload, mux.start_bit, mux.width, mux.byte_order)
        {
            Ok(v) => v,
            Err(_) => {
                stats.record_decode_error();
                return;
            }
        };
        match mux.signals_for(selector) {
            Some(signals) => decode_signal_set(frame, signals, sink, stats),
            None => stats.record_mux_miss(),
        }
    }
}

fn decode_signal_set(
    frame: &Frame,
    signals: &[Signal],
    sink: &dyn SampleSink,
    stats: &ConsumerStats,
) {
    for sig in signals {
        match decode_signal(&frame.payload, sig) {
            Ok(value) => {
                if sink.append(sig.sensor, value, frame.timestamp_us).is_err() {
                    stats.record_store_full();
                }
            }
            Err(_) => stats.record_decode_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MuxConfig, NodeConfig, SignalConfig};
    use crate::nodes::NodeTable;
    use crate::store::{BoundedStore, MemoryStore, SensorHandle};
    use frameslab::BusTag;

    fn sig(start: u8, width: u8, order: SignalByteOrder, signed: bool) -> Signal {
        Signal {
            name: "s".to_owned(),
            start_bit: start,
            width,
            byte_order: order,
            signed,
            scale: 1.0,
            offset: 0.0,
            sensor: SensorHandle(1),
        }
    }

    #[test]
    fn test_little_endian_extraction() {
        // Payload as LE word: 0x8877665544332211.
        let payload = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        assert_eq!(
            extract_raw(&payload, 0, 8, SignalByteOrder::LittleEndian).unwrap(),
            0x11
        );
        assert_eq!(
            extract_raw(&payload, 8, 16, SignalByteOrder::LittleEndian).unwrap(),
            0x3322
        );
        assert_eq!(
            extract_raw(&payload, 4, 8, SignalByteOrder::LittleEndian).unwrap(),
            0x21
        );
        assert_eq!(
            extract_raw(&payload, 0, 64, SignalByteOrder::LittleEndian).unwrap(),
            0x8877_6655_4433_2211
        );
    }

    #[test]
    fn test_big_endian_extraction() {
        // Payload as BE word: 0x1122334455667788.
        let payload = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        // First byte, MSB-first.
        assert_eq!(
            extract_raw(&payload, 0, 8, SignalByteOrder::BigEndian).unwrap(),
            0x11
        );
        // Bits 8..24 of the BE stream: the second and third bytes.
        assert_eq!(
            extract_raw(&payload, 8, 16, SignalByteOrder::BigEndian).unwrap(),
            0x2233
        );
        // A nibble straddling the first byte boundary.
        assert_eq!(
            extract_raw(&payload, 4, 8, SignalByteOrder::BigEndian).unwrap(),
            0x12
        );
    }

    #[test]
    fn test_field_bounds_checked() {
        let payload = [0u8; 8];
        assert_eq!(
            extract_raw(&payload, 60, 8, SignalByteOrder::LittleEndian),
            Err(DecodeError::FieldOutOfBounds)
        );
        assert_eq!(
            extract_raw(&payload, 0, 0, SignalByteOrder::BigEndian),
            Err(DecodeError::FieldOutOfBounds)
        );
    }

    #[test]
    fn test_sign_extension() {
        // 12-bit field holding -1 (0xFFF).
        let payload = [0xFF, 0x0F, 0, 0, 0, 0, 0, 0];
        let s = sig(0, 12, SignalByteOrder::LittleEndian, true);
        assert_eq!(decode_signal(&payload, &s).unwrap(), -1.0);

        // Same bits unsigned.
        let u = sig(0, 12, SignalByteOrder::LittleEndian, false);
        assert_eq!(decode_signal(&payload, &u).unwrap(), 4095.0);
    }

    #[test]
    fn test_scale_and_offset() {
        let payload = [200, 0, 0, 0, 0, 0, 0, 0];
        let mut s = sig(0, 8, SignalByteOrder::LittleEndian, false);
        s.scale = 0.5;
        s.offset = -40.0;
        // Engine-temperature style encoding: raw 200 → 60 degrees.
        assert_eq!(decode_signal(&payload, &s).unwrap(), 60.0);
    }

    #[test]
    fn test_decode_frame_appends_all_signals() {
        let node_cfg = NodeConfig {
            can_id: 0x1A0,
            signals: vec![
                SignalConfig {
                    name: "speed".to_owned(),
                    start_bit: 0,
                    width: 16,
                    byte_order: SignalByteOrder::LittleEndian,
                    signed: false,
                    scale: 0.01,
                    offset: 0.0,
                    sensor: SensorHandle(10),
                },
                SignalConfig {
                    name: "rpm".to_owned(),
                    start_bit: 16,
                    width: 16,
                    byte_order: SignalByteOrder::LittleEndian,
                    signed: false,
                    scale: 1.0,
                    offset: 0.0,
                    sensor: SensorHandle(11),
                },
            ],
            mux: None,
        };
        let table = NodeTable::build(std::slice::from_ref(&node_cfg));
        let node = table.lookup(0x1A0).unwrap();

        let frame = Frame::new(BusTag::CAN0, 0x1A0, &[0x10, 0x27, 0xE8, 0x03], 777);
        let sink = MemoryStore::new();
        let stats = ConsumerStats::new();
        decode_frame(&frame, node, &sink, &stats);

        let samples = sink.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], (SensorHandle(10), 100.0, 777)); // 10000 * 0.01
        assert_eq!(samples[1], (SensorHandle(11), 1000.0, 777));
        assert_eq!(stats.snapshot().decode_errors, 0);
    }

    #[test]
    fn test_mux_selects_signal_set() {
        let node_cfg = NodeConfig {
            can_id: 0x500,
            signals: vec![],
            mux: Some(MuxConfig {
                start_bit: 0,
                width: 8,
                byte_order: SignalByteOrder::LittleEndian,
                cases: vec![
                    (
                        1,
                        vec![SignalConfig {
                            name: "cell_voltage".to_owned(),
                            start_bit: 8,
                            width: 16,
                            byte_order: SignalByteOrder::LittleEndian,
                            signed: false,
                            scale: 0.001,
                            offset: 0.0,
                            sensor: SensorHandle(20),
                        }],
                    ),
                    (
                        2,
                        vec![SignalConfig {
                            name: "cell_temp".to_owned(),
                            start_bit: 8,
                            width: 8,
                            byte_order: SignalByteOrder::LittleEndian,
                            signed: true,
                            scale: 1.0,
                            offset: 0.0,
                            sensor: SensorHandle(21),
                        }],
                    ),
                ],
            }),
        };
        let table = NodeTable::build(std::slice::from_ref(&node_cfg));
        let node = table.lookup(0x500).unwrap();
        let sink = MemoryStore::new();
        let stats = ConsumerStats::new();

        // Mux value 1: voltage case.
        let f1 = Frame::new(BusTag::CAN0, 0x500, &[0x01, 0xB8, 0x0D], 1);
        decode_frame(&f1, node, &sink, &stats);
        let (sensor, value, _) = *sink.samples().last().unwrap();
        assert_eq!(sensor, SensorHandle(20));
        assert!((value - 3.512).abs() < 1e-9); // 0x0DB8 mV

        // Mux value 9: no case declared — counted, nothing appended.
        let before = sink.len();
        let f2 = Frame::new(BusTag::CAN0, 0x500, &[0x09, 0xFF], 2);
        decode_frame(&f2, node, &sink, &stats);
        assert_eq!(sink.len(), before);
        assert_eq!(stats.snapshot().mux_misses, 1);
    }

    #[test]
    fn test_store_full_counted_not_fatal() {
        let node_cfg = NodeConfig {
            can_id: 0x1B0,
            signals: (0..4)
                .map(|i| SignalConfig {
                    name: format!("s{i}"),
                    start_bit: i * 8,
                    width: 8,
                    byte_order: SignalByteOrder::LittleEndian,
                    signed: false,
                    scale: 1.0,
                    offset: 0.0,
                    sensor: SensorHandle(u32::from(i)),
                })
                .collect(),
            mux: None,
        };
        let table = NodeTable::build(std::slice::from_ref(&node_cfg));
        let node = table.lookup(0x1B0).unwrap();

        let sink = BoundedStore::new(2);
        let stats = ConsumerStats::new();
        let frame = Frame::new(BusTag::CAN1, 0x1B0, &[1, 2, 3, 4], 5);
        decode_frame(&frame, node, &sink, &stats);

        assert_eq!(sink.samples().len(), 2);
        assert_eq!(stats.snapshot().store_full, 2);
    }
}
