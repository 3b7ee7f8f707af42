use std::fmt;

/// Bit 31 of `can_id` marks a 29-bit extended-format identifier.
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// Mask selecting the 29 identifier bits of `can_id`.
pub const CAN_ID_MASK: u32 = 0x1FFF_FFFF;

/// Maximum payload length of a classical CAN frame.
pub const MAX_DLC: usize = 8;

/// Identifies the pool (and node table) a frame belongs to.
///
/// Tags 0 and 1 are the physical CAN controllers; tags 2 and up address the
/// logical buses multiplexed over the Ethernet CAN server. Physical and
/// logical buses live in separate, self-describing collections, so a tag is
/// only ever resolved against the collection it indexes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusTag(u8);

/// First tag value assigned to Ethernet logical buses.
const ETHERNET_BASE: u8 = 2;

impl BusTag {
    /// The first physical CAN controller.
    pub const CAN0: BusTag = BusTag(0);
    /// The second physical CAN controller.
    pub const CAN1: BusTag = BusTag(1);

    /// Tag for the Ethernet logical bus at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not fit in the 8-bit tag space.
    pub fn ethernet(index: usize) -> Self {
        assert!(
            index < (u8::MAX - ETHERNET_BASE) as usize,
            "ethernet bus index {index} out of tag range"
        );
        BusTag(ETHERNET_BASE + index as u8)
    }

    /// Reconstructs a tag from its wire value.
    #[inline]
    pub fn from_raw(raw: u8) -> Self {
        BusTag(raw)
    }

    /// The raw tag value as carried on the wire and in handles.
    #[inline]
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Returns `true` for Ethernet logical buses (tag ≥ 2).
    #[inline]
    pub fn is_ethernet(self) -> bool {
        self.0 >= ETHERNET_BASE
    }

    /// Index into the Ethernet logical bus collection, if this is one.
    #[inline]
    pub fn ethernet_index(self) -> Option<usize> {
        self.0.checked_sub(ETHERNET_BASE).map(usize::from)
    }
}

impl fmt::Display for BusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "can0"),
            1 => write!(f, "can1"),
            n => write!(f, "eth{}", n - ETHERNET_BASE),
        }
    }
}

/// A single CAN frame as stored in a pool slot.
///
/// Fixed size, `Copy`, and fully owned by whoever holds the slot's handle.
/// Unused payload bytes are zero so decode paths can treat the payload as a
/// full 8-byte word regardless of `dlc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    /// 29-bit identifier; bit 31 carries the extended-format flag.
    pub can_id: u32,
    /// Payload length in bytes, 0–8.
    pub dlc: u8,
    /// Payload, zero-padded past `dlc`.
    pub payload: [u8; MAX_DLC],
    /// Monotonic microseconds at ingestion time.
    pub timestamp_us: u64,
    /// The pool this frame's slot belongs to.
    pub bus: BusTag,
}

impl Frame {
    /// Builds a frame from raw payload bytes, zero-padding to 8 bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_DLC`]; producers validate the
    /// DLC before constructing a frame.
    pub fn new(bus: BusTag, can_id: u32, data: &[u8], timestamp_us: u64) -> Self {
        assert!(data.len() <= MAX_DLC, "payload exceeds classical CAN DLC");
        let mut payload = [0u8; MAX_DLC];
        payload[..data.len()].copy_from_slice(data);
        Self {
            can_id,
            dlc: data.len() as u8,
            payload,
            timestamp_us,
            bus,
        }
    }

    /// The identifier with the extended-format flag stripped.
    #[inline]
    pub fn id(&self) -> u32 {
        self.can_id & CAN_ID_MASK
    }

    /// Returns `true` if the frame uses a 29-bit extended identifier.
    #[inline]
    pub fn is_extended(&self) -> bool {
        self.can_id & CAN_EFF_FLAG != 0
    }

    /// The payload bytes actually carried (`dlc` of them).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.payload[..usize::from(self.dlc.min(MAX_DLC as u8))]
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            can_id: 0,
            dlc: 0,
            payload: [0; MAX_DLC],
            timestamp_us: 0,
            bus: BusTag::CAN0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_tag_roles() {
        assert!(!BusTag::CAN0.is_ethernet());
        assert!(!BusTag::CAN1.is_ethernet());
        assert_eq!(BusTag::CAN0.ethernet_index(), None);

        let eth0 = BusTag::ethernet(0);
        assert_eq!(eth0.raw(), 2);
        assert!(eth0.is_ethernet());
        assert_eq!(eth0.ethernet_index(), Some(0));
        assert_eq!(BusTag::ethernet(3).ethernet_index(), Some(3));
    }

    #[test]
    fn test_bus_tag_display() {
        assert_eq!(BusTag::CAN0.to_string(), "can0");
        assert_eq!(BusTag::CAN1.to_string(), "can1");
        assert_eq!(BusTag::ethernet(1).to_string(), "eth1");
    }

    #[test]
    fn test_frame_zero_pads_payload() {
        let f = Frame::new(BusTag::CAN0, 0x123, &[0xDE, 0xAD], 42);
        assert_eq!(f.dlc, 2);
        assert_eq!(f.data(), &[0xDE, 0xAD]);
        assert_eq!(&f.payload[2..], &[0u8; 6]);
        assert_eq!(f.timestamp_us, 42);
    }

    #[test]
    fn test_extended_flag() {
        let std = Frame::new(BusTag::CAN1, 0x7FF, &[], 0);
        assert!(!std.is_extended());
        assert_eq!(std.id(), 0x7FF);

        let ext = Frame::new(BusTag::CAN1, CAN_EFF_FLAG | 0x18FF_1234, &[], 0);
        assert!(ext.is_extended());
        assert_eq!(ext.id(), 0x18FF_1234);
    }
}
