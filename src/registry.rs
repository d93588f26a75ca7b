//! Bus address registry and per-address counters.

/// 6-byte device identifier in wire order.
pub type Mac = [u8; 6];

/// Number of addressable bus slots (5-bit address space).
pub const NUM_ADDRESSES: usize = 32;

/// Slot reserved for the bus master.
pub const MASTER_ADDRESS: u8 = 0;

/// Display form of a MAC: byte pairs reversed from wire order, colon-joined.
#[must_use]
pub fn display_mac(mac: &Mac) -> String {
    mac.iter()
        .rev()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Maps 5-bit bus addresses to device MACs learned from GiveAddr frames.
///
/// Once set, a slot is durable for the session; it is only reset by an
/// explicit [clear](AddressRegistry::clear).
#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    slots: [Option<Mac>; NUM_ADDRESSES],
}

impl AddressRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `address` (masked to 5 bits) to `mac`.
    pub fn record(&mut self, address: u8, mac: Mac) {
        self.slots[(address & 0x1f) as usize] = Some(mac);
    }

    #[must_use]
    pub fn get(&self, address: u8) -> Option<&Mac> {
        self.slots[(address & 0x1f) as usize].as_ref()
    }

    /// Display form for an address, if its MAC is known.
    #[must_use]
    pub fn display(&self, address: u8) -> Option<String> {
        self.get(address).map(display_mac)
    }

    /// Address bound to `mac`, if any.
    #[must_use]
    pub fn find(&self, mac: &[u8]) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| slot.map_or(false, |m| m[..] == *mac))
            .map(|i| i as u8)
    }

    /// Registered (address, MAC) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &Mac)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|mac| (i as u8, mac)))
    }

    pub fn clear(&mut self) {
        self.slots = [None; NUM_ADDRESSES];
    }
}

/// Per-address tallies of suppressed protocol chatter plus custom-filter
/// hits, indexed by bus address.
#[derive(Debug, Clone)]
pub struct Counters {
    pub idle_ack: [u32; NUM_ADDRESSES],
    pub search: [u32; NUM_ADDRESSES],
    pub get_id: [u32; NUM_ADDRESSES],
    pub filter_hits: [u32; NUM_ADDRESSES],
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            idle_ack: [0; NUM_ADDRESSES],
            search: [0; NUM_ADDRESSES],
            get_id: [0; NUM_ADDRESSES],
            filter_hits: [0; NUM_ADDRESSES],
        }
    }
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
