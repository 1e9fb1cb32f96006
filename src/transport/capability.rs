use std::sync::atomic::{AtomicU32, Ordering};

/// Optional protocol features that both peers must agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Message2Basic,
    Message4Basic,
    Message4StringTable,
    LargeTransfer,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Message2Basic,
        Capability::Message4Basic,
        Capability::Message4StringTable,
        Capability::LargeTransfer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::Message2Basic => "com.robotraconteur.message2.basic",
            Capability::Message4Basic => "com.robotraconteur.message4.basic",
            Capability::Message4StringTable => "com.robotraconteur.message4.stringtable",
            Capability::LargeTransfer => "com.robotraconteur.largetransfer",
        }
    }

    pub fn from_name(name: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.name() == name)
    }

    pub fn bit(&self) -> u32 {
        match self {
            Capability::Message2Basic => 0x1,
            Capability::Message4Basic => 0x2,
            Capability::Message4StringTable => 0x4,
            Capability::LargeTransfer => 0x8,
        }
    }
}

/// Lock-free bitmask of active capabilities
#[derive(Debug, Default)]
pub struct CapabilitySet(AtomicU32);

impl CapabilitySet {
    pub fn new(bits: u32) -> Self {
        CapabilitySet(AtomicU32::new(bits))
    }

    pub fn insert(&self, cap: Capability) {
        self.0.fetch_or(cap.bit(), Ordering::SeqCst);
    }

    pub fn insert_bits(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::SeqCst);
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.load(Ordering::SeqCst) & cap.bit() != 0
    }

    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_to_capabilities() {
        for cap in Capability::ALL {
            assert_eq!(Capability::from_name(cap.name()), Some(cap));
        }
        assert_eq!(Capability::from_name("com.example.unknown"), None);
    }

    #[test]
    fn set_tracks_inserted_bits_only() {
        let set = CapabilitySet::new(Capability::Message2Basic.bit());
        assert!(set.contains(Capability::Message2Basic));
        assert!(!set.contains(Capability::Message4StringTable));
        set.insert(Capability::Message4StringTable);
        assert!(set.contains(Capability::Message4StringTable));
        assert!(!set.contains(Capability::LargeTransfer));
    }
}
