//! Device Registry
//!
//! Remembers which UUID and protocol variant each tablet was registered with,
//! keyed by device address.

use crate::domain::models::{DeviceUuid, ProtocolVariant};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub uuid: DeviceUuid,
    pub variant: ProtocolVariant,
}

pub trait DeviceRegistry {
    fn lookup(&self, address: &str) -> Option<RegistryEntry>;
    fn store(&mut self, address: &str, entry: RegistryEntry);
}

/// Registry kept in memory; serializable so callers can persist it
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryRegistry {
    devices: HashMap<String, RegistryEntry>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn lookup(&self, address: &str) -> Option<RegistryEntry> {
        self.devices.get(&address.to_ascii_uppercase()).copied()
    }

    fn store(&mut self, address: &str, entry: RegistryEntry) {
        self.devices.insert(address.to_ascii_uppercase(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_address_case() {
        let mut registry = MemoryRegistry::new();
        let entry = RegistryEntry {
            uuid: DeviceUuid([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            variant: ProtocolVariant::IntuosPro,
        };
        registry.store("aa:bb:cc:dd:ee:ff", entry);
        assert_eq!(registry.lookup("AA:BB:CC:DD:EE:FF"), Some(entry));
        assert_eq!(registry.lookup("00:00:00:00:00:00"), None);

        registry.store("AA:BB:CC:DD:EE:FF", RegistryEntry {
            variant: ProtocolVariant::Slate,
            ..entry
        });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_serializes_to_json() {
        let mut registry = MemoryRegistry::new();
        registry.store(
            "AA:BB",
            RegistryEntry {
                uuid: DeviceUuid([1, 2, 3, 4, 5, 6]),
                variant: ProtocolVariant::Spark,
            },
        );
        let json = serde_json::to_string(&registry).unwrap();
        let restored: MemoryRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.lookup("AA:BB"), registry.lookup("AA:BB"));
    }
}
