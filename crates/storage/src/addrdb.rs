//! Peer address persistence.

use crate::db::{decode_value, Database, Result};
use crate::env::Environment;
use crate::keys::{tag, RecordKey};
use crate::registry::ADDR_FILE;
use std::sync::Arc;
use tracing::info;
use trustchain_core::{AddrMan, PeerAddress};

/// Address manager snapshot in `addr.dat`, with fallback to the legacy
/// one-record-per-peer layout.
pub struct AddrDb {
    db: Database,
}

impl AddrDb {
    pub fn open(env: &Arc<Environment>) -> Result<Self> {
        Ok(Self {
            db: Database::open(env, ADDR_FILE, "cr+")?,
        })
    }

    pub fn write_addrman(&self, addrman: &AddrMan) -> Result<bool> {
        self.db.put(&RecordKey::AddrMan, addrman, true)
    }

    /// Store a peer in the legacy layout.
    pub fn write_address(&self, address: &PeerAddress) -> Result<bool> {
        self.db.put(&RecordKey::Addr(address.addr), address, true)
    }

    /// Load the snapshot, or build one from legacy records if there is none.
    /// Legacy records are left in place.
    pub fn load_addresses(&self) -> Result<AddrMan> {
        if let Some(addrman) = self.db.get(&RecordKey::AddrMan)? {
            return Ok(addrman);
        }

        let mut legacy = Vec::new();
        let mut cursor = self.db.cursor()?;
        cursor.seek(&RecordKey::tag_prefix(tag::ADDR));
        while let Some((key, value)) = cursor.read_next()? {
            if RecordKey::peek_tag(&key) != Some(tag::ADDR) {
                break;
            }
            legacy.push(decode_value::<PeerAddress>(&value)?);
        }

        let mut addrman = AddrMan::new();
        let added = addrman.add(legacy, AddrMan::wildcard_source());
        if added > 0 {
            info!(count = added, "loaded legacy peer addresses");
        }
        Ok(addrman)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(last: u8) -> PeerAddress {
        PeerAddress::new(SocketAddr::from(([10, 1, 2, last], 9323)), 1, 100)
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let env = Environment::open_temporary().unwrap();
        let store = AddrDb::open(&env).unwrap();

        let mut addrman = AddrMan::new();
        addrman.add(vec![peer(1), peer(2)], "10.0.0.9".parse().unwrap());
        store.write_addrman(&addrman).unwrap();

        assert_eq!(store.load_addresses().unwrap(), addrman);
    }

    #[test]
    fn test_empty_store_loads_empty_manager() {
        let env = Environment::open_temporary().unwrap();
        let store = AddrDb::open(&env).unwrap();
        assert!(store.load_addresses().unwrap().is_empty());
    }

    #[test]
    fn test_legacy_migration_is_idempotent() {
        let env = Environment::open_temporary().unwrap();
        let store = AddrDb::open(&env).unwrap();
        for last in 1..=3 {
            store.write_address(&peer(last)).unwrap();
        }

        let first = store.load_addresses().unwrap();
        assert_eq!(first.len(), 3);
        let entry = first.get(&peer(2).addr).unwrap();
        assert_eq!(entry.source, AddrMan::wildcard_source());

        // Legacy records survive, so a second load sees the same set.
        let second = store.load_addresses().unwrap();
        assert_eq!(first, second);

        // Once a snapshot is written it takes precedence.
        let mut snapshot = AddrMan::new();
        snapshot.add(vec![peer(9)], AddrMan::wildcard_source());
        store.write_addrman(&snapshot).unwrap();
        assert_eq!(store.load_addresses().unwrap(), snapshot);
    }
}
