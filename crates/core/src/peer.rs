//! Peer addresses and the address manager snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A known peer endpoint, as stored in legacy per-address records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub addr: SocketAddr,
    /// Service bits advertised by the peer.
    pub services: u64,
    /// Last time (unix seconds) the peer was seen.
    pub time: u32,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr, services: u64, time: u32) -> Self {
        Self {
            addr,
            services,
            time,
        }
    }
}

/// An address-manager entry: the address and where we learned it from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrEntry {
    pub address: PeerAddress,
    pub source: IpAddr,
}

/// The peer address manager. Persisted as a single snapshot record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrMan {
    entries: BTreeMap<SocketAddr, AddrEntry>,
}

impl AddrMan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source used for addresses whose origin is unknown.
    pub fn wildcard_source() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    /// Merge `addresses`, keeping the most recently seen copy of each
    /// endpoint. Returns how many endpoints were new.
    pub fn add<I>(&mut self, addresses: I, source: IpAddr) -> usize
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        let mut added = 0;
        for address in addresses {
            match self.entries.get_mut(&address.addr) {
                Some(entry) => {
                    if address.time > entry.address.time {
                        entry.address = address;
                    }
                }
                None => {
                    self.entries
                        .insert(address.addr, AddrEntry { address, source });
                    added += 1;
                }
            }
        }
        added
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&AddrEntry> {
        self.entries.get(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
