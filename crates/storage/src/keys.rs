//! Tagged record keys.
//!
//! Every record key starts with a short ASCII tag naming the record kind,
//! followed by fixed-width big-endian payload fields:
//!
//! ```text
//! [tag len: u8][tag bytes][payload...]
//! ```
//!
//! Because the payload is big-endian and fixed-width, the byte order of
//! encoded keys groups records by tag and orders them numerically inside a
//! tag, which is what the range scans in this crate rely on.

use crate::db::{Result, StorageError};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use trustchain_core::{BlockPos, DiskTxPos, Hash};

/// Record tags as they appear on disk.
pub mod tag {
    pub const VERSION: &str = "version";
    pub const TX: &str = "tx";
    pub const BLOCK_INDEX: &str = "blockindex";
    pub const OWNER: &str = "owner";
    pub const ADDR: &str = "addr";
    pub const ADDRMAN: &str = "addrman";
    pub const HASH_BEST_CHAIN: &str = "hashBestChain";
    pub const BEST_INVALID_TRUST: &str = "bnBestInvalidTrust";
    pub const CHECKPOINT_PUBKEY: &str = "strCheckpointPubKey";
    pub const BLOCK: &str = "block";
}

/// Anything that can be turned into raw key bytes.
pub trait StorageKey {
    fn encode_key(&self) -> Vec<u8>;
}

impl StorageKey for [u8] {
    fn encode_key(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl StorageKey for Vec<u8> {
    fn encode_key(&self) -> Vec<u8> {
        self.clone()
    }
}

/// The closed set of record kinds stored in logical files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    /// Format version stamp of the file.
    Version,
    /// Transaction index entry.
    Tx(Hash),
    /// Block index node.
    BlockIndex(Hash),
    /// Per-owner transaction record; the value is the block height.
    Owner { owner: Hash, pos: DiskTxPos },
    /// Legacy per-address peer record.
    Addr(SocketAddr),
    /// Address manager snapshot.
    AddrMan,
    HashBestChain,
    BestInvalidTrust,
    CheckpointPubKey,
    /// Block body in a block file.
    Block(BlockPos),
}

impl RecordKey {
    pub fn tag(&self) -> &'static str {
        match self {
            RecordKey::Version => tag::VERSION,
            RecordKey::Tx(_) => tag::TX,
            RecordKey::BlockIndex(_) => tag::BLOCK_INDEX,
            RecordKey::Owner { .. } => tag::OWNER,
            RecordKey::Addr(_) => tag::ADDR,
            RecordKey::AddrMan => tag::ADDRMAN,
            RecordKey::HashBestChain => tag::HASH_BEST_CHAIN,
            RecordKey::BestInvalidTrust => tag::BEST_INVALID_TRUST,
            RecordKey::CheckpointPubKey => tag::CHECKPOINT_PUBKEY,
            RecordKey::Block(_) => tag::BLOCK,
        }
    }

    /// Encoded prefix shared by every key with the given tag.
    pub fn tag_prefix(tag: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(tag.len() + 1);
        out.push(tag.len() as u8);
        out.extend_from_slice(tag.as_bytes());
        out
    }

    /// Read the tag of an encoded key without decoding the payload.
    pub fn peek_tag(bytes: &[u8]) -> Option<&str> {
        let len = *bytes.first()? as usize;
        let raw = bytes.get(1..1 + len)?;
        std::str::from_utf8(raw).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Self::tag_prefix(self.tag());
        match self {
            RecordKey::Tx(hash) | RecordKey::BlockIndex(hash) => {
                out.extend_from_slice(hash.as_bytes())
            }
            RecordKey::Owner { owner, pos } => {
                out.extend_from_slice(owner.as_bytes());
                put_tx_pos(&mut out, pos);
            }
            RecordKey::Addr(addr) => {
                let ip = match addr.ip() {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                out.extend_from_slice(&ip.octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            RecordKey::Block(pos) => {
                out.extend_from_slice(&pos.file.to_be_bytes());
                out.extend_from_slice(&pos.block_pos.to_be_bytes());
            }
            RecordKey::Version
            | RecordKey::AddrMan
            | RecordKey::HashBestChain
            | RecordKey::BestInvalidTrust
            | RecordKey::CheckpointPubKey => {}
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let tag = Self::peek_tag(bytes).ok_or_else(|| malformed(bytes))?;
        let mut payload = Payload {
            rest: &bytes[1 + tag.len()..],
            whole: bytes,
        };
        let key = match tag {
            tag::VERSION => RecordKey::Version,
            tag::TX => RecordKey::Tx(payload.hash()?),
            tag::BLOCK_INDEX => RecordKey::BlockIndex(payload.hash()?),
            tag::OWNER => {
                let owner = payload.hash()?;
                let pos = DiskTxPos::new(payload.u32()?, payload.u32()?, payload.u32()?);
                RecordKey::Owner { owner, pos }
            }
            tag::ADDR => {
                let octets: [u8; 16] = payload.take()?;
                let port = u16::from_be_bytes(payload.take()?);
                let v6 = Ipv6Addr::from(octets);
                let ip = match v6.to_ipv4_mapped() {
                    Some(v4) => IpAddr::V4(v4),
                    None => IpAddr::V6(v6),
                };
                RecordKey::Addr(SocketAddr::new(ip, port))
            }
            tag::ADDRMAN => RecordKey::AddrMan,
            tag::HASH_BEST_CHAIN => RecordKey::HashBestChain,
            tag::BEST_INVALID_TRUST => RecordKey::BestInvalidTrust,
            tag::CHECKPOINT_PUBKEY => RecordKey::CheckpointPubKey,
            tag::BLOCK => RecordKey::Block(BlockPos::new(payload.u32()?, payload.u32()?)),
            _ => return Err(malformed(bytes)),
        };
        payload.finish()?;
        Ok(key)
    }
}

impl StorageKey for RecordKey {
    fn encode_key(&self) -> Vec<u8> {
        self.encode()
    }
}

fn put_tx_pos(out: &mut Vec<u8>, pos: &DiskTxPos) {
    out.extend_from_slice(&pos.file.to_be_bytes());
    out.extend_from_slice(&pos.block_pos.to_be_bytes());
    out.extend_from_slice(&pos.tx_pos.to_be_bytes());
}

fn malformed(bytes: &[u8]) -> StorageError {
    StorageError::Deserialize(format!("malformed record key ({} bytes)", bytes.len()))
}

struct Payload<'a> {
    rest: &'a [u8],
    whole: &'a [u8],
}

impl Payload<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.rest.len() < N {
            return Err(malformed(self.whole));
        }
        let (head, tail) = self.rest.split_at(N);
        self.rest = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn hash(&mut self) -> Result<Hash> {
        Ok(Hash(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    fn finish(self) -> Result<()> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(malformed(self.whole))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustchain_core::hash;

    #[test]
    fn test_key_roundtrip() {
        let keys = vec![
            RecordKey::Version,
            RecordKey::Tx(hash(b"tx")),
            RecordKey::BlockIndex(hash(b"block")),
            RecordKey::Owner {
                owner: hash(b"owner"),
                pos: DiskTxPos::new(1, 2, 3),
            },
            RecordKey::Addr(SocketAddr::from(([192, 168, 1, 7], 9323))),
            RecordKey::Addr("[2001:db8::1]:8333".parse().unwrap()),
            RecordKey::AddrMan,
            RecordKey::HashBestChain,
            RecordKey::BestInvalidTrust,
            RecordKey::CheckpointPubKey,
            RecordKey::Block(BlockPos::new(1, 77)),
        ];
        for key in keys {
            assert_eq!(RecordKey::decode(&key.encode()).unwrap(), key);
        }
    }

    #[test]
    fn test_tag_prefix_grouping() {
        let key = RecordKey::BlockIndex(hash(b"x")).encode();
        assert!(key.starts_with(&RecordKey::tag_prefix(tag::BLOCK_INDEX)));
        assert_eq!(RecordKey::peek_tag(&key), Some(tag::BLOCK_INDEX));

        // "addr" must not be a prefix of "addrman" once encoded.
        let addrman = RecordKey::AddrMan.encode();
        assert!(!addrman.starts_with(&RecordKey::tag_prefix(tag::ADDR)));
    }

    #[test]
    fn test_owner_keys_order_by_position() {
        let owner = hash(b"owner");
        let low = RecordKey::Owner {
            owner,
            pos: DiskTxPos::new(1, 2, 0),
        }
        .encode();
        let high = RecordKey::Owner {
            owner,
            pos: DiskTxPos::new(1, 256, 0),
        }
        .encode();
        assert!(low < high);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RecordKey::decode(&[]).is_err());
        assert!(RecordKey::decode(b"\x02tx\x01").is_err());
        assert!(RecordKey::decode(b"\x03zzz").is_err());

        let mut trailing = RecordKey::Version.encode();
        trailing.push(0);
        assert!(RecordKey::decode(&trailing).is_err());
    }
}
