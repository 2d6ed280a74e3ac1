//! In-memory block index.
//!
//! Nodes live in a [`BlockIndexMap`] keyed by block hash. Parent and child
//! relations are stored as hashes and resolved through the map.

use std::collections::HashMap;
use trustchain_core::{
    BlockPos, ChainTrust, DiskBlockIndex, Hash, CHANNEL_HASH, CHANNEL_PRIME, CHANNEL_STAKE,
};

/// One block in the index, with the fields derived while loading.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockIndex {
    pub hash: Hash,
    pub prev: Option<Hash>,
    /// Next block on the best chain.
    pub next: Option<Hash>,
    /// Whether the node's own record has been read. Nodes created only
    /// because another record links to them stay unloaded.
    pub loaded: bool,

    pub file: u32,
    pub block_pos: u32,
    pub mint: i64,
    pub money_supply: i64,
    pub flags: u32,
    pub version: u32,
    pub merkle_root: Hash,
    pub channel: u32,
    pub height: u32,
    pub bits: u32,
    pub nonce: u64,
    pub time: u32,

    /// Position of this block among blocks of its channel, starting at 1.
    pub channel_height: u32,
    pub chain_trust: ChainTrust,
    pub coinbase_rewards: [u64; 3],
    pub released_reserve: [i64; 3],
    /// Most recent hardened checkpoint at or below this block.
    pub pending_checkpoint: (u32, Hash),
}

impl BlockIndex {
    pub fn placeholder(hash: Hash) -> Self {
        Self {
            hash,
            ..Self::default()
        }
    }

    /// Copy the persisted fields of `disk` into this node.
    pub fn fill(&mut self, disk: &DiskBlockIndex) {
        self.prev = disk.hash_prev.non_zero();
        self.next = disk.hash_next.non_zero();
        self.loaded = true;
        self.file = disk.file;
        self.block_pos = disk.block_pos;
        self.mint = disk.mint;
        self.money_supply = disk.money_supply;
        self.flags = disk.flags;
        self.version = disk.version;
        self.merkle_root = disk.merkle_root;
        self.channel = disk.channel;
        self.height = disk.height;
        self.bits = disk.bits;
        self.nonce = disk.nonce;
        self.time = disk.time;
    }

    pub fn pos(&self) -> BlockPos {
        BlockPos::new(self.file, self.block_pos)
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.channel == CHANNEL_STAKE
    }

    pub fn is_proof_of_work(&self) -> bool {
        self.channel == CHANNEL_PRIME || self.channel == CHANNEL_HASH
    }
}

/// Arena of block index nodes keyed by hash.
#[derive(Debug, Default)]
pub struct BlockIndexMap {
    nodes: HashMap<Hash, BlockIndex>,
    genesis: Option<Hash>,
}

impl BlockIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node for `hash`, creating a placeholder if needed. The
    /// zero hash stands for "no block" and yields `None`.
    pub fn insert(&mut self, hash: Hash) -> Option<&mut BlockIndex> {
        if hash.is_zero() {
            return None;
        }
        Some(
            self.nodes
                .entry(hash)
                .or_insert_with(|| BlockIndex::placeholder(hash)),
        )
    }

    pub fn get(&self, hash: &Hash) -> Option<&BlockIndex> {
        self.nodes.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash) -> Option<&mut BlockIndex> {
        self.nodes.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn parent(&self, hash: &Hash) -> Option<&BlockIndex> {
        let prev = self.nodes.get(hash)?.prev?;
        self.nodes.get(&prev)
    }

    pub fn genesis(&self) -> Option<&BlockIndex> {
        self.nodes.get(self.genesis.as_ref()?)
    }

    pub fn genesis_hash(&self) -> Option<Hash> {
        self.genesis
    }

    pub fn set_genesis(&mut self, hash: Hash) {
        self.genesis = Some(hash);
    }

    /// Nearest block at or below `from` that was produced on `channel`.
    pub fn last_channel_index(&self, from: &Hash, channel: u32) -> Option<&BlockIndex> {
        let mut current = self.nodes.get(from);
        while let Some(node) = current {
            if node.channel == channel {
                return Some(node);
            }
            current = node.prev.and_then(|prev| self.nodes.get(&prev));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockIndex> {
        self.nodes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustchain_core::hash;

    fn link(map: &mut BlockIndexMap, child: &str, parent: Option<&str>, channel: u32) {
        let parent = parent.map(|p| hash(p.as_bytes()));
        let node = map.insert(hash(child.as_bytes())).unwrap();
        node.prev = parent;
        node.channel = channel;
        node.loaded = true;
    }

    #[test]
    fn test_zero_hash_is_no_block() {
        let mut map = BlockIndexMap::new();
        assert!(map.insert(Hash::ZERO).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_placeholders_are_shared() {
        let mut map = BlockIndexMap::new();
        map.insert(hash(b"a")).unwrap();
        map.insert(hash(b"a")).unwrap().height = 7;
        assert_eq!(map.len(), 1);
        assert!(!map.get(&hash(b"a")).unwrap().loaded);
        assert_eq!(map.get(&hash(b"a")).unwrap().height, 7);
    }

    #[test]
    fn test_fill_from_disk_record() {
        let disk = DiskBlockIndex {
            hash_prev: hash(b"parent"),
            hash_next: Hash::ZERO,
            file: 1,
            block_pos: 4,
            mint: 10,
            money_supply: 100,
            flags: 0,
            version: 1,
            merkle_root: hash(b"root"),
            channel: CHANNEL_PRIME,
            height: 4,
            bits: 9,
            nonce: 3,
            time: 77,
        };
        let mut node = BlockIndex::placeholder(hash(b"child"));
        node.fill(&disk);
        assert!(node.loaded);
        assert_eq!(node.prev, Some(hash(b"parent")));
        assert_eq!(node.next, None);
        assert_eq!(node.pos(), BlockPos::new(1, 4));
        assert!(node.is_proof_of_work());
    }

    #[test]
    fn test_unknown_channel_is_neither_work_nor_stake() {
        let mut node = BlockIndex::placeholder(hash(b"odd"));
        node.channel = 7;
        assert!(!node.is_proof_of_work());
        assert!(!node.is_proof_of_stake());

        node.channel = CHANNEL_HASH;
        assert!(node.is_proof_of_work());
        node.channel = CHANNEL_STAKE;
        assert!(node.is_proof_of_stake());
    }

    #[test]
    fn test_last_channel_index() {
        let mut map = BlockIndexMap::new();
        link(&mut map, "g", None, CHANNEL_STAKE);
        link(&mut map, "1", Some("g"), CHANNEL_PRIME);
        link(&mut map, "2", Some("1"), CHANNEL_HASH);
        link(&mut map, "3", Some("2"), CHANNEL_HASH);

        let found = map.last_channel_index(&hash(b"3"), CHANNEL_PRIME).unwrap();
        assert_eq!(found.hash, hash(b"1"));
        let found = map.last_channel_index(&hash(b"3"), CHANNEL_HASH).unwrap();
        assert_eq!(found.hash, hash(b"3"));
        assert!(map.last_channel_index(&hash(b"1"), CHANNEL_HASH).is_none());

        assert_eq!(map.parent(&hash(b"2")).unwrap().hash, hash(b"1"));
        assert!(map.parent(&hash(b"g")).is_none());
    }
}
