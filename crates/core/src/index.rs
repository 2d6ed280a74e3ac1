//! On-disk locators and index records.

use crate::block::BlockHeader;
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cumulative chain trust.
pub type ChainTrust = u128;

/// Location of a block body: block file number and position inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub file: u32,
    pub block_pos: u32,
}

impl BlockPos {
    pub fn new(file: u32, block_pos: u32) -> Self {
        Self { file, block_pos }
    }

    /// Locator of the `tx_pos`-th transaction of this block.
    pub fn tx(&self, tx_pos: u32) -> DiskTxPos {
        DiskTxPos::new(self.file, self.block_pos, tx_pos)
    }
}

/// Location of a transaction: its block plus its slot within the block.
///
/// The null locator (`file == u32::MAX`) marks an unspent output in
/// [`TxIndex::spent`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskTxPos {
    pub file: u32,
    pub block_pos: u32,
    pub tx_pos: u32,
}

impl DiskTxPos {
    pub fn new(file: u32, block_pos: u32, tx_pos: u32) -> Self {
        Self {
            file,
            block_pos,
            tx_pos,
        }
    }

    pub fn null() -> Self {
        Self::new(u32::MAX, 0, 0)
    }

    pub fn is_null(&self) -> bool {
        self.file == u32::MAX
    }

    pub fn block(&self) -> BlockPos {
        BlockPos::new(self.file, self.block_pos)
    }
}

impl Default for DiskTxPos {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for DiskTxPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "DiskTxPos(null)")
        } else {
            write!(
                f,
                "DiskTxPos({}:{}:{})",
                self.file, self.block_pos, self.tx_pos
            )
        }
    }
}

/// Index entry of a transaction: where it lives and who spent each output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIndex {
    pub pos: DiskTxPos,
    /// One locator per output; null means unspent.
    pub spent: Vec<DiskTxPos>,
}

impl TxIndex {
    pub fn new(pos: DiskTxPos, outputs: usize) -> Self {
        Self {
            pos,
            spent: vec![DiskTxPos::null(); outputs],
        }
    }

    /// Whether output `n` is recorded as spent. Out-of-range outputs count
    /// as unspent.
    pub fn is_spent(&self, n: u32) -> bool {
        self.spent
            .get(n as usize)
            .is_some_and(|pos| !pos.is_null())
    }
}

/// Persisted form of a block index node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBlockIndex {
    pub hash_prev: Hash,
    pub hash_next: Hash,
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
}

impl DiskBlockIndex {
    /// Index record for a block stored at `pos`. The next link starts empty.
    pub fn from_header(header: &BlockHeader, pos: BlockPos) -> Self {
        Self {
            hash_prev: header.prev_hash,
            hash_next: Hash::ZERO,
            file: pos.file,
            block_pos: pos.block_pos,
            mint: 0,
            money_supply: 0,
            flags: 0,
            version: header.version,
            merkle_root: header.merkle_root,
            channel: header.channel,
            height: header.height,
            bits: header.bits,
            nonce: header.nonce,
            time: header.time,
        }
    }

    /// Rebuild the header this record was taken from.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash: self.hash_prev,
            merkle_root: self.merkle_root,
            channel: self.channel,
            height: self.height,
            bits: self.bits,
            nonce: self.nonce,
            time: self.time,
        }
    }

    pub fn block_hash(&self) -> Hash {
        self.header().hash()
    }

    pub fn pos(&self) -> BlockPos {
        BlockPos::new(self.file, self.block_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, CHANNEL_HASH};

    #[test]
    fn test_null_locator() {
        assert!(DiskTxPos::null().is_null());
        assert!(!DiskTxPos::new(1, 0, 0).is_null());
        assert_eq!(DiskTxPos::default(), DiskTxPos::null());
    }

    #[test]
    fn test_tx_index_spent_tracking() {
        let mut index = TxIndex::new(DiskTxPos::new(1, 4, 0), 2);
        assert!(!index.is_spent(0));
        assert!(!index.is_spent(5));

        index.spent[1] = DiskTxPos::new(1, 9, 2);
        assert!(index.is_spent(1));
    }

    #[test]
    fn test_disk_index_hash_matches_block() {
        let block = Block::new(Hash::ZERO, 0, CHANNEL_HASH, 1_000, 7, vec![]);
        let disk = DiskBlockIndex::from_header(&block.header, BlockPos::new(1, 0));
        assert_eq!(disk.block_hash(), block.hash());
        assert_eq!(disk.pos(), BlockPos::new(1, 0));
    }

    #[test]
    fn test_disk_index_bincode_roundtrip() {
        let block = Block::new(Hash::ZERO, 4, CHANNEL_HASH, 1_000, 7, vec![]);
        let mut disk = DiskBlockIndex::from_header(&block.header, BlockPos::new(1, 3));
        disk.hash_next = block.hash();
        let bytes = bincode::serialize(&disk).unwrap();
        let decoded: DiskBlockIndex = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, disk);
    }
}
