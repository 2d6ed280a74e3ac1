//! Block bodies on disk.

use crate::db::{Database, Result, StorageError};
use crate::env::Environment;
use crate::keys::{tag, RecordKey};
use parking_lot::Mutex;
use std::sync::Arc;
use trustchain_core::{Block, BlockPos, DiskTxPos, Transaction};

/// Logical file holding block bodies.
pub const BLOCK_FILE: &str = "blk0001.dat";

/// File number stamped into every locator handed out by [`BlockStore`].
pub const BLOCK_FILE_NUMBER: u32 = 1;

/// Loads blocks and transactions by disk locator.
pub trait BlockReader {
    fn read_block(&self, pos: BlockPos) -> Result<Block>;

    fn read_transaction(&self, pos: DiskTxPos) -> Result<Transaction> {
        let block = self.read_block(pos.block())?;
        block
            .transactions
            .into_iter()
            .nth(pos.tx_pos as usize)
            .ok_or(StorageError::TxNotFound(pos))
    }
}

/// Append-only store of block bodies keyed by [`BlockPos`].
pub struct BlockStore {
    db: Database,
    append: Mutex<()>,
}

impl BlockStore {
    pub fn open(env: &Arc<Environment>) -> Result<Self> {
        Ok(Self {
            db: Database::open(env, BLOCK_FILE, "cr+")?,
            append: Mutex::new(()),
        })
    }

    /// Append a block and return where it was written.
    pub fn write_block(&self, block: &Block) -> Result<BlockPos> {
        let _guard = self.append.lock();
        let pos = self.next_pos()?;
        if !self.db.put(&RecordKey::Block(pos), block, false)? {
            return Err(StorageError::Deserialize(format!(
                "block slot {pos:?} already taken"
            )));
        }
        Ok(pos)
    }

    /// Number of blocks stored.
    pub fn len(&self) -> Result<u32> {
        Ok(self.next_pos()?.block_pos)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn next_pos(&self) -> Result<BlockPos> {
        let prefix = RecordKey::tag_prefix(tag::BLOCK);
        let next = match self.db.last_key_with_prefix(&prefix)? {
            Some(key) => match RecordKey::decode(&key)? {
                RecordKey::Block(last) => last.block_pos + 1,
                other => {
                    return Err(StorageError::Deserialize(format!(
                        "unexpected key {other:?} in block file"
                    )))
                }
            },
            None => 0,
        };
        Ok(BlockPos::new(BLOCK_FILE_NUMBER, next))
    }
}

impl BlockReader for BlockStore {
    fn read_block(&self, pos: BlockPos) -> Result<Block> {
        self.db
            .get(&RecordKey::Block(pos))?
            .ok_or(StorageError::BlockNotFound(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustchain_core::{Address, Hash, TxOut, CHANNEL_HASH};

    fn block(height: u32) -> Block {
        let coinbase = Transaction::coinbase(height, height, vec![TxOut::to(10, Address([7; 20]))]);
        let spend = Transaction::new(height, vec![], vec![TxOut::new(3, None)]);
        Block::new(Hash::ZERO, height, CHANNEL_HASH, height, 1, vec![coinbase, spend])
    }

    #[test]
    fn test_write_and_read_blocks() {
        let env = Environment::open_temporary().unwrap();
        let store = BlockStore::open(&env).unwrap();
        assert!(store.is_empty().unwrap());

        let first = store.write_block(&block(0)).unwrap();
        let second = store.write_block(&block(1)).unwrap();
        assert_eq!(first, BlockPos::new(BLOCK_FILE_NUMBER, 0));
        assert_eq!(second, BlockPos::new(BLOCK_FILE_NUMBER, 1));
        assert_eq!(store.len().unwrap(), 2);

        assert_eq!(store.read_block(second).unwrap(), block(1));
    }

    #[test]
    fn test_read_transaction_by_locator() {
        let env = Environment::open_temporary().unwrap();
        let store = BlockStore::open(&env).unwrap();
        let pos = store.write_block(&block(4)).unwrap();

        let tx = store.read_transaction(pos.tx(1)).unwrap();
        assert_eq!(tx, block(4).transactions[1]);

        assert!(matches!(
            store.read_transaction(pos.tx(2)),
            Err(StorageError::TxNotFound(_))
        ));
    }

    #[test]
    fn test_missing_block() {
        let env = Environment::open_temporary().unwrap();
        let store = BlockStore::open(&env).unwrap();
        assert!(matches!(
            store.read_block(BlockPos::new(BLOCK_FILE_NUMBER, 9)),
            Err(StorageError::BlockNotFound(_))
        ));
    }

    #[test]
    fn test_positions_survive_reopen() {
        let env = Environment::open_temporary().unwrap();
        {
            let store = BlockStore::open(&env).unwrap();
            store.write_block(&block(0)).unwrap();
        }
        let store = BlockStore::open(&env).unwrap();
        assert_eq!(
            store.write_block(&block(1)).unwrap(),
            BlockPos::new(BLOCK_FILE_NUMBER, 1)
        );
    }
}
