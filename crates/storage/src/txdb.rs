//! Typed access to the block index file.

use crate::blocks::BlockReader;
use crate::db::{decode_value, Cursor, Database, Result, StorageError};
use crate::env::Environment;
use crate::keys::{tag, RecordKey};
use crate::registry::{OpenMode, BLOCK_INDEX_FILE};
use std::sync::Arc;
use tracing::debug;
use trustchain_core::{ChainTrust, DiskBlockIndex, DiskTxPos, Hash, Transaction, TxIndex};

/// Transaction index, block index, and chain pointers stored in
/// `blkindex.dat`.
pub struct TxDb {
    db: Database,
}

impl TxDb {
    /// Open the block index file, creating it unless `mode` is read-only.
    pub fn open(env: &Arc<Environment>, mode: impl Into<OpenMode>) -> Result<Self> {
        let mut mode = mode.into();
        if !mode.read_only {
            mode.create = true;
        }
        Ok(Self {
            db: Database::open(env, BLOCK_INDEX_FILE, mode)?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn env(&self) -> &Arc<Environment> {
        self.db.env()
    }

    // =========================================================================
    // Transaction Index
    // =========================================================================

    pub fn read_tx_index(&self, hash: &Hash) -> Result<Option<TxIndex>> {
        self.db.get(&RecordKey::Tx(*hash))
    }

    pub fn update_tx_index(&self, hash: &Hash, index: &TxIndex) -> Result<bool> {
        self.db.put(&RecordKey::Tx(*hash), index, true)
    }

    /// Index a newly connected transaction with all outputs unspent.
    pub fn add_tx_index(&self, tx: &Transaction, pos: DiskTxPos) -> Result<bool> {
        let index = TxIndex::new(pos, tx.outputs.len());
        self.db.put(&RecordKey::Tx(tx.hash()), &index, true)
    }

    pub fn erase_tx_index(&self, hash: &Hash) -> Result<bool> {
        self.db.erase(&RecordKey::Tx(*hash))
    }

    pub fn contains_tx(&self, hash: &Hash) -> Result<bool> {
        self.db.exists(&RecordKey::Tx(*hash))
    }

    /// Load a transaction through its index entry. `Ok(None)` if the
    /// transaction is not indexed.
    pub fn read_disk_tx(
        &self,
        hash: &Hash,
        reader: &dyn BlockReader,
    ) -> Result<Option<(Transaction, TxIndex)>> {
        let Some(index) = self.read_tx_index(hash)? else {
            return Ok(None);
        };
        let tx = reader.read_transaction(index.pos)?;
        Ok(Some((tx, index)))
    }

    // =========================================================================
    // Owner Records
    // =========================================================================

    /// Record that `owner` is involved in the transaction at `pos`, mined at
    /// `height`.
    pub fn add_owner_tx(&self, owner: &Hash, pos: DiskTxPos, height: u32) -> Result<bool> {
        let key = RecordKey::Owner { owner: *owner, pos };
        self.db.put(&key, &height, true)
    }

    pub fn erase_owner_tx(&self, owner: &Hash, pos: DiskTxPos) -> Result<bool> {
        self.db.erase(&RecordKey::Owner { owner: *owner, pos })
    }

    /// Every transaction of `owner` mined at `min_height` or above, in
    /// locator order.
    ///
    /// Returns [`StorageError::Cancelled`] if shutdown is requested during
    /// the scan.
    pub fn read_owner_txes(
        &self,
        owner: &Hash,
        min_height: u32,
        reader: &dyn BlockReader,
    ) -> Result<Vec<Transaction>> {
        let shutdown = self.env().shutdown_signal();
        let mut cursor = self.db.cursor()?;
        cursor.seek(&RecordKey::Owner {
            owner: *owner,
            pos: DiskTxPos::new(0, 0, 0),
        });

        let mut found = Vec::new();
        while let Some((key, value)) = cursor.read_next()? {
            if shutdown.is_requested() {
                return Err(StorageError::Cancelled);
            }
            if RecordKey::peek_tag(&key) != Some(tag::OWNER) {
                break;
            }
            let RecordKey::Owner { owner: found_owner, pos } = RecordKey::decode(&key)? else {
                break;
            };
            if found_owner != *owner {
                break;
            }

            let height: u32 = decode_value(&value)?;
            if height >= min_height {
                found.push(reader.read_transaction(pos)?);
            }
        }
        debug!(owner = %owner.short(), count = found.len(), "owner scan");
        Ok(found)
    }

    // =========================================================================
    // Block Index
    // =========================================================================

    pub fn read_block_index(&self, hash: &Hash) -> Result<Option<DiskBlockIndex>> {
        self.db.get(&RecordKey::BlockIndex(*hash))
    }

    pub fn write_block_index(&self, index: &DiskBlockIndex) -> Result<bool> {
        self.db
            .put(&RecordKey::BlockIndex(index.block_hash()), index, true)
    }

    pub fn erase_block_index(&self, hash: &Hash) -> Result<bool> {
        self.db.erase(&RecordKey::BlockIndex(*hash))
    }

    /// Cursor positioned at the first block index record.
    pub fn block_index_cursor(&self) -> Result<Cursor> {
        let mut cursor = self.db.cursor()?;
        cursor.seek(&RecordKey::tag_prefix(tag::BLOCK_INDEX));
        Ok(cursor)
    }

    // =========================================================================
    // Chain Pointers
    // =========================================================================

    pub fn read_hash_best_chain(&self) -> Result<Option<Hash>> {
        self.db.get(&RecordKey::HashBestChain)
    }

    pub fn write_hash_best_chain(&self, hash: &Hash) -> Result<bool> {
        self.db.put(&RecordKey::HashBestChain, hash, true)
    }

    pub fn read_best_invalid_trust(&self) -> Result<Option<ChainTrust>> {
        self.db.get(&RecordKey::BestInvalidTrust)
    }

    pub fn write_best_invalid_trust(&self, trust: ChainTrust) -> Result<bool> {
        self.db.put(&RecordKey::BestInvalidTrust, &trust, true)
    }

    pub fn read_checkpoint_pubkey(&self) -> Result<Option<String>> {
        self.db.get(&RecordKey::CheckpointPubKey)
    }

    pub fn write_checkpoint_pubkey(&self, pubkey: &str) -> Result<bool> {
        self.db.put(&RecordKey::CheckpointPubKey, pubkey, true)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn txn_begin(&self) -> Result<bool> {
        self.db.txn_begin()
    }

    pub fn txn_commit(&self) -> Result<bool> {
        self.db.txn_commit()
    }

    pub fn txn_abort(&self) -> bool {
        self.db.txn_abort()
    }

    pub fn close(&mut self) {
        self.db.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockStore;
    use trustchain_core::{hash, Address, Block, TxOut, CHANNEL_PRIME};

    fn setup() -> (Arc<Environment>, TxDb, BlockStore) {
        let env = Environment::open_temporary().unwrap();
        let txdb = TxDb::open(&env, "r+").unwrap();
        let blocks = BlockStore::open(&env).unwrap();
        (env, txdb, blocks)
    }

    fn block_with(outputs: Vec<TxOut>, height: u32) -> Block {
        let coinbase = Transaction::coinbase(height, height, outputs);
        Block::new(Hash::ZERO, height, CHANNEL_PRIME, height, 1, vec![coinbase])
    }

    #[test]
    fn test_tx_index_lifecycle() {
        let (_env, txdb, blocks) = setup();
        let block = block_with(vec![TxOut::new(5, None), TxOut::new(6, None)], 0);
        let pos = blocks.write_block(&block).unwrap().tx(0);
        let tx = &block.transactions[0];

        assert!(!txdb.contains_tx(&tx.hash()).unwrap());
        txdb.add_tx_index(tx, pos).unwrap();
        assert!(txdb.contains_tx(&tx.hash()).unwrap());

        let mut index = txdb.read_tx_index(&tx.hash()).unwrap().unwrap();
        assert_eq!(index.pos, pos);
        assert_eq!(index.spent.len(), 2);
        assert!(!index.is_spent(1));

        index.spent[1] = DiskTxPos::new(1, 9, 0);
        txdb.update_tx_index(&tx.hash(), &index).unwrap();
        let (loaded, stored) = txdb.read_disk_tx(&tx.hash(), &blocks).unwrap().unwrap();
        assert_eq!(&loaded, tx);
        assert!(stored.is_spent(1));

        assert!(txdb.erase_tx_index(&tx.hash()).unwrap());
        assert!(txdb.read_disk_tx(&tx.hash(), &blocks).unwrap().is_none());
    }

    #[test]
    fn test_chain_pointers() {
        let (_env, txdb, _blocks) = setup();
        assert_eq!(txdb.read_hash_best_chain().unwrap(), None);
        assert_eq!(txdb.read_best_invalid_trust().unwrap(), None);

        txdb.write_hash_best_chain(&hash(b"tip")).unwrap();
        txdb.write_best_invalid_trust(1 << 70).unwrap();
        txdb.write_checkpoint_pubkey("04abcdef").unwrap();

        assert_eq!(txdb.read_hash_best_chain().unwrap(), Some(hash(b"tip")));
        assert_eq!(txdb.read_best_invalid_trust().unwrap(), Some(1 << 70));
        assert_eq!(
            txdb.read_checkpoint_pubkey().unwrap().as_deref(),
            Some("04abcdef")
        );
    }

    #[test]
    fn test_block_index_roundtrip() {
        let (_env, txdb, blocks) = setup();
        let block = block_with(vec![TxOut::new(1, None)], 3);
        let pos = blocks.write_block(&block).unwrap();
        let index = DiskBlockIndex::from_header(&block.header, pos);

        txdb.write_block_index(&index).unwrap();
        assert_eq!(txdb.read_block_index(&block.hash()).unwrap(), Some(index));

        let mut cursor = txdb.block_index_cursor().unwrap();
        let (key, _) = cursor.read_next().unwrap().unwrap();
        assert_eq!(RecordKey::decode(&key).unwrap(), RecordKey::BlockIndex(block.hash()));

        assert!(txdb.erase_block_index(&block.hash()).unwrap());
        assert_eq!(txdb.read_block_index(&block.hash()).unwrap(), None);
    }

    #[test]
    fn test_owner_range_query() {
        let (_env, txdb, blocks) = setup();
        let alice = Address([0xAA; 20]);
        let bob = Address([0xBB; 20]);

        let mut alice_txes = Vec::new();
        for height in 0..4 {
            let block = block_with(vec![TxOut::to(10 + u64::from(height), alice)], height);
            let pos = blocks.write_block(&block).unwrap().tx(0);
            txdb.add_owner_tx(&alice.owner_hash(), pos, height).unwrap();
            alice_txes.push(block.transactions[0].clone());
        }
        let block = block_with(vec![TxOut::to(99, bob)], 9);
        let pos = blocks.write_block(&block).unwrap().tx(0);
        txdb.add_owner_tx(&bob.owner_hash(), pos, 9).unwrap();

        let all = txdb.read_owner_txes(&alice.owner_hash(), 0, &blocks).unwrap();
        assert_eq!(all, alice_txes);

        let recent = txdb.read_owner_txes(&alice.owner_hash(), 2, &blocks).unwrap();
        assert_eq!(recent, alice_txes[2..].to_vec());

        let nobody = txdb
            .read_owner_txes(&Address([0x01; 20]).owner_hash(), 0, &blocks)
            .unwrap();
        assert!(nobody.is_empty());
    }

    #[test]
    fn test_owner_scan_corrupt_height() {
        let (_env, txdb, blocks) = setup();
        let owner = hash(b"owner");
        let key = RecordKey::Owner {
            owner,
            pos: DiskTxPos::new(1, 0, 0),
        };
        txdb.database().put(&key, &1u8, true).unwrap();

        assert!(matches!(
            txdb.read_owner_txes(&owner, 0, &blocks),
            Err(StorageError::Deserialize(_))
        ));
    }

    #[test]
    fn test_owner_scan_cancelled() {
        let (env, txdb, blocks) = setup();
        let owner = hash(b"owner");
        txdb.add_owner_tx(&owner, DiskTxPos::new(1, 0, 0), 0).unwrap();
        env.shutdown_signal().request();

        assert!(matches!(
            txdb.read_owner_txes(&owner, 0, &blocks),
            Err(StorageError::Cancelled)
        ));
    }
}
