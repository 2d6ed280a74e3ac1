//! Writing blocks into the index files.

use crate::error::Result;
use std::collections::BTreeMap;
use tracing::debug;
use trustchain_core::{Block, BlockPos, DiskBlockIndex, Hash, TxIndex};
use trustchain_storage::{BlockStore, TxDb};

/// Pending transaction index changes, read through to the store.
///
/// Writes inside a held storage transaction are not visible to reads, so
/// every change is collected here and written out once at the end.
pub(crate) struct TxIndexOverlay<'a> {
    txdb: &'a TxDb,
    pending: BTreeMap<Hash, Option<TxIndex>>,
}

impl<'a> TxIndexOverlay<'a> {
    pub(crate) fn new(txdb: &'a TxDb) -> Self {
        Self {
            txdb,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn read(&self, hash: &Hash) -> Result<Option<TxIndex>> {
        match self.pending.get(hash) {
            Some(entry) => Ok(entry.clone()),
            None => Ok(self.txdb.read_tx_index(hash)?),
        }
    }

    pub(crate) fn write(&mut self, hash: Hash, index: TxIndex) {
        self.pending.insert(hash, Some(index));
    }

    pub(crate) fn erase(&mut self, hash: Hash) {
        self.pending.insert(hash, None);
    }

    pub(crate) fn apply(self) -> Result<()> {
        for (hash, entry) in self.pending {
            match entry {
                Some(index) => self.txdb.update_tx_index(&hash, &index)?,
                None => self.txdb.erase_tx_index(&hash)?,
            };
        }
        Ok(())
    }
}

/// Store `block` and connect it on top of the current best chain: index its
/// transactions, mark the outputs they spend, record owners, write the block
/// index record, link the parent to it, and move `hashBestChain`.
pub fn connect_block(txdb: &TxDb, blocks: &BlockStore, block: &Block) -> Result<BlockPos> {
    let pos = blocks.write_block(block)?;
    let hash = block.hash();

    txdb.txn_begin()?;
    match write_connection(txdb, block, pos) {
        Ok(()) => {
            txdb.txn_commit()?;
            debug!(height = block.height(), hash = %hash.short(), "connected block");
            Ok(pos)
        }
        Err(e) => {
            txdb.txn_abort();
            Err(e)
        }
    }
}

fn write_connection(txdb: &TxDb, block: &Block, pos: BlockPos) -> Result<()> {
    let hash = block.hash();
    let mut overlay = TxIndexOverlay::new(txdb);

    for (n, tx) in block.transactions.iter().enumerate() {
        let tx_pos = pos.tx(n as u32);
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let Some(mut prev) = overlay.read(&input.prevout.hash)? else {
                    continue;
                };
                if let Some(slot) = prev.spent.get_mut(input.prevout.n as usize) {
                    *slot = tx_pos;
                    overlay.write(input.prevout.hash, prev);
                }
            }
        }
        overlay.write(tx.hash(), TxIndex::new(tx_pos, tx.outputs.len()));

        for out in &tx.outputs {
            if let Some(recipient) = out.recipient {
                txdb.add_owner_tx(&recipient.owner_hash(), tx_pos, block.height())?;
            }
        }
    }
    overlay.apply()?;

    let mint = block
        .coinbase()
        .map_or(0, |coinbase| i64::try_from(coinbase.value_out()).unwrap_or(i64::MAX));
    let mut record = DiskBlockIndex::from_header(&block.header, pos);
    record.mint = mint;
    record.money_supply = mint;

    if let Some(mut parent) = txdb.read_block_index(&block.header.prev_hash)? {
        record.money_supply = parent.money_supply.saturating_add(mint);
        parent.hash_next = hash;
        txdb.write_block_index(&parent)?;
    }
    txdb.write_block_index(&record)?;
    txdb.write_hash_best_chain(&hash)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustchain_core::{Address, OutPoint, Transaction, TxIn, TxOut, CHANNEL_HASH};
    use trustchain_storage::{BlockReader, Environment};

    #[test]
    fn test_connect_indexes_and_spends() {
        let env = Environment::open_temporary().unwrap();
        let txdb = TxDb::open(&env, "r+").unwrap();
        let blocks = BlockStore::open(&env).unwrap();
        let alice = Address([0xA1; 20]);
        let bob = Address([0xB0; 20]);

        let genesis_cb = Transaction::coinbase(0, 0, vec![TxOut::to(50, alice)]);
        let genesis = Block::new(Hash::ZERO, 0, CHANNEL_HASH, 0, 1, vec![genesis_cb.clone()]);
        let genesis_pos = connect_block(&txdb, &blocks, &genesis).unwrap();

        let cb = Transaction::coinbase(1, 1, vec![TxOut::to(50, bob)]);
        let pay = Transaction::new(
            1,
            vec![TxIn::new(OutPoint::new(genesis_cb.hash(), 0))],
            vec![TxOut::to(50, bob)],
        );
        let child = Block::new(genesis.hash(), 1, CHANNEL_HASH, 60, 1, vec![cb, pay.clone()]);
        let child_pos = connect_block(&txdb, &blocks, &child).unwrap();

        assert_eq!(txdb.read_hash_best_chain().unwrap(), Some(child.hash()));

        let spent = txdb.read_tx_index(&genesis_cb.hash()).unwrap().unwrap();
        assert_eq!(spent.pos, genesis_pos.tx(0));
        assert_eq!(spent.spent[0], child_pos.tx(1));

        let parent = txdb.read_block_index(&genesis.hash()).unwrap().unwrap();
        assert_eq!(parent.hash_next, child.hash());
        let record = txdb.read_block_index(&child.hash()).unwrap().unwrap();
        assert_eq!(record.hash_prev, genesis.hash());
        assert_eq!(record.money_supply, 100);

        let bob_txes = txdb.read_owner_txes(&bob.owner_hash(), 0, &blocks).unwrap();
        assert_eq!(bob_txes.len(), 2);
        assert_eq!(blocks.read_transaction(child_pos.tx(1)).unwrap(), pay);
    }
}
