//! Rolling the best chain back to an earlier block.

use crate::connect::TxIndexOverlay;
use crate::error::{ChainError, Result};
use crate::index::BlockIndexMap;
use crate::rules::BestChainWriter;
use tracing::{info, warn};
use trustchain_core::{Block, BlockPos, DiskTxPos, Hash};
use trustchain_storage::{BlockReader, TxDb};

/// Best-chain writer that disconnects every block above the target: inputs
/// are marked unspent again, the blocks' own transaction index and owner
/// records are erased, next links above the target are cleared, and
/// `hashBestChain` is pointed at the target. All writes commit together.
#[derive(Debug, Default)]
pub struct IndexRewinder {
    disconnected: Vec<Hash>,
}

impl IndexRewinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks disconnected by the last rewind, highest first.
    pub fn disconnected(&self) -> &[Hash] {
        &self.disconnected
    }

    fn disconnect_all(
        &mut self,
        txdb: &TxDb,
        reader: &dyn BlockReader,
        index: &BlockIndexMap,
        target: Hash,
    ) -> Result<Vec<Hash>> {
        let best = txdb
            .read_hash_best_chain()?
            .ok_or(ChainError::MissingBestChain)?;
        let mut overlay = TxIndexOverlay::new(txdb);
        let mut unlinked = Vec::new();
        let mut current = best;

        while current != target {
            let node = index
                .get(&current)
                .ok_or(ChainError::BestChainNotIndexed(current))?;
            let Some(prev) = node.prev else {
                return Err(ChainError::BrokenChain {
                    height: node.height,
                    hash: current,
                });
            };
            let block = reader
                .read_block(node.pos())
                .map_err(|source| ChainError::BlockUnreadable {
                    hash: current,
                    source,
                })?;
            disconnect_block(txdb, &mut overlay, &block, node.pos())?;
            self.disconnected.push(current);
            unlinked.push(prev);
            current = prev;
        }
        overlay.apply()?;

        for hash in &unlinked {
            if let Some(mut record) = txdb.read_block_index(hash)? {
                record.hash_next = Hash::ZERO;
                txdb.write_block_index(&record)?;
            }
        }
        txdb.write_hash_best_chain(&target)?;
        Ok(unlinked)
    }
}

impl BestChainWriter for IndexRewinder {
    fn set_best_chain(
        &mut self,
        txdb: &TxDb,
        reader: &dyn BlockReader,
        index: &mut BlockIndexMap,
        block: &Block,
    ) -> Result<()> {
        let target = block.hash();
        self.disconnected.clear();

        txdb.txn_begin()?;
        let unlinked = match self.disconnect_all(txdb, reader, index, target) {
            Ok(unlinked) => {
                txdb.txn_commit()?;
                unlinked
            }
            Err(e) => {
                txdb.txn_abort();
                warn!(error = %e, "rolling back the best chain failed");
                return Err(e);
            }
        };

        for hash in unlinked {
            if let Some(node) = index.get_mut(&hash) {
                node.next = None;
            }
        }
        info!(
            height = block.height(),
            hash = %target.short(),
            disconnected = self.disconnected.len(),
            "best chain moved back"
        );
        Ok(())
    }
}

fn disconnect_block(
    txdb: &TxDb,
    overlay: &mut TxIndexOverlay<'_>,
    block: &Block,
    pos: BlockPos,
) -> Result<()> {
    for (n, tx) in block.transactions.iter().enumerate().rev() {
        let tx_pos = pos.tx(n as u32);
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let Some(mut prev) = overlay.read(&input.prevout.hash)? else {
                    continue;
                };
                if let Some(slot) = prev.spent.get_mut(input.prevout.n as usize) {
                    *slot = DiskTxPos::null();
                    overlay.write(input.prevout.hash, prev);
                }
            }
        }
        overlay.erase(tx.hash());

        for out in &tx.outputs {
            if let Some(recipient) = out.recipient {
                txdb.erase_owner_tx(&recipient.owner_hash(), tx_pos)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::connect_block;
    use crate::index::BlockIndex;
    use trustchain_core::{Address, OutPoint, Transaction, TxIn, TxOut, CHANNEL_HASH};
    use trustchain_storage::{BlockStore, Environment};

    #[test]
    fn test_rewind_disconnects_blocks_above_target() {
        let env = Environment::open_temporary().unwrap();
        let txdb = TxDb::open(&env, "r+").unwrap();
        let blocks = BlockStore::open(&env).unwrap();
        let alice = Address([0xA1; 20]);

        let mut index = BlockIndexMap::new();
        let mut chain = Vec::new();
        let mut prev = Hash::ZERO;
        let mut prev_coinbase = None;
        for height in 0..3u32 {
            let coinbase = Transaction::coinbase(height, height, vec![TxOut::to(50, alice)]);
            let mut txs = vec![coinbase.clone()];
            if let Some(spent) = prev_coinbase {
                txs.push(Transaction::new(
                    height,
                    vec![TxIn::new(OutPoint::new(spent, 0))],
                    vec![TxOut::new(50, None)],
                ));
            }
            let block = Block::new(prev, height, CHANNEL_HASH, height * 60, 1, txs);
            let pos = connect_block(&txdb, &blocks, &block).unwrap();

            let mut node = BlockIndex::placeholder(block.hash());
            node.fill(&trustchain_core::DiskBlockIndex::from_header(&block.header, pos));
            *index.insert(block.hash()).unwrap() = node;
            if let Some(parent) = index.get_mut(&prev) {
                parent.next = Some(block.hash());
            }

            prev = block.hash();
            prev_coinbase = Some(coinbase.hash());
            chain.push(block);
        }

        let mut rewinder = IndexRewinder::new();
        rewinder
            .set_best_chain(&txdb, &blocks, &mut index, &chain[0])
            .unwrap();

        assert_eq!(rewinder.disconnected(), &[chain[2].hash(), chain[1].hash()]);
        assert_eq!(txdb.read_hash_best_chain().unwrap(), Some(chain[0].hash()));
        assert_eq!(index.get(&chain[0].hash()).unwrap().next, None);

        let genesis_cb = chain[0].transactions[0].hash();
        let entry = txdb.read_tx_index(&genesis_cb).unwrap().unwrap();
        assert!(!entry.is_spent(0));
        assert!(!txdb.contains_tx(&chain[1].transactions[0].hash()).unwrap());
        assert!(!txdb.contains_tx(&chain[2].transactions[1].hash()).unwrap());

        let record = txdb.read_block_index(&chain[0].hash()).unwrap().unwrap();
        assert!(record.hash_next.is_zero());

        let owned = txdb.read_owner_txes(&alice.owner_hash(), 0, &blocks).unwrap();
        assert_eq!(owned, vec![chain[0].transactions[0].clone()]);
    }
}
