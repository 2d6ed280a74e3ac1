//! Rebuilding the block index from disk.
//!
//! Loading runs in four phases:
//!
//! 1. **Scan** every `blockindex` record into a [`BlockIndexMap`].
//! 2. **Anchor** on `hashBestChain`.
//! 3. **Walk forward** from genesis to the best block, deriving chain trust,
//!    rewards, reserves, channel heights, and pending checkpoints.
//! 4. **Verify** the most recent blocks and, if something is wrong, move the
//!    best chain back to just below the damage.

use crate::error::{ChainError, Result};
use crate::index::{BlockIndex, BlockIndexMap};
use crate::rewind::IndexRewinder;
use crate::rules::{BestChainWriter, ChainRules, StandardRules, TrustKeyPool, TrustPool};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use tracing::{debug, info, warn};
use trustchain_core::{Block, BlockPos, ChainTrust, DiskBlockIndex, DiskTxPos, Hash, Transaction};
use trustchain_storage::{decode_value, tag, BlockReader, RecordKey, ShutdownSignal, TxDb};

/// Which failing block decides the fork point when verification finds
/// several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkSelection {
    /// Roll back below the deepest failure.
    #[default]
    Lowest,
    /// Roll back below the most recent failure only.
    Highest,
}

impl FromStr for ForkSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(Self::Lowest),
            "highest" => Ok(Self::Highest),
            other => Err(format!("unknown fork selection: {other}")),
        }
    }
}

/// How much recent history to verify after loading.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Number of blocks below the best block to check.
    pub check_depth: u32,
    /// Thoroughness, 0 (read only) to 6 (follow every spend).
    pub check_level: u8,
    pub fork_selection: ForkSelection,
    /// Expected genesis hash. Without one, the first parentless record wins.
    pub genesis_hash: Option<Hash>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            check_depth: 100,
            check_level: 1,
            fork_selection: ForkSelection::default(),
            genesis_hash: None,
        }
    }
}

/// Outcome of a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub best_hash: Option<Hash>,
    pub best_height: u32,
    pub best_trust: ChainTrust,
    pub best_invalid_trust: ChainTrust,
    /// Block the best chain was moved back to, if verification failed.
    pub fork_point: Option<Hash>,
    pub verified_blocks: u32,
    /// Shutdown was requested before the load finished.
    pub cancelled: bool,
    /// Net value received per owner hash along the best chain.
    pub balances: BTreeMap<Hash, i64>,
}

/// Rebuilds the in-memory block index from `blkindex.dat`.
pub struct ChainIndexLoader<'a> {
    txdb: &'a TxDb,
    reader: &'a dyn BlockReader,
    config: VerifyConfig,
    rules: Box<dyn ChainRules + 'a>,
    trust_pool: Box<dyn TrustPool + 'a>,
    writer: Box<dyn BestChainWriter + 'a>,
    shutdown: ShutdownSignal,
    index: BlockIndexMap,
}

impl<'a> ChainIndexLoader<'a> {
    /// Loader with the standard rules, a fresh trust key pool, and the
    /// index rewinder as best-chain writer.
    pub fn new(txdb: &'a TxDb, reader: &'a dyn BlockReader, config: VerifyConfig) -> Self {
        Self {
            txdb,
            reader,
            config,
            rules: Box::new(StandardRules::new()),
            trust_pool: Box::new(TrustKeyPool::new()),
            writer: Box::new(IndexRewinder::new()),
            shutdown: txdb.env().shutdown_signal(),
            index: BlockIndexMap::new(),
        }
    }

    pub fn with_rules(mut self, rules: impl ChainRules + 'a) -> Self {
        self.rules = Box::new(rules);
        self
    }

    pub fn with_trust_pool(mut self, pool: impl TrustPool + 'a) -> Self {
        self.trust_pool = Box::new(pool);
        self
    }

    pub fn with_writer(mut self, writer: impl BestChainWriter + 'a) -> Self {
        self.writer = Box::new(writer);
        self
    }

    pub fn index(&self) -> &BlockIndexMap {
        &self.index
    }

    pub fn into_index(self) -> BlockIndexMap {
        self.index
    }

    /// Run all phases.
    pub fn load(&mut self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        if !self.scan()? {
            info!("block index load interrupted by shutdown");
            report.cancelled = true;
            return Ok(report);
        }

        let Some(best) = self.txdb.read_hash_best_chain()? else {
            if self.index.genesis_hash().is_none() {
                info!("block index is empty");
                return Ok(report);
            }
            return Err(ChainError::MissingBestChain);
        };
        if !self.index.contains(&best) {
            return Err(ChainError::BestChainNotIndexed(best));
        }
        report.best_hash = Some(best);

        if !self.walk_forward(best, &mut report)? {
            report.cancelled = true;
            return Ok(report);
        }
        self.anchor(best, &mut report);
        report.best_invalid_trust = self.txdb.read_best_invalid_trust()?.unwrap_or(0);
        info!(
            best = %best.short(),
            height = report.best_height,
            trust = %report.best_trust,
            "loaded block index"
        );

        let fork = self.verify(&mut report)?;
        if report.cancelled {
            return Ok(report);
        }
        if let Some(fork) = fork {
            self.rollback(fork, &mut report)?;
        }
        Ok(report)
    }

    // =========================================================================
    // Scan
    // =========================================================================

    /// Read every block index record. Returns `false` if interrupted.
    fn scan(&mut self) -> Result<bool> {
        let mut cursor = self.txdb.block_index_cursor()?;
        let mut records = 0usize;

        while let Some((key, value)) = cursor.read_next()? {
            if RecordKey::peek_tag(&key) != Some(tag::BLOCK_INDEX) {
                break;
            }
            if self.shutdown.is_requested() {
                return Ok(false);
            }
            let disk: DiskBlockIndex = decode_value(&value)?;
            let hash = disk.block_hash();

            self.index.insert(disk.hash_prev);
            self.index.insert(disk.hash_next);
            if let Some(node) = self.index.insert(hash) {
                node.fill(&disk);
            }

            if self.index.genesis_hash().is_none() {
                let is_genesis = match self.config.genesis_hash {
                    Some(genesis) => genesis == hash,
                    None => disk.hash_prev.is_zero(),
                };
                if is_genesis {
                    self.index.set_genesis(hash);
                }
            }
            records += 1;
        }
        debug!(records, nodes = self.index.len(), "scanned block index");
        Ok(true)
    }

    fn anchor(&self, best: Hash, report: &mut LoadReport) {
        if let Some(node) = self.index.get(&best) {
            report.best_height = node.height;
            report.best_trust = node.chain_trust;
        }
    }

    // =========================================================================
    // Walk Forward
    // =========================================================================

    /// Derive per-node fields from genesis up to `best`. Returns `false` if
    /// interrupted.
    fn walk_forward(&mut self, best: Hash, report: &mut LoadReport) -> Result<bool> {
        let mut current = self.index.genesis_hash().ok_or(ChainError::MissingGenesis)?;
        let mut visited = HashSet::new();

        loop {
            if self.shutdown.is_requested() {
                return Ok(false);
            }
            visited.insert(current);
            self.connect_node(current, &mut report.balances)?;
            if current == best {
                return Ok(true);
            }

            let node = self
                .index
                .get(&current)
                .ok_or(ChainError::BestChainNotIndexed(current))?;
            let broken = ChainError::BrokenChain {
                height: node.height,
                hash: current,
            };
            match node.next {
                Some(next) if !visited.contains(&next) => current = next,
                Some(next) => {
                    warn!(height = node.height, next = %next.short(), "next links form a cycle");
                    return Err(broken);
                }
                None => return Err(broken),
            }
        }
    }

    fn connect_node(&mut self, hash: Hash, balances: &mut BTreeMap<Hash, i64>) -> Result<()> {
        let mut node = self
            .index
            .get(&hash)
            .cloned()
            .ok_or(ChainError::BestChainNotIndexed(hash))?;
        let parent = node.prev.and_then(|prev| self.index.get(&prev)).cloned();

        node.coinbase_rewards = [0; 3];
        if parent.is_some() {
            let block = self.read_block(&node)?;
            if node.is_proof_of_work() {
                node.coinbase_rewards = coinbase_rewards(&block);
            } else if node.is_proof_of_stake() && !self.trust_pool.accept(&block) {
                return Err(ChainError::TrustKeyRejected(hash));
            }
            self.apply_balances(&block, balances, false)?;
        }

        let parent_trust = parent.as_ref().map_or(0, |p| p.chain_trust);
        node.chain_trust = parent_trust.saturating_add(self.rules.block_trust(&node));

        let channel_prev = node
            .prev
            .and_then(|prev| self.index.last_channel_index(&prev, node.channel))
            .map(|prev| (prev.channel_height, prev.released_reserve));
        node.channel_height = channel_prev.map_or(0, |(height, _)| height) + 1;

        for kind in 0..3 {
            node.released_reserve[kind] = match channel_prev {
                Some((_, reserve)) if node.is_proof_of_work() => {
                    let reward = i64::try_from(node.coinbase_rewards[kind]).unwrap_or(i64::MAX);
                    reserve[kind]
                        .saturating_add(self.rules.released_reserve(&node, kind))
                        .saturating_sub(reward)
                }
                _ => 0,
            };
        }

        node.pending_checkpoint = match &parent {
            Some(parent) if !self.rules.harden_checkpoint(&node, &self.index) => {
                parent.pending_checkpoint
            }
            _ => (node.height, hash),
        };

        if let Some(slot) = self.index.get_mut(&hash) {
            *slot = node;
        }
        Ok(())
    }

    /// Credit every output's owner and debit the owners of spent outputs, or
    /// the reverse when `undo` is set.
    fn apply_balances(
        &self,
        block: &Block,
        balances: &mut BTreeMap<Hash, i64>,
        undo: bool,
    ) -> Result<()> {
        let mut adjust = |owner: Hash, value: u64, credit: bool| {
            let balance = balances.entry(owner).or_insert(0);
            *balance = if credit != undo {
                balance.saturating_add(to_i64(value))
            } else {
                balance.saturating_sub(to_i64(value))
            };
        };

        for tx in &block.transactions {
            for out in &tx.outputs {
                if let Some(recipient) = out.recipient {
                    adjust(recipient.owner_hash(), out.value, true);
                }
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                let Some(index) = self.txdb.read_tx_index(&input.prevout.hash)? else {
                    continue;
                };
                let Ok(prev) = self.reader.read_transaction(index.pos) else {
                    continue;
                };
                let Some(out) = prev.outputs.get(input.prevout.n as usize) else {
                    continue;
                };
                if let Some(recipient) = out.recipient {
                    adjust(recipient.owner_hash(), out.value, false);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Verify
    // =========================================================================

    /// Check recent blocks, newest first. Returns the proposed fork point.
    fn verify(&mut self, report: &mut LoadReport) -> Result<Option<Hash>> {
        let depth = self.config.check_depth.min(report.best_height);
        let floor = report.best_height - depth;
        let level = self.config.check_level;
        info!(depth, level, "verifying recent blocks");

        let mut positions = HashSet::new();
        let mut fork: Option<Hash> = None;
        let mut current = report.best_hash;

        while let Some(hash) = current {
            if depth == 0 {
                break;
            }
            let Some(node) = self.index.get(&hash).cloned() else {
                break;
            };
            let Some(prev) = node.prev else {
                break;
            };
            if node.height < floor {
                break;
            }
            if self.shutdown.is_requested() {
                info!(
                    verified = report.verified_blocks,
                    "verification interrupted by shutdown"
                );
                report.cancelled = true;
                return Ok(None);
            }

            let block = self.read_block(&node)?;
            report.verified_blocks += 1;
            if !self.verify_block(&node, &block, &mut positions)? {
                fork = match (self.config.fork_selection, fork) {
                    (ForkSelection::Highest, Some(existing)) => Some(existing),
                    _ => Some(prev),
                };
            }
            current = Some(prev);
        }
        Ok(fork)
    }

    /// Run the checks of the configured level. Returns `false` if any failed.
    fn verify_block(
        &self,
        node: &BlockIndex,
        block: &Block,
        positions: &mut HashSet<BlockPos>,
    ) -> Result<bool> {
        let level = self.config.check_level;
        let mut ok = true;

        if level > 0 && !self.rules.check_block(block) {
            warn!(height = node.height, hash = %node.hash.short(), "found bad block");
            ok = false;
        }
        if level < 2 {
            return Ok(ok);
        }

        positions.insert(node.pos());
        for tx in &block.transactions {
            let tx_hash = tx.hash();
            if let Some(index) = self.txdb.read_tx_index(&tx_hash)? {
                if (level > 2 || index.pos.block() != node.pos())
                    && !self.check_located(&tx_hash, index.pos, node)
                {
                    ok = false;
                }
                if level > 3 {
                    for (n, spend) in index.spent.iter().enumerate() {
                        if spend.is_null() {
                            continue;
                        }
                        if !positions.contains(&spend.block()) {
                            warn!(
                                height = node.height,
                                tx = %tx_hash.short(),
                                "found spend outside the verified chain"
                            );
                            ok = false;
                        }
                        if level > 5 && !self.check_spender(&tx_hash, n as u32, *spend) {
                            ok = false;
                        }
                    }
                }
            }

            if level > 4 && !self.check_prevouts_spent(tx, &tx_hash)? {
                ok = false;
            }
        }
        Ok(ok)
    }

    /// The index entry of `tx_hash` must lead to that very transaction.
    /// Duplicate transactions stored elsewhere pass.
    fn check_located(&self, tx_hash: &Hash, pos: DiskTxPos, node: &BlockIndex) -> bool {
        match self.reader.read_transaction(pos) {
            Ok(found) if found.hash() == *tx_hash => true,
            Ok(_) => {
                warn!(height = node.height, tx = %tx_hash.short(), "invalid tx position");
                false
            }
            Err(e) => {
                warn!(tx = %tx_hash.short(), error = %e, "cannot read mislocated transaction");
                false
            }
        }
    }

    /// The recorded spender of output `n` must load, be well formed, and
    /// actually spend that output.
    fn check_spender(&self, tx_hash: &Hash, n: u32, spend: DiskTxPos) -> bool {
        let spender = match self.reader.read_transaction(spend) {
            Ok(spender) => spender,
            Err(e) => {
                warn!(tx = %tx_hash.short(), output = n, error = %e, "cannot read spending transaction");
                return false;
            }
        };
        if !self.rules.check_transaction(&spender) {
            warn!(tx = %tx_hash.short(), output = n, "spending transaction is invalid");
            return false;
        }
        let spends = spender
            .inputs
            .iter()
            .any(|input| input.prevout.hash == *tx_hash && input.prevout.n == n);
        if !spends {
            warn!(tx = %tx_hash.short(), output = n, "spending transaction does not spend it");
        }
        spends
    }

    /// Every indexed output this transaction consumes must be marked spent.
    fn check_prevouts_spent(&self, tx: &Transaction, tx_hash: &Hash) -> Result<bool> {
        let mut ok = true;
        for input in &tx.inputs {
            if let Some(prev) = self.txdb.read_tx_index(&input.prevout.hash)? {
                if !prev.is_spent(input.prevout.n) {
                    warn!(
                        prevout = %input.prevout.hash.short(),
                        n = input.prevout.n,
                        tx = %tx_hash.short(),
                        "found unspent prevout"
                    );
                    ok = false;
                }
            }
        }
        Ok(ok)
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    fn rollback(&mut self, fork: Hash, report: &mut LoadReport) -> Result<()> {
        let node = self
            .index
            .get(&fork)
            .cloned()
            .ok_or(ChainError::BestChainNotIndexed(fork))?;
        warn!(height = node.height, hash = %fork.short(), "moving best chain pointer back");

        // Back out balances while the disconnected blocks are still indexed.
        let mut current = report.best_hash;
        while let Some(hash) = current.filter(|hash| *hash != fork) {
            let Some(above) = self.index.get(&hash).cloned() else {
                break;
            };
            let block = self.read_block(&above)?;
            self.apply_balances(&block, &mut report.balances, true)?;
            current = above.prev;
        }

        let block = self.read_block(&node)?;
        self.writer
            .set_best_chain(self.txdb, self.reader, &mut self.index, &block)?;

        report.fork_point = Some(fork);
        report.best_hash = Some(fork);
        report.best_height = node.height;
        report.best_trust = node.chain_trust;
        Ok(())
    }

    fn read_block(&self, node: &BlockIndex) -> Result<Block> {
        self.reader
            .read_block(node.pos())
            .map_err(|source| ChainError::BlockUnreadable {
                hash: node.hash,
                source,
            })
    }
}

/// Split a proof-of-work coinbase into its reward kinds: everything but the
/// last two outputs, then the second-to-last, then the last.
pub fn coinbase_rewards(block: &Block) -> [u64; 3] {
    let outputs = block
        .transactions
        .first()
        .map(|coinbase| coinbase.outputs.as_slice())
        .unwrap_or_default();

    match outputs {
        [head @ .., second_last, last] => [
            head.iter().fold(0u64, |acc, out| acc.saturating_add(out.value)),
            second_last.value,
            last.value,
        ],
        _ => {
            warn!(
                height = block.height(),
                hash = %block.hash().short(),
                outputs = outputs.len(),
                "coinbase has fewer than two outputs"
            );
            let total = outputs
                .iter()
                .fold(0u64, |acc, out| acc.saturating_add(out.value));
            [total, 0, 0]
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustchain_core::{TxOut, CHANNEL_HASH};

    fn block_with_outputs(values: &[u64]) -> Block {
        let outputs = values.iter().map(|v| TxOut::new(*v, None)).collect();
        let coinbase = Transaction::coinbase(0, 0, outputs);
        Block::new(Hash::ZERO, 1, CHANNEL_HASH, 0, 1, vec![coinbase])
    }

    #[test]
    fn test_reward_decomposition() {
        assert_eq!(coinbase_rewards(&block_with_outputs(&[5, 7, 11, 13])), [12, 11, 13]);
        assert_eq!(coinbase_rewards(&block_with_outputs(&[4, 9])), [0, 4, 9]);
    }

    #[test]
    fn test_short_coinbase_is_guarded() {
        assert_eq!(coinbase_rewards(&block_with_outputs(&[42])), [42, 0, 0]);
        assert_eq!(coinbase_rewards(&block_with_outputs(&[])), [0, 0, 0]);

        let empty = Block::new(Hash::ZERO, 1, CHANNEL_HASH, 0, 1, vec![]);
        assert_eq!(coinbase_rewards(&empty), [0, 0, 0]);
    }

    #[test]
    fn test_fork_selection_parsing() {
        assert_eq!("lowest".parse::<ForkSelection>().unwrap(), ForkSelection::Lowest);
        assert_eq!("Highest".parse::<ForkSelection>().unwrap(), ForkSelection::Highest);
        assert!("middle".parse::<ForkSelection>().is_err());
        assert_eq!(ForkSelection::default(), ForkSelection::Lowest);
    }

    #[test]
    fn test_default_verify_config() {
        let config = VerifyConfig::default();
        assert_eq!(config.check_depth, 100);
        assert_eq!(config.check_level, 1);
        assert!(config.genesis_hash.is_none());
    }
}
