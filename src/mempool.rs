//! Transaction memory pool.
//!
//! The pool is a snapshot pinned to a chain tip: every entry was fully
//! valid against that tip when it entered, and block assembly asserts
//! the pin before selecting. Entries carry the precomputed fee, size,
//! and descendant aggregates the selection heap orders by.

use std::collections::{HashMap, HashSet};

use crate::chain::Chain;
use crate::constants::*;
use crate::error::VerifyError;
use crate::script::{verify_script, TxChecker, VERIFY_CLEANSTACK, VERIFY_MINIMALDATA};
use crate::transaction::{check_inputs, check_sanity, SealedTx};
use crate::types::{Amount, Hash, OutPoint, Transaction};
use crate::utxo::{CoinSource, CoinView, UtxoEntry};

/// Sentinel height for coins created by unconfirmed parents.
const POOL_HEIGHT: u32 = u32::MAX;

/// One pooled transaction with its selection metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    sealed: SealedTx,
    pub fee: Amount,
    /// Chain height at acceptance time.
    pub height: u32,
    /// Value and creation height of each spent coin, for priority.
    coins: Vec<(Amount, u32)>,
    /// Aggregate fee and size of this entry plus its descendants.
    pub desc_fee: Amount,
    pub desc_size: usize,
    /// Sigop count at acceptance, under the tip's flags.
    pub sigops: usize,
}

impl MempoolEntry {
    pub fn sealed(&self) -> &SealedTx {
        &self.sealed
    }

    pub fn tx(&self) -> &Transaction {
        self.sealed.tx()
    }

    pub fn hash(&self) -> Hash {
        self.sealed.hash()
    }

    pub fn size(&self) -> usize {
        self.sealed.size()
    }

    /// Fee rate in base units per kilobyte.
    pub fn rate(&self) -> Amount {
        rate_of(self.fee, self.size())
    }

    /// Descendant-inclusive fee rate.
    pub fn desc_rate(&self) -> Amount {
        rate_of(self.desc_fee, self.desc_size)
    }

    /// Coin-age weighted priority at `height`: Σ value·age / size.
    pub fn priority(&self, height: u32) -> u128 {
        let mut sum: u128 = 0;
        for &(value, coin_height) in &self.coins {
            let age = height.saturating_sub(coin_height) as u128;
            sum += value as u128 * age;
        }
        sum / self.size().max(1) as u128
    }
}

fn rate_of(fee: Amount, size: usize) -> Amount {
    if size == 0 {
        return 0;
    }
    fee * 1000 / size as Amount
}

/// The pool.
pub struct Mempool {
    tip: Hash,
    map: HashMap<Hash, MempoolEntry>,
    spents: HashMap<OutPoint, Hash>,
    order: Vec<Hash>,
}

/// Coin resolution that sees unconfirmed parent outputs.
struct PoolSource<'a> {
    chain: &'a Chain,
    map: &'a HashMap<Hash, MempoolEntry>,
    spents: &'a HashMap<OutPoint, Hash>,
}

impl CoinSource for PoolSource<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        if self.spents.contains_key(outpoint) {
            return None;
        }
        if let Some(parent) = self.map.get(&outpoint.hash) {
            let output = parent.tx().outputs.get(outpoint.index as usize)?;
            return Some(UtxoEntry::new(output.clone(), POOL_HEIGHT, false));
        }
        self.chain.coin(outpoint)
    }
}

impl Mempool {
    pub fn new(tip: Hash) -> Self {
        Self {
            tip,
            map: HashMap::new(),
            spents: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn tip(&self) -> Hash {
        self.tip
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.map.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&MempoolEntry> {
        self.map.get(hash)
    }

    /// Entries in insertion order. Parents always precede children,
    /// because a child cannot enter before its parents.
    pub fn snapshot(&self) -> Vec<&MempoolEntry> {
        self.order
            .iter()
            .filter_map(|hash| self.map.get(hash))
            .collect()
    }

    /// Hash of the pooled transaction spending `outpoint`, if any.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.spents.get(outpoint).copied()
    }

    /// Validate and admit a transaction against the pinned chain tip.
    pub fn insert(&mut self, tx: Transaction, chain: &Chain) -> Result<Hash, VerifyError> {
        if self.tip != chain.tip().hash {
            return Err(VerifyError::new("mempool-stale-tip", 0));
        }

        let sealed = SealedTx::seal(tx);
        let hash = sealed.hash();

        if self.map.contains_key(&hash) {
            return Err(VerifyError::new("txn-already-in-mempool", 0));
        }

        check_sanity(sealed.tx())?;

        if sealed.tx().is_coinbase() {
            return Err(VerifyError::new("coinbase", 100));
        }

        for input in &sealed.tx().inputs {
            if self.spents.contains_key(&input.prevout) {
                return Err(VerifyError::new("txn-mempool-conflict", 0));
            }
        }

        let spend_height = chain.height() + 1;
        let mtp = chain.tip().median_time_past as u64;
        if !sealed.tx().is_final(spend_height, mtp) {
            return Err(VerifyError::new("non-final", 0));
        }

        let source = PoolSource {
            chain,
            map: &self.map,
            spents: &self.spents,
        };

        let mut view = CoinView::new();
        let fee = check_inputs(
            sealed.tx(),
            &mut view,
            &source,
            spend_height,
            chain.params().coinbase_maturity,
        )?;

        // Mempool policy is the block rule set plus standardness.
        let flags =
            chain.flags_for(chain.tip()) | VERIFY_MINIMALDATA | VERIFY_CLEANSTACK;

        let mut coins = Vec::with_capacity(sealed.tx().inputs.len());
        for (index, input) in sealed.tx().inputs.iter().enumerate() {
            let coin = view
                .get(&input.prevout, &source)
                .ok_or_else(|| VerifyError::new("bad-txns-inputs-missingorspent", 0))?;

            let mut checker = TxChecker::new(sealed.tx(), index, coin.value())
                .with_midstates(sealed.midstates());
            verify_script(&input.script, &coin.output.script, flags, &mut checker)
                .map_err(VerifyError::from_script)?;

            coins.push((coin.value(), coin.height));
        }

        let sigops = crate::transaction::total_sigops(sealed.tx(), &mut view, &source, flags);

        let size = sealed.size();
        let entry = MempoolEntry {
            sealed,
            fee,
            height: chain.height(),
            coins,
            desc_fee: fee,
            desc_size: size,
            sigops,
        };

        // Credit this entry to every in-pool ancestor's descendant
        // aggregate.
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut stack: Vec<Hash> = entry
            .tx()
            .inputs
            .iter()
            .map(|input| input.prevout.hash)
            .collect();
        while let Some(parent_hash) = stack.pop() {
            if !visited.insert(parent_hash) {
                continue;
            }
            if let Some(parent) = self.map.get_mut(&parent_hash) {
                parent.desc_fee += fee;
                parent.desc_size += size;
                stack.extend(
                    parent
                        .tx()
                        .inputs
                        .iter()
                        .map(|input| input.prevout.hash)
                        .collect::<Vec<_>>(),
                );
            }
        }

        for input in &entry.tx().inputs {
            self.spents.insert(input.prevout, hash);
        }
        self.order.push(hash);
        self.map.insert(hash, entry);

        Ok(hash)
    }

    /// Drop the transactions a connected block confirmed, along with
    /// anything that conflicts with it, and re-pin to the new tip.
    pub fn remove_block(&mut self, block_txs: &[Transaction], new_tip: Hash) {
        let mut doomed: Vec<Hash> = Vec::new();

        for tx in block_txs {
            let hash = crate::codec::tx_hash(tx);
            if self.map.contains_key(&hash) {
                doomed.push(hash);
            }
            // Pool transactions double spending a confirmed input are
            // dead regardless.
            for input in &tx.inputs {
                if let Some(conflict) = self.spents.get(&input.prevout) {
                    if *conflict != hash {
                        doomed.push(*conflict);
                    }
                }
            }
        }

        for hash in doomed {
            self.evict(&hash);
        }
        self.tip = new_tip;
    }

    /// Remove an entry and, recursively, everything spending it.
    fn evict(&mut self, hash: &Hash) {
        let entry = match self.map.remove(hash) {
            Some(entry) => entry,
            None => return,
        };

        for input in entry.tx().inputs.iter() {
            if self.spents.get(&input.prevout) == Some(hash) {
                self.spents.remove(&input.prevout);
            }
        }
        self.order.retain(|h| h != hash);

        let children: Vec<Hash> = entry
            .tx()
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(index, _)| {
                self.spents
                    .get(&OutPoint::new(*hash, index as u32))
                    .copied()
            })
            .collect();
        for child in children {
            self.evict(&child);
        }
    }
}
