//! Block assembly: turn a mempool snapshot into a mining template.
//!
//! Selection walks the in-pool dependency graph with a heap that runs
//! in two phases, coin-age priority first (optional) and fee rate
//! second. A transaction only becomes eligible once every in-pool
//! parent has been committed, so the emitted order is topological; a
//! canonical sort replaces it after the ordering rule activates.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::address::Address;
use crate::chain::{max_block_sigops, Chain};
use crate::codec::merkle_root;
use crate::constants::*;
use crate::error::VerifyError;
use crate::mempool::Mempool;
use crate::pow::U256;
use crate::script::{push_data, push_number};
use crate::transaction::SealedTx;
use crate::types::{txid_bytes, Amount, Block, Bytes, Hash, Header, Input, OutPoint, Output, Transaction};

/// Tuning knobs for the assembler.
#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    /// Payout address for the coinbase.
    pub address: Address,
    /// Arbitrary coinbase tag, truncated to 20 bytes.
    pub coinbase_flags: Bytes,
    /// Maximum serialized block size to build.
    pub max_size: usize,
    /// Size reserved for the priority phase; zero disables it.
    pub priority_size: usize,
    /// Entries below this priority end the priority phase.
    pub priority_threshold: u128,
    /// Block version to emit.
    pub version: i32,
}

impl AssemblerOptions {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            coinbase_flags: b"/cash-consensus/".to_vec(),
            max_size: 8_000_000,
            priority_size: 0,
            priority_threshold: COIN as u128 * 144 / 250,
            version: 0x2000_0000,
        }
    }
}

/// A committed template transaction.
#[derive(Debug, Clone)]
pub struct TemplateEntry {
    sealed: SealedTx,
    pub fee: Amount,
    pub sigops: usize,
}

impl TemplateEntry {
    pub fn tx(&self) -> &Transaction {
        self.sealed.tx()
    }

    pub fn hash(&self) -> Hash {
        self.sealed.hash()
    }

    pub fn size(&self) -> usize {
        self.sealed.size()
    }
}

/// The block under construction.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub prev: Hash,
    pub height: u32,
    pub time: u32,
    pub bits: u32,
    pub target: U256,
    pub median_time_past: u32,
    pub flags: u32,
    pub locktime: u32,
    pub size: usize,
    pub sigops: usize,
    pub fees: Amount,
    pub entries: Vec<TemplateEntry>,
    pub coinbase_flags: Bytes,
    pub address: Address,
    pub halving_interval: u32,
    pub canonical: bool,
    pub version: i32,
}

impl BlockTemplate {
    /// Coinbase output value: subsidy plus collected fees.
    pub fn reward(&self) -> Amount {
        get_reward(self.height, self.halving_interval) + self.fees
    }

    /// Build the coinbase: height push, then the miner tag.
    pub fn create_coinbase(&self) -> Transaction {
        let mut script = Bytes::new();
        push_number(&mut script, self.height as i64);

        let mut flags = self.coinbase_flags.clone();
        flags.truncate(20);
        push_data(&mut script, &flags);

        Transaction {
            version: 1,
            inputs: vec![Input {
                prevout: OutPoint::null(),
                script,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![Output {
                value: self.reward(),
                script: self.address.to_script(),
            }],
            locktime: 0,
        }
    }

    /// Materialize the template into a block with a fresh merkle root.
    pub fn to_block(&self) -> Block {
        let mut txs = Vec::with_capacity(self.entries.len() + 1);
        txs.push(self.create_coinbase());
        txs.extend(self.entries.iter().map(|entry| entry.tx().clone()));

        let hashes: Vec<Hash> = txs.iter().map(crate::codec::tx_hash).collect();
        let (root, _) = merkle_root(hashes);

        Block {
            header: Header {
                version: self.version,
                prev: self.prev,
                merkle_root: root,
                time: self.time,
                bits: self.bits,
                nonce: 0,
            },
            txs,
        }
    }
}

#[derive(Clone)]
struct Candidate {
    sealed: SealedTx,
    fee: Amount,
    sigops: usize,
    priority: u128,
    rate: Amount,
    desc_rate: Amount,
    dep_count: usize,
}

#[derive(Clone, Copy)]
struct QueueKeys {
    hash: Hash,
    priority: u128,
    rate: Amount,
    effective_rate: Amount,
}

struct ByPriority(QueueKeys);

impl PartialEq for ByPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ByPriority {}
impl PartialOrd for ByPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(self.0.rate.cmp(&other.0.rate))
            .then(self.0.hash.cmp(&other.0.hash))
    }
}

struct ByRate(QueueKeys);

impl PartialEq for ByRate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ByRate {}
impl PartialOrd for ByRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByRate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .effective_rate
            .cmp(&other.0.effective_rate)
            .then(self.0.priority.cmp(&other.0.priority))
            .then(self.0.hash.cmp(&other.0.hash))
    }
}

/// Assemble: 𝒫 × 𝒞 → template
///
/// 1. Pin the snapshot to the chain tip.
/// 2. Count in-pool parents per entry; roots seed the heap.
/// 3. Priority phase (optional): drain by coin-age priority until the
///    reserved size fills or priority drops below the threshold.
/// 4. Fee-rate phase: drain by `max(rate, descendant rate)`, skipping
///    entries that would bust the size or sigop budget or are not yet
///    final; committing an entry frees its in-pool children.
/// 5. Canonical-sort the result when magnetic anomaly is active.
pub fn assemble(
    chain: &Chain,
    mempool: &Mempool,
    options: &AssemblerOptions,
) -> Result<BlockTemplate, VerifyError> {
    let tip = chain.tip();
    if mempool.tip() != tip.hash {
        return Err(VerifyError::new("mempool-stale-tip", 0));
    }

    let height = tip.height + 1;
    let median_time_past = tip.median_time_past;
    let bits = chain.get_target(tip);
    let target = U256::from_compact(bits).unwrap_or(U256::ZERO);
    let canonical = chain.magnetic_anomaly_active(tip);
    let flags = chain.flags_for(tip);
    let max_sigops = max_block_sigops(options.max_size);

    let mut template = BlockTemplate {
        prev: tip.hash,
        height,
        time: (median_time_past + 1).max(tip.time + chain.params().target_spacing as u32),
        bits,
        target,
        median_time_past,
        flags,
        locktime: median_time_past,
        // Reserved space for the header, counts, and coinbase.
        size: 1000,
        sigops: 100,
        fees: 0,
        entries: Vec::new(),
        coinbase_flags: options.coinbase_flags.clone(),
        address: options.address,
        halving_interval: chain.params().halving_interval,
        canonical,
        version: options.version,
    };

    // Dependency graph over the snapshot.
    let snapshot = mempool.snapshot();
    let mut candidates: HashMap<Hash, Candidate> = HashMap::with_capacity(snapshot.len());
    let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();

    for entry in &snapshot {
        let hash = entry.hash();
        let mut dep_count = 0;
        for input in &entry.tx().inputs {
            if mempool.contains(&input.prevout.hash) {
                dep_count += 1;
                children.entry(input.prevout.hash).or_default().push(hash);
            }
        }
        candidates.insert(
            hash,
            Candidate {
                sealed: entry.sealed().clone(),
                fee: entry.fee,
                sigops: entry.sigops,
                priority: entry.priority(height),
                rate: entry.rate(),
                desc_rate: entry.desc_rate(),
                dep_count,
            },
        );
    }

    let keys_of = |candidate: &Candidate, hash: Hash| QueueKeys {
        hash,
        priority: candidate.priority,
        rate: candidate.rate,
        effective_rate: candidate.rate.max(candidate.desc_rate),
    };

    let mut priority_mode = options.priority_size > 0;
    let mut priority_queue: BinaryHeap<ByPriority> = BinaryHeap::new();
    let mut rate_queue: BinaryHeap<ByRate> = BinaryHeap::new();

    for (hash, candidate) in &candidates {
        if candidate.dep_count == 0 {
            let keys = keys_of(candidate, *hash);
            if priority_mode {
                priority_queue.push(ByPriority(keys));
            } else {
                rate_queue.push(ByRate(keys));
            }
        }
    }

    loop {
        let keys = if priority_mode {
            match priority_queue.pop() {
                Some(item) => {
                    // Phase transition: reserved size exhausted or the
                    // best remaining priority is too low. Re-seed the
                    // heap under the fee-rate ordering.
                    if template.size >= options.priority_size
                        || item.0.priority < options.priority_threshold
                    {
                        priority_mode = false;
                        rate_queue.push(ByRate(item.0));
                        for leftover in priority_queue.drain() {
                            rate_queue.push(ByRate(leftover.0));
                        }
                        continue;
                    }
                    item.0
                }
                None => {
                    priority_mode = false;
                    continue;
                }
            }
        } else {
            match rate_queue.pop() {
                Some(item) => item.0,
                None => break,
            }
        };

        let candidate = &candidates[&keys.hash];

        let fits = template.size + candidate.sealed.size() <= options.max_size
            && template.sigops + candidate.sigops <= max_sigops
            && candidate
                .sealed
                .tx()
                .is_final(height, median_time_past as u64);

        if fits {
            template.size += candidate.sealed.size();
            template.sigops += candidate.sigops;
            template.fees += candidate.fee;
            template.entries.push(TemplateEntry {
                sealed: candidate.sealed.clone(),
                fee: candidate.fee,
                sigops: candidate.sigops,
            });

            // Free the committed entry's children.
            if let Some(kids) = children.get(&keys.hash).cloned() {
                for kid in kids {
                    let candidate = candidates.get_mut(&kid).expect("graph member");
                    candidate.dep_count -= 1;
                    if candidate.dep_count == 0 {
                        let keys = keys_of(candidate, kid);
                        if priority_mode {
                            priority_queue.push(ByPriority(keys));
                        } else {
                            rate_queue.push(ByRate(keys));
                        }
                    }
                }
            }
        }

        if priority_queue.is_empty() && rate_queue.is_empty() {
            break;
        }
    }

    if canonical {
        template
            .entries
            .sort_by_key(|entry| txid_bytes(&entry.hash()));
    }

    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainEntry;
    use crate::codec::tx_hash;
    use crate::params::Params;
    use crate::script::OP_1;
    use crate::scriptnum;
    use crate::store::MemStore;
    use crate::types::rhash;

    fn miner_address() -> Address {
        Address::pubkey_hash([0x11; 20])
    }

    fn test_chain(blocks: u32) -> Chain {
        let mut chain = Chain::open(Params::regtest(), Box::new(MemStore::new())).unwrap();
        for _ in 0..blocks {
            let block = next_block(&chain, vec![]);
            chain.add(block).unwrap();
        }
        chain
    }

    fn next_block(chain: &Chain, txs: Vec<Transaction>) -> Block {
        let prev = chain.tip();
        let height = prev.height + 1;
        let reward = get_reward(height, chain.params().halving_interval);

        let mut script = Bytes::new();
        push_number(&mut script, height as i64);
        push_data(&mut script, b"t");

        let mut all = vec![Transaction {
            version: 1,
            inputs: vec![Input {
                prevout: OutPoint::null(),
                script,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![Output {
                value: reward,
                script: vec![OP_1],
            }],
            locktime: 0,
        }];
        all.extend(txs);

        let hashes: Vec<Hash> = all.iter().map(tx_hash).collect();
        let (root, _) = merkle_root(hashes);

        Block {
            header: Header {
                version: 1,
                prev: prev.hash,
                merkle_root: root,
                time: prev.time + 600,
                bits: chain.get_target(prev),
                nonce: 0,
            },
            txs: all,
        }
    }

    fn coinbase_outpoint(chain: &Chain, height: u32) -> (OutPoint, Amount) {
        let entry: &ChainEntry = chain.entry_at(height).unwrap();
        let block = chain.read_block(&entry.hash).unwrap();
        (
            OutPoint::new(tx_hash(&block.txs[0]), 0),
            block.txs[0].outputs[0].value,
        )
    }

    fn spend(outpoint: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![Input {
                prevout: outpoint,
                script: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![Output {
                value,
                script: vec![OP_1],
            }],
            locktime: 0,
        }
    }

    #[test]
    fn test_empty_template_connects() {
        let mut chain = test_chain(2);
        let mempool = Mempool::new(chain.tip().hash);
        let options = AssemblerOptions::new(miner_address());

        let template = assemble(&chain, &mempool, &options).unwrap();
        assert_eq!(template.height, 3);
        assert_eq!(template.fees, 0);
        assert!(template.entries.is_empty());

        let block = template.to_block();
        chain.preverify(&block).unwrap();
        chain.add(block).unwrap();
        assert_eq!(chain.height(), 3);
    }

    #[test]
    fn test_coinbase_carries_height_and_flags() {
        let chain = test_chain(2);
        let mempool = Mempool::new(chain.tip().hash);
        let options = AssemblerOptions::new(miner_address());

        let template = assemble(&chain, &mempool, &options).unwrap();
        let coinbase = template.create_coinbase();
        assert!(coinbase.is_coinbase());

        // Height push leads the script.
        let height_push = scriptnum::encode(template.height as i64);
        let mut expected = Bytes::new();
        push_data(&mut expected, &height_push);
        assert!(coinbase.inputs[0].script.starts_with(&expected));
        assert_eq!(coinbase.outputs[0].value, template.reward());
        assert_eq!(coinbase.outputs[0].script, miner_address().to_script());
    }

    #[test]
    fn test_fees_credited_to_coinbase() {
        let mut chain = test_chain(COINBASE_MATURITY + 1);
        let mut mempool = Mempool::new(chain.tip().hash);

        let (outpoint, value) = coinbase_outpoint(&chain, 1);
        mempool.insert(spend(outpoint, value - 7000), &chain).unwrap();

        let options = AssemblerOptions::new(miner_address());
        let template = assemble(&chain, &mempool, &options).unwrap();
        assert_eq!(template.fees, 7000);
        assert_eq!(template.entries.len(), 1);
        assert_eq!(
            template.reward(),
            get_reward(template.height, chain.params().halving_interval) + 7000
        );

        let block = template.to_block();
        chain.preverify(&block).unwrap();
        chain.add(block).unwrap();
    }

    #[test]
    fn test_dependency_order_preserved() {
        let mut chain = test_chain(COINBASE_MATURITY + 2);
        let mut mempool = Mempool::new(chain.tip().hash);

        let (outpoint, value) = coinbase_outpoint(&chain, 1);
        let tx1 = spend(outpoint, value - 5000);
        let tx1_hash = mempool.insert(tx1, &chain).unwrap();
        // Child pays a far better rate than its parent.
        let tx2 = spend(OutPoint::new(tx1_hash, 0), value - 105_000);
        let tx2_hash = mempool.insert(tx2, &chain).unwrap();

        let options = AssemblerOptions::new(miner_address());
        let template = assemble(&chain, &mempool, &options).unwrap();

        let order: Vec<Hash> = template.entries.iter().map(|e| e.hash()).collect();
        assert_eq!(order, vec![tx1_hash, tx2_hash]);

        let block = template.to_block();
        chain.preverify(&block).unwrap();
        chain.add(block).unwrap();
    }

    #[test]
    fn test_size_budget_skips_entries() {
        let chain = test_chain(COINBASE_MATURITY + 2);
        let mut mempool = Mempool::new(chain.tip().hash);

        let (out1, val1) = coinbase_outpoint(&chain, 1);
        let (out2, val2) = coinbase_outpoint(&chain, 2);
        // The better-rate spend should win the only slot.
        let cheap = spend(out1, val1 - 1000);
        let rich = spend(out2, val2 - 500_000);
        mempool.insert(cheap, &chain).unwrap();
        let rich_hash = mempool.insert(rich, &chain).unwrap();

        let mut options = AssemblerOptions::new(miner_address());
        // Room for exactly one entry beyond the reserve.
        options.max_size = 1000 + 70;

        let template = assemble(&chain, &mempool, &options).unwrap();
        assert_eq!(template.entries.len(), 1);
        assert_eq!(template.entries[0].hash(), rich_hash);
    }

    #[test]
    fn test_priority_phase_selects_aged_coins() {
        let mut chain = test_chain(COINBASE_MATURITY + 60);
        let mut mempool = Mempool::new(chain.tip().hash);

        // An old, fee-less spend and a young, well-paying one.
        let (old_out, old_val) = coinbase_outpoint(&chain, 1);
        let (new_out, new_val) = coinbase_outpoint(&chain, 55);
        let old_free = spend(old_out, old_val);
        let young_paid = spend(new_out, new_val - 50_000);
        let old_hash = mempool.insert(old_free, &chain).unwrap();
        mempool.insert(young_paid, &chain).unwrap();

        let mut options = AssemblerOptions::new(miner_address());
        options.priority_size = 50_000;
        options.priority_threshold = 1;

        let template = assemble(&chain, &mempool, &options).unwrap();
        assert_eq!(template.entries.len(), 2);
        // The zero-fee transaction still made it in via priority.
        assert!(template.entries.iter().any(|e| e.hash() == old_hash));
        assert_eq!(template.fees, 50_000);
    }

    #[test]
    fn test_canonical_sort_after_activation() {
        let mut chain = test_chain(COINBASE_MATURITY + 2);
        chain.params_mut().magnetic_anomaly_time = 0;
        let mut mempool = Mempool::new(chain.tip().hash);

        let (out1, val1) = coinbase_outpoint(&chain, 1);
        let (out2, val2) = coinbase_outpoint(&chain, 2);
        mempool.insert(spend(out1, val1 - 5000), &chain).unwrap();
        mempool.insert(spend(out2, val2 - 5000), &chain).unwrap();

        let options = AssemblerOptions::new(miner_address());
        let template = assemble(&chain, &mempool, &options).unwrap();
        assert!(template.canonical);

        let ids: Vec<_> = template
            .entries
            .iter()
            .map(|e| txid_bytes(&e.hash()))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "entries must be ascending by txid");

        let block = template.to_block();
        chain.preverify(&block).unwrap();
        chain.add(block).unwrap();
    }

    #[test]
    fn test_template_fields() {
        let chain = test_chain(3);
        let mempool = Mempool::new(chain.tip().hash);
        let options = AssemblerOptions::new(miner_address());

        let template = assemble(&chain, &mempool, &options).unwrap();
        assert_eq!(template.prev, chain.tip().hash);
        assert_eq!(template.bits, chain.get_target(chain.tip()));
        assert_eq!(template.median_time_past, chain.tip().median_time_past);
        assert!(template.time > template.median_time_past);
        assert_eq!(rhash(&template.prev).len(), 64);
    }
}
