//! Chain state machine: entry bookkeeping, contextual validation,
//! best-chain selection, reorganization, and the event surface.
//!
//! All mutating operations go through `&mut self`, which is the chain
//! lock: Rust's borrow rules give exclusive mutation and concurrent
//! reads exactly the way the design requires. Suspension points exist
//! only at store boundaries; every in-memory transition runs to
//! completion.

use std::collections::{HashMap, HashSet};

use crate::codec::{block_merkle_root, block_size, decode_block, encode_block, encode_header, header_hash, tx_hash};
use crate::constants::*;
use crate::error::{Result, StoreError, VerifyError};
use crate::params::Params;
use crate::pow::{cash_bits, check_proof_of_work, legacy_bits, work_from_bits, U256, WorkPoint};
use crate::script::{verify_script, TxChecker, MANDATORY_VERIFY_FLAGS, VERIFY_CHECKDATASIG};
use crate::sighash::SighashMidstates;
use crate::store::{check_version, layout, Store, WriteOp};
use crate::transaction::{check_inputs, check_sanity, total_sigops};
use crate::types::{txid_bytes, Amount, Block, Hash, Header, Transaction};
use crate::utxo::{CoinSource, CoinView, UndoData, UtxoEntry};

/// Immutable record of a validated header plus derived fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: Hash,
    pub height: u32,
    pub version: i32,
    pub prev: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub chainwork: U256,
    pub median_time_past: u32,
}

impl ChainEntry {
    pub fn header(&self) -> Header {
        Header {
            version: self.version,
            prev: self.prev,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn work_point(&self) -> WorkPoint {
        WorkPoint {
            time: self.time as u64,
            chainwork: self.chainwork,
        }
    }

    /// Store encoding: height, 80-byte header, chainwork, MTP.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(120);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&encode_header(&self.header()));
        buf.extend_from_slice(&self.chainwork.to_le_bytes());
        buf.extend_from_slice(&self.median_time_past.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, StoreError> {
        if data.len() != 120 {
            return Err(StoreError::Corruption("bad entry record".to_string()));
        }

        let mut height = [0u8; 4];
        height.copy_from_slice(&data[0..4]);
        let header = crate::codec::decode_header(&data[4..84])
            .map_err(|e| StoreError::Corruption(e.to_string()))?;
        let mut work = [0u8; 32];
        work.copy_from_slice(&data[84..116]);
        let mut mtp = [0u8; 4];
        mtp.copy_from_slice(&data[116..120]);

        Ok(Self {
            hash: header_hash(&header),
            height: u32::from_le_bytes(height),
            version: header.version,
            prev: header.prev,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            chainwork: U256::from_le_bytes(&work),
            median_time_past: u32::from_le_bytes(mtp),
        })
    }
}

/// Synchronous observer of chain state transitions.
///
/// Callbacks run inside the chain lock; listeners must not re-enter
/// the chain. Connect events arrive in strict height order, and a
/// reorganization delivers every disconnect (descending) before the
/// first connect of the new branch.
pub trait ChainListener {
    fn on_connect(&mut self, _entry: &ChainEntry, _block: &Block, _view: &CoinView) {}
    fn on_disconnect(&mut self, _entry: &ChainEntry, _block: &Block, _view: &CoinView) {}
    fn on_tip(&mut self, _entry: &ChainEntry) {}
    fn on_reset(&mut self, _entry: &ChainEntry) {}
}

/// One script verification job: an input of a block transaction
/// against the coin it spends.
pub struct InputJob<'a> {
    pub tx: &'a Transaction,
    pub index: usize,
    pub coin: UtxoEntry,
    pub flags: u32,
    pub midstates: &'a SighashMidstates,
}

/// Hook for delegating input verification, e.g. to a worker pool.
///
/// Jobs form a pure map: no job's outcome depends on another's, and
/// the first failure decides the block. Implementations must surface
/// the same error taxonomy as the sequential path.
pub trait InputVerifier {
    fn verify_inputs(&self, jobs: &[InputJob<'_>]) -> std::result::Result<(), VerifyError>;
}

/// Default verifier: run every job in order, stop at the first error.
pub struct SequentialVerifier;

impl InputVerifier for SequentialVerifier {
    fn verify_inputs(&self, jobs: &[InputJob<'_>]) -> std::result::Result<(), VerifyError> {
        for job in jobs {
            let mut checker = TxChecker::new(job.tx, job.index, job.coin.value())
                .with_midstates(job.midstates);
            verify_script(
                &job.tx.inputs[job.index].script,
                &job.coin.output.script,
                job.flags,
                &mut checker,
            )
            .map_err(VerifyError::from_script)?;
        }
        Ok(())
    }
}

/// The chain.
pub struct Chain {
    params: Params,
    store: Box<dyn Store>,
    entries: HashMap<Hash, ChainEntry>,
    main: Vec<Hash>,
    invalid: HashSet<Hash>,
    utxo: HashMap<crate::types::OutPoint, UtxoEntry>,
    tip: Hash,
    listeners: Vec<Box<dyn ChainListener>>,
    verifier: Box<dyn InputVerifier>,
    /// Network-adjusted clock for the future-timestamp bound; `None`
    /// disables the check (deterministic harnesses).
    adjusted_time: Option<u64>,
}

impl CoinSource for Chain {
    fn coin(&self, outpoint: &crate::types::OutPoint) -> Option<UtxoEntry> {
        self.utxo.get(outpoint).cloned()
    }
}

impl Chain {
    /// Open a chain over a store, initializing genesis on first use.
    pub fn open(params: Params, mut store: Box<dyn Store>) -> Result<Self> {
        check_version(store.as_mut())?;

        let mut chain = Self {
            params,
            store,
            entries: HashMap::new(),
            main: Vec::new(),
            invalid: HashSet::new(),
            utxo: HashMap::new(),
            tip: [0u8; 32],
            listeners: Vec::new(),
            verifier: Box::new(SequentialVerifier),
            adjusted_time: None,
        };

        match chain.store.get(layout::TIP)? {
            Some(tip_bytes) => chain.load(&tip_bytes)?,
            None => chain.init_genesis()?,
        }

        Ok(chain)
    }

    fn init_genesis(&mut self) -> Result<()> {
        let header = self.params.genesis;
        let hash = header_hash(&header);
        let entry = ChainEntry {
            hash,
            height: 0,
            version: header.version,
            prev: header.prev,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            chainwork: work_from_bits(header.bits),
            median_time_past: header.time,
        };

        self.store.write_batch(vec![
            WriteOp::Put(layout::entry(&hash), entry.to_bytes()),
            WriteOp::Put(layout::height(&hash), entry.height.to_le_bytes().to_vec()),
            WriteOp::Put(layout::main_hash(0), hash.to_vec()),
            WriteOp::Put(layout::TIP.to_vec(), hash.to_vec()),
        ])?;

        self.entries.insert(hash, entry);
        self.main.push(hash);
        self.tip = hash;
        Ok(())
    }

    /// Rebuild in-memory state from a previously written store.
    fn load(&mut self, tip_bytes: &[u8]) -> Result<()> {
        if tip_bytes.len() != 32 {
            return Err(StoreError::Corruption("bad tip record".to_string()).into());
        }
        let mut tip = [0u8; 32];
        tip.copy_from_slice(tip_bytes);

        for (_, value) in self.store.scan(b"e")? {
            let entry = ChainEntry::from_bytes(&value)?;
            self.entries.insert(entry.hash, entry);
        }

        for (key, value) in self.store.scan(b"H")? {
            if key.len() != 5 || value.len() != 32 {
                return Err(StoreError::Corruption("bad height index".to_string()).into());
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&value);
            self.main.push(hash);
        }

        for (key, value) in self.store.scan(b"c")? {
            if key.len() != 37 {
                return Err(StoreError::Corruption("bad coin key".to_string()).into());
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key[1..33]);
            let index = u32::from_be_bytes([key[33], key[34], key[35], key[36]]);
            let entry = UtxoEntry::from_bytes(&value)
                .map_err(|e| StoreError::Corruption(e.to_string()))?;
            self.utxo
                .insert(crate::types::OutPoint::new(hash, index), entry);
        }

        if !self.entries.contains_key(&tip) {
            return Err(StoreError::Corruption("tip entry missing".to_string()).into());
        }
        self.tip = tip;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read API
    // ------------------------------------------------------------------

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Mutable parameter access for harnesses that shift activation
    /// points mid-run. Production code configures params at open.
    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub fn tip(&self) -> &ChainEntry {
        &self.entries[&self.tip]
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn entry(&self, hash: &Hash) -> Option<&ChainEntry> {
        self.entries.get(hash)
    }

    pub fn entry_at(&self, height: u32) -> Option<&ChainEntry> {
        self.main
            .get(height as usize)
            .and_then(|hash| self.entries.get(hash))
    }

    pub fn is_main_chain(&self, entry: &ChainEntry) -> bool {
        self.main.get(entry.height as usize) == Some(&entry.hash)
    }

    /// Walk back to the ancestor at `height`.
    pub fn ancestor<'a>(&'a self, entry: &'a ChainEntry, height: u32) -> Option<&'a ChainEntry> {
        if height > entry.height {
            return None;
        }

        // Fast path along the main chain.
        if self.is_main_chain(entry) {
            return self.entry_at(height);
        }

        let mut cursor = entry;
        while cursor.height > height {
            cursor = self.entries.get(&cursor.prev)?;
        }
        Some(cursor)
    }

    pub fn read_block(&self, hash: &Hash) -> Result<Block> {
        let bytes = self
            .store
            .get(&layout::block(hash))?
            .ok_or_else(|| StoreError::Corruption("block body missing".to_string()))?;
        Ok(decode_block(&bytes)?)
    }

    pub fn add_listener(&mut self, listener: Box<dyn ChainListener>) {
        self.listeners.push(listener);
    }

    pub fn set_verifier(&mut self, verifier: Box<dyn InputVerifier>) {
        self.verifier = verifier;
    }

    pub fn set_adjusted_time(&mut self, time: u64) {
        self.adjusted_time = Some(time);
    }

    /// Median of the eleven most recent timestamps ending at a new
    /// block with the given parent and time.
    fn compute_mtp(&self, prev: Option<&ChainEntry>, time: u32) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIMESPAN);
        times.push(time);

        let mut cursor = prev;
        while times.len() < MEDIAN_TIMESPAN {
            match cursor {
                Some(entry) => {
                    times.push(entry.time);
                    if entry.height == 0 {
                        break;
                    }
                    cursor = self.entries.get(&entry.prev);
                }
                None => break,
            }
        }

        times.sort_unstable();
        times[times.len() / 2]
    }

    /// The magnetic-anomaly feature set activates when the parent's
    /// MTP reaches the configured time.
    pub fn magnetic_anomaly_active(&self, prev: &ChainEntry) -> bool {
        prev.median_time_past as u64 >= self.params.magnetic_anomaly_time
    }

    /// Script verification flags for a block whose parent is `prev`.
    pub fn flags_for(&self, prev: &ChainEntry) -> u32 {
        let mut flags = MANDATORY_VERIFY_FLAGS;
        if self.magnetic_anomaly_active(prev) {
            flags |= VERIFY_CHECKDATASIG;
        }
        flags
    }

    /// Required compact bits for the block following `prev`.
    pub fn get_target(&self, prev: &ChainEntry) -> u32 {
        if self.params.no_retargeting {
            return prev.bits;
        }

        if prev.height >= self.params.daa_height && prev.height >= 146 {
            let point = |height: u32| self.ancestor(prev, height).map(ChainEntry::work_point);
            let last3 = [
                point(prev.height - 2).expect("window ancestor"),
                point(prev.height - 1).expect("window ancestor"),
                prev.work_point(),
            ];
            let anchor = prev.height - 144;
            let first3 = [
                point(anchor - 2).expect("window ancestor"),
                point(anchor - 1).expect("window ancestor"),
                point(anchor).expect("window ancestor"),
            ];
            return cash_bits(first3, last3, &self.params);
        }

        let interval = self.params.retarget_interval;
        if (prev.height + 1) % interval != 0 {
            return prev.bits;
        }

        let first = self
            .ancestor(prev, prev.height + 1 - interval)
            .expect("retarget ancestor");
        legacy_bits(
            prev.bits,
            first.time as u64,
            prev.time as u64,
            &self.params,
        )
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn check_header(&self, header: &Header, prev: &ChainEntry) -> std::result::Result<(), VerifyError> {
        if !check_proof_of_work(header, &self.params) {
            return Err(VerifyError::new("high-hash", 50));
        }

        if header.bits != self.get_target(prev) {
            return Err(VerifyError::new("bad-diffbits", 100));
        }

        if header.time <= prev.median_time_past {
            return Err(VerifyError::new("time-too-old", 0));
        }

        if let Some(now) = self.adjusted_time {
            if header.time as u64 > now + MAX_TIME_DRIFT {
                return Err(VerifyError::new("time-too-new", 0));
            }
        }

        Ok(())
    }

    /// Non-contextual body checks plus the activation-conditional
    /// ordering rule.
    fn check_block(&self, block: &Block, prev: &ChainEntry) -> std::result::Result<(), VerifyError> {
        if block.txs.is_empty() {
            return Err(VerifyError::new("bad-blk-length", 100));
        }

        let size = block_size(block);
        if size > MAX_FORK_BLOCK_SIZE {
            return Err(VerifyError::new("bad-blk-length", 100));
        }

        if block.txs.len() > (size / BLOCK_TX_SIZE_RATIO).max(1) {
            return Err(VerifyError::new("bad-blk-length", 100));
        }

        if !block.txs[0].is_coinbase() {
            return Err(VerifyError::new("bad-cb-missing", 100));
        }
        for tx in &block.txs[1..] {
            if tx.is_coinbase() {
                return Err(VerifyError::new("bad-cb-multiple", 100));
            }
        }

        for tx in &block.txs {
            check_sanity(tx)?;
        }

        let (root, malleated) = block_merkle_root(block);
        if malleated {
            return Err(VerifyError::new("bad-txns-duplicate", 100));
        }
        if root != block.header.merkle_root {
            return Err(VerifyError::new("bad-txnmrklroot", 100));
        }

        if self.magnetic_anomaly_active(prev) {
            for pair in block.txs[1..].windows(2) {
                let a = txid_bytes(&tx_hash(&pair[0]));
                let b = txid_bytes(&tx_hash(&pair[1]));
                if a >= b {
                    return Err(VerifyError::new("tx-ordering", 100));
                }
            }
        }

        // Cheap sigop bound from the scripts alone; the accurate count
        // happens against the coin view during connection.
        let mut sigops = 0usize;
        for tx in &block.txs {
            sigops += crate::transaction::legacy_sigops(tx);
        }
        if sigops > max_block_sigops(size) {
            return Err(VerifyError::new("bad-blk-sigops", 100));
        }

        Ok(())
    }

    /// Full contextual validation of `block` as the next main-chain
    /// block. Produces the populated view, undo data, and fee total
    /// without mutating any state.
    ///
    /// Pre-activation blocks are processed transaction by transaction,
    /// which requires parents to precede children. Under canonical
    /// ordering a child may sort before its in-block parent, so all
    /// outputs are added to the view before any input is spent.
    fn contextual_check(
        &self,
        prev: &ChainEntry,
        block: &Block,
    ) -> std::result::Result<(CoinView, UndoData, Amount), VerifyError> {
        let height = prev.height + 1;
        let flags = self.flags_for(prev);
        let mtp = prev.median_time_past as u64;
        let max_sigops = max_block_sigops(block_size(block));
        let outputs_first = self.magnetic_anomaly_active(prev);

        let midstates: Vec<SighashMidstates> =
            block.txs.iter().map(SighashMidstates::new).collect();

        let mut view = CoinView::new();
        let mut undo = UndoData::new();
        let mut jobs: Vec<InputJob<'_>> = Vec::new();
        let mut fees: Amount = 0;
        let mut sigops = 0usize;

        if outputs_first {
            for tx in &block.txs {
                view.add_tx(tx, tx_hash(tx), height);
            }
        }

        for (i, tx) in block.txs.iter().enumerate() {
            if !tx.is_final(height, mtp) {
                return Err(VerifyError::new("bad-txns-nonfinal", 10));
            }

            sigops += total_sigops(tx, &mut view, self, flags);
            if sigops > max_sigops {
                return Err(VerifyError::new("bad-blk-sigops", 100));
            }

            if !tx.is_coinbase() {
                fees += check_inputs(tx, &mut view, self, height, self.params.coinbase_maturity)?;

                for (index, input) in tx.inputs.iter().enumerate() {
                    let coin = match view.spend(&input.prevout, self) {
                        Some(coin) => coin,
                        None => {
                            return Err(VerifyError::new("bad-txns-inputs-missingorspent", 0))
                        }
                    };
                    undo.push(input.prevout, coin.clone());
                    jobs.push(InputJob {
                        tx,
                        index,
                        coin,
                        flags,
                        midstates: &midstates[i],
                    });
                }
            }

            if !outputs_first {
                view.add_tx(tx, tx_hash(tx), height);
            }
        }

        let reward = crate::constants::get_reward(height, self.params.halving_interval);
        if block.txs[0].output_value() > fees + reward {
            return Err(VerifyError::new("bad-cb-amount", 100));
        }

        self.verifier.verify_inputs(&jobs)?;

        Ok((view, undo, fees))
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    /// Add a block to the chain.
    ///
    /// 1. Reject duplicates and descendants of invalid blocks.
    /// 2. Header and body checks against the parent entry.
    /// 3. Persist the entry and body.
    /// 4. If the new entry carries the most chainwork, make it the tip
    ///    (direct connect or reorganization); ties keep the earlier
    ///    arrival.
    pub fn add(&mut self, block: Block) -> Result<ChainEntry> {
        let hash = header_hash(&block.header);

        if self.entries.contains_key(&hash) {
            return Err(VerifyError::new("duplicate-block", 0).into());
        }
        if self.invalid.contains(&hash) || self.invalid.contains(&block.header.prev) {
            return Err(VerifyError::new("duplicate-invalid", 100).into());
        }

        let prev = self
            .entries
            .get(&block.header.prev)
            .cloned()
            .ok_or_else(|| VerifyError::new("orphan-prev", 0))?;

        if let Err(err) = self.check_header(&block.header, &prev) {
            self.invalid.insert(hash);
            return Err(err.into());
        }
        if let Err(err) = self.check_block(&block, &prev) {
            self.invalid.insert(hash);
            return Err(err.into());
        }

        let header = block.header;
        let entry = ChainEntry {
            hash,
            height: prev.height + 1,
            version: header.version,
            prev: header.prev,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            chainwork: prev.chainwork.wrapping_add(&work_from_bits(header.bits)),
            median_time_past: self.compute_mtp(Some(&prev), header.time),
        };

        self.store.write_batch(vec![
            WriteOp::Put(layout::entry(&hash), entry.to_bytes()),
            WriteOp::Put(layout::height(&hash), entry.height.to_le_bytes().to_vec()),
            WriteOp::Put(layout::block(&hash), encode_block(&block)),
        ])?;
        self.entries.insert(hash, entry.clone());

        if entry.chainwork > self.tip().chainwork {
            if entry.prev == self.tip {
                if let Err(err) = self.connect(&entry, &block) {
                    self.entries.remove(&hash);
                    self.invalid.insert(hash);
                    self.store.write_batch(vec![
                        WriteOp::Delete(layout::entry(&hash)),
                        WriteOp::Delete(layout::height(&hash)),
                        WriteOp::Delete(layout::block(&hash)),
                    ])?;
                    return Err(err);
                }
            } else {
                self.reorganize(&entry, &block)?;
            }
        } else {
            // A losing branch: remember it as a branch tip.
            self.store.write_batch(vec![
                WriteOp::Put(layout::branch_tip(&hash), vec![1]),
                WriteOp::Delete(layout::branch_tip(&entry.prev)),
            ])?;
        }

        Ok(entry)
    }

    /// Connect a block extending the current tip.
    fn connect(&mut self, entry: &ChainEntry, block: &Block) -> Result<()> {
        debug_assert_eq!(entry.prev, self.tip);

        let prev = self.tip().clone();
        let (view, undo, _fees) = self.contextual_check(&prev, block)?;

        let mut batch = Vec::new();
        for (outpoint, change) in view.changes() {
            match change {
                Some(coin) => {
                    batch.push(WriteOp::Put(layout::coin(outpoint), coin.to_bytes()));
                    self.utxo.insert(*outpoint, coin.clone());
                }
                None => {
                    batch.push(WriteOp::Delete(layout::coin(outpoint)));
                    self.utxo.remove(outpoint);
                }
            }
        }
        batch.push(WriteOp::Put(layout::undo(&entry.hash), undo.to_bytes()));
        batch.push(WriteOp::Put(layout::next(&entry.prev), entry.hash.to_vec()));
        batch.push(WriteOp::Put(
            layout::main_hash(entry.height),
            entry.hash.to_vec(),
        ));
        batch.push(WriteOp::Put(layout::TIP.to_vec(), entry.hash.to_vec()));
        self.store.write_batch(batch)?;

        self.main.push(entry.hash);
        self.tip = entry.hash;

        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in listeners.iter_mut() {
            listener.on_connect(entry, block, &view);
            listener.on_tip(entry);
        }
        self.listeners = listeners;

        Ok(())
    }

    /// Disconnect the tip, restoring the UTXO set from undo data.
    fn disconnect_tip(&mut self) -> Result<(ChainEntry, Block)> {
        let entry = self.tip().clone();
        if entry.height == 0 {
            return Err(StoreError::Corruption("cannot disconnect genesis".to_string()).into());
        }

        let block = self.read_block(&entry.hash)?;
        let undo_bytes = self
            .store
            .get(&layout::undo(&entry.hash))?
            .ok_or_else(|| StoreError::Corruption("undo data missing".to_string()))?;
        let undo =
            UndoData::from_bytes(&undo_bytes).map_err(|e| StoreError::Corruption(e.to_string()))?;

        let mut view = CoinView::new();
        for tx in block.txs.iter().rev() {
            view.remove_tx(tx, tx_hash(tx));
        }
        for (outpoint, coin) in undo.spent.iter().rev() {
            view.add(*outpoint, coin.clone());
        }

        let mut batch = Vec::new();
        for (outpoint, change) in view.changes() {
            match change {
                Some(coin) => {
                    batch.push(WriteOp::Put(layout::coin(outpoint), coin.to_bytes()));
                    self.utxo.insert(*outpoint, coin.clone());
                }
                None => {
                    batch.push(WriteOp::Delete(layout::coin(outpoint)));
                    self.utxo.remove(outpoint);
                }
            }
        }
        batch.push(WriteOp::Delete(layout::undo(&entry.hash)));
        batch.push(WriteOp::Delete(layout::next(&entry.prev)));
        batch.push(WriteOp::Delete(layout::main_hash(entry.height)));
        batch.push(WriteOp::Put(layout::TIP.to_vec(), entry.prev.to_vec()));
        self.store.write_batch(batch)?;

        self.main.pop();
        self.tip = entry.prev;

        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in listeners.iter_mut() {
            listener.on_disconnect(&entry, &block, &view);
        }
        self.listeners = listeners;

        Ok((entry, block))
    }

    /// Most recent common ancestor of two entries.
    fn find_fork(&self, a: &Hash, b: &Hash) -> std::result::Result<Hash, StoreError> {
        let missing = || StoreError::Corruption("fork walk left the entry table".to_string());

        let mut a = self.entries.get(a).ok_or_else(missing)?;
        let mut b = self.entries.get(b).ok_or_else(missing)?;

        while a.hash != b.hash {
            if a.height > b.height {
                a = self.entries.get(&a.prev).ok_or_else(missing)?;
            } else {
                b = self.entries.get(&b.prev).ok_or_else(missing)?;
            }
        }

        Ok(a.hash)
    }

    /// Switch the best chain to the branch ending in `competitor`.
    ///
    /// Disconnect back to the fork, then connect forward. A failing
    /// forward connect rolls the chain back to the original tip and
    /// marks the offending entry invalid.
    fn reorganize(&mut self, competitor: &ChainEntry, block: &Block) -> Result<()> {
        let fork = self.find_fork(&self.tip, &competitor.prev)?;

        let mut connect_list: Vec<Hash> = Vec::new();
        let mut cursor = competitor.hash;
        while cursor != fork {
            connect_list.push(cursor);
            cursor = self
                .entries
                .get(&cursor)
                .ok_or_else(|| StoreError::Corruption("broken branch".to_string()))?
                .prev;
        }
        connect_list.reverse();

        let mut disconnected: Vec<Hash> = Vec::new();
        while self.tip != fork {
            let (entry, _) = self.disconnect_tip()?;
            disconnected.push(entry.hash);
        }

        for hash in connect_list {
            let entry = self.entries[&hash].clone();
            let body = if hash == competitor.hash {
                block.clone()
            } else {
                self.read_block(&hash)?
            };

            if let Err(err) = self.connect(&entry, &body) {
                // Roll back to the original branch.
                while self.tip != fork {
                    self.disconnect_tip()?;
                }
                for old in disconnected.iter().rev() {
                    let old_entry = self.entries[old].clone();
                    let old_block = self.read_block(old)?;
                    self.connect(&old_entry, &old_block)?;
                }
                self.invalid.insert(hash);
                self.entries.remove(&hash);
                return Err(err);
            }
        }

        self.store.write_batch(vec![
            WriteOp::Delete(layout::branch_tip(&competitor.hash)),
            WriteOp::Put(layout::branch_tip(&disconnected_tip_hash(&disconnected)), vec![1]),
        ])?;

        Ok(())
    }

    /// Rewind the main chain to `height`, emitting a reset event.
    pub fn reset(&mut self, height: u32) -> Result<()> {
        while self.height() > height {
            self.disconnect_tip()?;
        }

        let tip = self.tip().clone();
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in listeners.iter_mut() {
            listener.on_reset(&tip);
        }
        self.listeners = listeners;

        Ok(())
    }

    /// Run the full body pipeline against the current tip without
    /// touching state. Block assembly uses this as its final guard, so
    /// header proof-of-work (not solved yet at that point) stays out.
    pub fn preverify(&self, block: &Block) -> Result<()> {
        let prev = self.tip().clone();
        self.check_block(block, &prev)?;
        self.contextual_check(&prev, block)?;
        Ok(())
    }

    /// Tear down the chain and hand the store back, e.g. to reopen.
    pub fn close(self) -> Box<dyn Store> {
        self.store
    }
}

/// First hash of the list, used to flag the abandoned branch tip.
fn disconnected_tip_hash(disconnected: &[Hash]) -> Hash {
    disconnected.first().copied().unwrap_or([0u8; 32])
}

/// Per-block sigop budget: 20k per started megabyte.
pub fn max_block_sigops(size: usize) -> usize {
    size.div_ceil(1_000_000).max(1) * MAX_BLOCK_SIGOPS_PER_MB
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("network", &self.params.name)
            .field("height", &self.height())
            .field("tip", &crate::types::rhash(&self.tip))
            .finish()
    }
}
