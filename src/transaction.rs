//! Transaction validation rules.
//!
//! Sanity checks are context free and never touch the UTXO set;
//! contextual checks resolve every input against a [`CoinView`] and
//! produce the fee. Failures carry the stable reason tag and ban score
//! defined by the error model.

use std::collections::HashSet;

use crate::codec::{encode_tx, double_sha256, tx_size};
use crate::constants::*;
use crate::error::VerifyError;
use crate::script::{count_p2sh_sigops, count_sigops, VERIFY_P2SH};
use crate::sighash::SighashMidstates;
use crate::types::{rhash, Amount, Bytes, Hash, Transaction};
use crate::utxo::{CoinSource, CoinView};

/// CheckSanity: 𝒯𝒳 → {ok, (reason, score)}
///
/// Context-free structural rules:
/// 1. At least one input and one output.
/// 2. Serialized size within MAX_TX_SIZE.
/// 3. Every output value, and the running total, within [0, MAX_MONEY].
/// 4. No duplicate prevouts across inputs.
/// 5. Coinbase script between 2 and 100 bytes; non-coinbase inputs all
///    non-null.
pub fn check_sanity(tx: &Transaction) -> Result<(), VerifyError> {
    if tx.inputs.is_empty() {
        return Err(VerifyError::new("bad-txns-vin-empty", 100));
    }
    if tx.outputs.is_empty() {
        return Err(VerifyError::new("bad-txns-vout-empty", 100));
    }

    if tx_size(tx) > MAX_TX_SIZE {
        return Err(VerifyError::new("bad-txns-oversize", 100));
    }

    let mut total: Amount = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(VerifyError::new("bad-txns-vout-negative", 100));
        }
        if output.value > MAX_MONEY {
            return Err(VerifyError::new("bad-txns-vout-toolarge", 100));
        }
        total += output.value;
        if total < 0 || total > MAX_MONEY {
            return Err(VerifyError::new("bad-txns-txouttotal-toolarge", 100));
        }
    }

    let mut prevouts = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !prevouts.insert(input.prevout) {
            return Err(VerifyError::new("bad-txns-inputs-duplicate", 100));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.inputs[0].script.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&script_len) {
            return Err(VerifyError::new("bad-cb-length", 100));
        }
    } else {
        for input in &tx.inputs {
            if input.prevout.is_null() {
                return Err(VerifyError::new("bad-txns-prevout-null", 10));
            }
        }
    }

    Ok(())
}

/// CheckInputs: 𝒯𝒳 × 𝒱 × ℕ → ℤ
///
/// Contextual rules against a coin view at the spending height:
/// 1. Every prevout resolves to an unspent coin.
/// 2. Coinbase coins need COINBASE_MATURITY confirmations.
/// 3. Input values and their sum stay in range.
/// 4. Inputs cover outputs; the fee lands in [0, MAX_MONEY].
///
/// Returns the fee. The view is only read, never mutated into spends.
pub fn check_inputs(
    tx: &Transaction,
    view: &mut CoinView,
    source: &dyn CoinSource,
    height: u32,
    maturity: u32,
) -> Result<Amount, VerifyError> {
    if tx.is_coinbase() {
        return Ok(0);
    }

    let mut total_in: Amount = 0;

    for input in &tx.inputs {
        let coin = view
            .get(&input.prevout, source)
            .ok_or_else(|| VerifyError::new("bad-txns-inputs-missingorspent", 0))?;

        if coin.coinbase && height < coin.height + maturity {
            return Err(VerifyError::new("bad-txns-premature-spend-of-coinbase", 0));
        }

        if coin.value() < 0 || coin.value() > MAX_MONEY {
            return Err(VerifyError::new("bad-txns-inputvalues-outofrange", 100));
        }
        total_in += coin.value();
        if total_in < 0 || total_in > MAX_MONEY {
            return Err(VerifyError::new("bad-txns-inputvalues-outofrange", 100));
        }
    }

    let total_out = tx.output_value();
    if total_in < total_out {
        return Err(VerifyError::new("bad-txns-in-belowout", 100));
    }

    let fee = total_in - total_out;
    if fee < 0 || fee > MAX_MONEY {
        return Err(VerifyError::new("bad-txns-fee-outofrange", 100));
    }

    Ok(fee)
}

/// Legacy sigop count over all input and output scripts, without
/// redeem script inspection.
pub fn legacy_sigops(tx: &Transaction) -> usize {
    let mut count = 0;
    for input in &tx.inputs {
        count += count_sigops(&input.script, false);
    }
    for output in &tx.outputs {
        count += count_sigops(&output.script, false);
    }
    count
}

/// Accurate sigops inside P2SH redeem scripts this transaction spends.
pub fn p2sh_sigops(tx: &Transaction, view: &mut CoinView, source: &dyn CoinSource) -> usize {
    if tx.is_coinbase() {
        return 0;
    }

    let mut count = 0;
    for input in &tx.inputs {
        if let Some(coin) = view.get(&input.prevout, source) {
            count += count_p2sh_sigops(&coin.output.script, &input.script);
        }
    }
    count
}

/// Combined sigop count under the given verification flags.
pub fn total_sigops(
    tx: &Transaction,
    view: &mut CoinView,
    source: &dyn CoinSource,
    flags: u32,
) -> usize {
    let mut count = legacy_sigops(tx);
    if flags & VERIFY_P2SH != 0 {
        count += p2sh_sigops(tx, view, source);
    }
    count
}

/// A transaction sealed for reuse: serialization, hash, and sighash
/// midstates are computed once at construction and never recomputed.
///
/// Anything long-lived, mempool entries and template entries above
/// all, holds a `SealedTx`; a mutable [`Transaction`] being built must
/// recompute hashes on every use instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedTx {
    tx: Transaction,
    raw: Bytes,
    hash: Hash,
    midstates: SighashMidstates,
}

impl SealedTx {
    pub fn seal(tx: Transaction) -> Self {
        let raw = encode_tx(&tx);
        let hash = double_sha256(&raw);
        let midstates = SighashMidstates::new(&tx);
        Self {
            tx,
            raw,
            hash,
            midstates,
        }
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Display-order transaction id.
    pub fn txid(&self) -> String {
        rhash(&self.hash)
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn midstates(&self) -> &SighashMidstates {
        &self.midstates
    }

    pub fn into_tx(self) -> Transaction {
        self.tx
    }
}
