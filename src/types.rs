//! Core data model: hashes, amounts, transactions, headers, blocks.

use serde::{Deserialize, Serialize};

use crate::constants::*;

/// 256-bit hash, stored in wire order.
pub type Hash = [u8; 32];

/// Raw byte string (scripts, payloads).
pub type Bytes = Vec<u8>;

/// Amount in base currency units. Signed so that fee arithmetic and
/// range violations stay representable.
pub type Amount = i64;

/// The all-zero hash.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Render a hash the way block explorers do: hex of the reversed bytes.
pub fn rhash(hash: &Hash) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}

/// Transaction id bytes: the hash in reversed (display) byte order.
/// Canonical transaction ordering compares these ascending.
pub fn txid_bytes(hash: &Hash) -> [u8; 32] {
    let mut bytes = *hash;
    bytes.reverse();
    bytes
}

/// Reference to a specific output of a prior transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The null outpoint marks a coinbase input.
    pub fn null() -> Self {
        Self {
            hash: ZERO_HASH,
            index: 0xffff_ffff,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == 0xffff_ffff
    }
}

/// Transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub prevout: OutPoint,
    pub script: Bytes,
    pub sequence: u32,
}

/// Transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub value: Amount,
    pub script: Bytes,
}

/// Transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub locktime: u32,
}

impl Transaction {
    /// A transaction is a coinbase iff its single input has a null prevout.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Sum of output values. May exceed `MAX_MONEY`; range checking is
    /// the sanity check's job.
    pub fn output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// IsFinal: 𝒯𝒳 × ℕ × ℕ → {true, false}
    ///
    /// A transaction is final at `height` and median time `time` when:
    /// 1. locktime = 0, or
    /// 2. locktime < height (height locks) / time (time locks), or
    /// 3. every input carries the final sequence number.
    pub fn is_final(&self, height: u32, time: u64) -> bool {
        if self.locktime == 0 {
            return true;
        }

        let threshold = if self.locktime < LOCKTIME_THRESHOLD {
            height as u64
        } else {
            time
        };

        if (self.locktime as u64) < threshold {
            return true;
        }

        self.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
    }
}

/// Block header. The block hash is the double-SHA-256 of its 80-byte
/// serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: i32,
    pub prev: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

/// Block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Transaction>,
}
