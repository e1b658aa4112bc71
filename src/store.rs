//! Abstract persistence: a sorted key/value store with atomic batches,
//! plus the chain's key layout over it.
//!
//! The chain never assumes a storage technology; anything that can
//! satisfy [`Store`] (an LSM tree, a B-tree file, a remote service)
//! plugs in. [`MemStore`] is the in-memory reference used by tests.

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::types::{Hash, OutPoint};

/// Current chain schema version, written under [`layout::VERSION`].
pub const CHAIN_SCHEMA_VERSION: u32 = 5;

/// Schema version reserved for external indexers.
pub const INDEXER_SCHEMA_VERSION: u32 = 0;

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Sorted key/value map with atomic batch writes.
pub trait Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every operation or none.
    fn write_batch(&mut self, batch: Vec<WriteOp>) -> Result<(), StoreError>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// Key layout. Binary keys are fixed width, numeric parts big-endian
/// so that key order matches numeric order.
pub mod layout {
    use super::*;

    /// `V` → schema version.
    pub const VERSION: &[u8] = b"V";
    /// `O` → chain options.
    pub const OPTIONS: &[u8] = b"O";
    /// `R` → tip hash.
    pub const TIP: &[u8] = b"R";

    fn hashed(prefix: u8, hash: &Hash) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(prefix);
        key.extend_from_slice(hash);
        key
    }

    /// `e[hash]` → chain entry.
    pub fn entry(hash: &Hash) -> Vec<u8> {
        hashed(b'e', hash)
    }

    /// `h[hash]` → height.
    pub fn height(hash: &Hash) -> Vec<u8> {
        hashed(b'h', hash)
    }

    /// `H[height]` → main chain hash.
    pub fn main_hash(height: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(5);
        key.push(b'H');
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    /// `n[hash]` → next main chain hash.
    pub fn next(hash: &Hash) -> Vec<u8> {
        hashed(b'n', hash)
    }

    /// `p[hash]` → branch tip flag.
    pub fn branch_tip(hash: &Hash) -> Vec<u8> {
        hashed(b'p', hash)
    }

    /// `b[hash]` → block bytes.
    pub fn block(hash: &Hash) -> Vec<u8> {
        hashed(b'b', hash)
    }

    /// `c[hash, index]` → utxo entry.
    pub fn coin(outpoint: &OutPoint) -> Vec<u8> {
        let mut key = Vec::with_capacity(37);
        key.push(b'c');
        key.extend_from_slice(&outpoint.hash);
        key.extend_from_slice(&outpoint.index.to_be_bytes());
        key
    }

    /// `u[hash]` → undo data.
    pub fn undo(hash: &Hash) -> Vec<u8> {
        hashed(b'u', hash)
    }

    /// `v[bit, hash]` → version bits state cache.
    pub fn version_bits(bit: u8, hash: &Hash) -> Vec<u8> {
        let mut key = Vec::with_capacity(34);
        key.push(b'v');
        key.push(bit);
        key.extend_from_slice(hash);
        key
    }
}

/// In-memory store over a sorted map.
#[derive(Debug, Default)]
pub struct MemStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.get(key).cloned())
    }

    fn write_batch(&mut self, batch: Vec<WriteOp>) -> Result<(), StoreError> {
        for op in batch {
            match op {
                WriteOp::Put(key, value) => {
                    self.map.insert(key, value);
                }
                WriteOp::Delete(key) => {
                    self.map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Read and verify the schema version, writing it on first open.
pub fn check_version(store: &mut dyn Store) -> Result<(), StoreError> {
    match store.get(layout::VERSION)? {
        Some(bytes) => {
            if bytes.len() != 4 {
                return Err(StoreError::Corruption("bad version record".to_string()));
            }
            let found = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if found != CHAIN_SCHEMA_VERSION {
                return Err(StoreError::SchemaVersion {
                    found,
                    expected: CHAIN_SCHEMA_VERSION,
                });
            }
            Ok(())
        }
        None => store.write_batch(vec![WriteOp::Put(
            layout::VERSION.to_vec(),
            CHAIN_SCHEMA_VERSION.to_le_bytes().to_vec(),
        )]),
    }
}
