//! Unspent output tracking: coin entries, the per-validation overlay
//! view, and undo records for disconnecting blocks.

use std::collections::HashMap;

use crate::codec::{varint_size, write_varint};
use crate::error::CodecError;
use crate::types::{Amount, Hash, OutPoint, Output, Transaction};

/// One unspent output plus the context needed to validate a spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub output: Output,
    pub height: u32,
    pub coinbase: bool,
}

impl UtxoEntry {
    pub fn new(output: Output, height: u32, coinbase: bool) -> Self {
        Self {
            output,
            height,
            coinbase,
        }
    }

    pub fn value(&self) -> Amount {
        self.output.value
    }

    /// Store encoding: value, height, coinbase flag, script.
    pub fn to_bytes(&self) -> Vec<u8> {
        let script = &self.output.script;
        let mut buf = Vec::with_capacity(13 + varint_size(script.len() as u64) + script.len());
        buf.extend_from_slice(&(self.output.value as u64).to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.push(self.coinbase as u8);
        write_varint(&mut buf, script.len() as u64);
        buf.extend_from_slice(script);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 14 {
            return Err(CodecError::UnexpectedEnd);
        }
        let mut value = [0u8; 8];
        value.copy_from_slice(&data[0..8]);
        let mut height = [0u8; 4];
        height.copy_from_slice(&data[8..12]);
        let coinbase = data[12] != 0;

        // Script length varint, bounded by the entry size.
        let (script_len, offset) = match data[13] {
            len @ 0..=0xfc => (len as usize, 14),
            0xfd => {
                if data.len() < 16 {
                    return Err(CodecError::UnexpectedEnd);
                }
                (u16::from_le_bytes([data[14], data[15]]) as usize, 16)
            }
            _ => return Err(CodecError::OversizedAllocation(data.len() as u64)),
        };

        if data.len() != offset + script_len {
            return Err(CodecError::TrailingBytes);
        }

        Ok(Self {
            output: Output {
                value: u64::from_le_bytes(value) as i64,
                script: data[offset..].to_vec(),
            },
            height: u32::from_le_bytes(height),
            coinbase,
        })
    }
}

/// Backing coin lookup, usually the chain's committed UTXO set.
pub trait CoinSource {
    fn coin(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;
}

/// A source with no coins.
pub struct EmptySource;

impl CoinSource for EmptySource {
    fn coin(&self, _outpoint: &OutPoint) -> Option<UtxoEntry> {
        None
    }
}

impl CoinSource for HashMap<OutPoint, UtxoEntry> {
    fn coin(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.get(outpoint).cloned()
    }
}

/// CoinView: overlay of pending UTXO changes during one validation.
///
/// Maps outpoints to `Some(entry)` (created or read through) or `None`
/// (spent). Intra-block spends resolve against the overlay before the
/// backing source, so a transaction can spend an output created two
/// slots earlier in the same block.
#[derive(Debug, Default)]
pub struct CoinView {
    map: HashMap<OutPoint, Option<UtxoEntry>>,
}

impl CoinView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an outpoint, reading through to the backing source.
    pub fn get(&mut self, outpoint: &OutPoint, source: &dyn CoinSource) -> Option<UtxoEntry> {
        if let Some(cached) = self.map.get(outpoint) {
            return cached.clone();
        }
        let entry = source.coin(outpoint);
        self.map.insert(*outpoint, entry.clone());
        entry
    }

    /// Spend an outpoint, returning the consumed entry.
    pub fn spend(&mut self, outpoint: &OutPoint, source: &dyn CoinSource) -> Option<UtxoEntry> {
        let entry = self.get(outpoint, source)?;
        self.map.insert(*outpoint, None);
        Some(entry)
    }

    /// Record a created output.
    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.map.insert(outpoint, Some(entry));
    }

    /// Add every output of a connected transaction.
    pub fn add_tx(&mut self, tx: &Transaction, hash: Hash, height: u32) {
        let coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.add(
                OutPoint::new(hash, index as u32),
                UtxoEntry::new(output.clone(), height, coinbase),
            );
        }
    }

    /// Remove every output of a disconnected transaction.
    pub fn remove_tx(&mut self, tx: &Transaction, hash: Hash) {
        for index in 0..tx.outputs.len() {
            self.map.insert(OutPoint::new(hash, index as u32), None);
        }
    }

    /// Drain the overlay into its final (outpoint, change) pairs.
    pub fn changes(&self) -> impl Iterator<Item = (&OutPoint, &Option<UtxoEntry>)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Undo record of one connected block: the coins its transactions
/// consumed, in spend order. Replaying it backwards restores the UTXO
/// set exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoData {
    pub spent: Vec<(OutPoint, UtxoEntry)>,
}

impl UndoData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.spent.push((outpoint, entry));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, self.spent.len() as u64);
        for (outpoint, entry) in &self.spent {
            buf.extend_from_slice(&outpoint.hash);
            buf.extend_from_slice(&outpoint.index.to_le_bytes());
            let entry_bytes = entry.to_bytes();
            write_varint(&mut buf, entry_bytes.len() as u64);
            buf.extend_from_slice(&entry_bytes);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0usize;

        let read_varint = |data: &[u8], pos: &mut usize| -> Result<u64, CodecError> {
            if *pos >= data.len() {
                return Err(CodecError::UnexpectedEnd);
            }
            let prefix = data[*pos];
            *pos += 1;
            match prefix {
                0xfd => {
                    if *pos + 2 > data.len() {
                        return Err(CodecError::UnexpectedEnd);
                    }
                    let value = u16::from_le_bytes([data[*pos], data[*pos + 1]]) as u64;
                    *pos += 2;
                    Ok(value)
                }
                0xfe => {
                    if *pos + 4 > data.len() {
                        return Err(CodecError::UnexpectedEnd);
                    }
                    let value = u32::from_le_bytes([
                        data[*pos],
                        data[*pos + 1],
                        data[*pos + 2],
                        data[*pos + 3],
                    ]) as u64;
                    *pos += 4;
                    Ok(value)
                }
                byte if byte < 0xfd => Ok(byte as u64),
                _ => Err(CodecError::OversizedAllocation(u64::MAX)),
            }
        };

        let count = read_varint(data, &mut pos)?;
        if count as usize > data.len() / 36 + 1 {
            return Err(CodecError::OversizedAllocation(count));
        }

        let mut spent = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if pos + 36 > data.len() {
                return Err(CodecError::UnexpectedEnd);
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&data[pos..pos + 32]);
            let index = u32::from_le_bytes([
                data[pos + 32],
                data[pos + 33],
                data[pos + 34],
                data[pos + 35],
            ]);
            pos += 36;

            let entry_len = read_varint(data, &mut pos)? as usize;
            if pos + entry_len > data.len() {
                return Err(CodecError::UnexpectedEnd);
            }
            let entry = UtxoEntry::from_bytes(&data[pos..pos + entry_len])?;
            pos += entry_len;

            spent.push((OutPoint::new(hash, index), entry));
        }

        if pos != data.len() {
            return Err(CodecError::TrailingBytes);
        }

        Ok(Self { spent })
    }
}
