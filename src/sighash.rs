//! Signature hashing: the legacy quadratic algorithm (v0) and the
//! forkid linear algorithm (v1).
//!
//! The hashtype byte appended to each signature selects the algorithm
//! at verify time: v1 applies when the signature carries the forkid bit
//! and the verifier runs with the forkid flag; everything else falls
//! back to v0.

use crate::codec::{double_sha256, write_varint};
use crate::script::{VERIFY_REPLAY_PROTECTION, VERIFY_SIGHASH_FORKID};
use crate::types::{Amount, Hash, Transaction, ZERO_HASH};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Mask selecting the base hashtype.
pub const SIGHASH_BASE_MASK: u32 = 0x1f;

/// Hash returned by v0 for a SIGHASH_SINGLE input with no matching
/// output. Historically a bug, now consensus.
const ONE_HASH: Hash = {
    let mut hash = [0u8; 32];
    hash[0] = 0x01;
    hash
};

/// Per-transaction midstates of the v1 algorithm.
///
/// These depend only on the transaction body, so an immutable
/// transaction computes them once and reuses them for every input.
/// Mutable transactions must recompute instead of caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SighashMidstates {
    pub prevouts: Hash,
    pub sequences: Hash,
    pub outputs: Hash,
}

impl SighashMidstates {
    pub fn new(tx: &Transaction) -> Self {
        Self {
            prevouts: hash_prevouts(tx),
            sequences: hash_sequences(tx),
            outputs: hash_outputs(tx),
        }
    }
}

fn hash_prevouts(tx: &Transaction) -> Hash {
    let mut buf = Vec::with_capacity(tx.inputs.len() * 36);
    for input in &tx.inputs {
        buf.extend_from_slice(&input.prevout.hash);
        buf.extend_from_slice(&input.prevout.index.to_le_bytes());
    }
    double_sha256(&buf)
}

fn hash_sequences(tx: &Transaction) -> Hash {
    let mut buf = Vec::with_capacity(tx.inputs.len() * 4);
    for input in &tx.inputs {
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    }
    double_sha256(&buf)
}

fn hash_outputs(tx: &Transaction) -> Hash {
    let mut buf = Vec::new();
    for output in &tx.outputs {
        write_output(&mut buf, output.value, &output.script);
    }
    double_sha256(&buf)
}

fn write_output(buf: &mut Vec<u8>, value: Amount, script: &[u8]) {
    buf.extend_from_slice(&(value as u64).to_le_bytes());
    write_varint(buf, script.len() as u64);
    buf.extend_from_slice(script);
}

/// Strip every OP_CODESEPARATOR from a script, respecting push data.
fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut pos = 0;
    while pos < script.len() {
        let start = pos;
        let opcode = script[pos];
        pos += 1;

        let data_len = if opcode < 0x4c {
            opcode as usize
        } else if opcode == 0x4c {
            if pos >= script.len() {
                // Malformed trailing push; keep the raw bytes.
                out.extend_from_slice(&script[start..]);
                break;
            }
            let len = script[pos] as usize;
            pos += 1;
            len
        } else if opcode == 0x4d {
            if pos + 2 > script.len() {
                out.extend_from_slice(&script[start..]);
                break;
            }
            let len = u16::from_le_bytes([script[pos], script[pos + 1]]) as usize;
            pos += 2;
            len
        } else if opcode == 0x4e {
            if pos + 4 > script.len() {
                out.extend_from_slice(&script[start..]);
                break;
            }
            let len = u32::from_le_bytes([
                script[pos],
                script[pos + 1],
                script[pos + 2],
                script[pos + 3],
            ]) as usize;
            pos += 4;
            len
        } else {
            0
        };

        let end = (pos + data_len).min(script.len());
        pos = end;

        if opcode == 0xab && data_len == 0 {
            // OP_CODESEPARATOR itself.
            continue;
        }
        out.extend_from_slice(&script[start..end]);
    }
    out
}

/// SignatureHash: 𝒯𝒳 × ℕ × 𝕊 × ℤ × ℕ × ℕ → ℍ
///
/// Select and run the signature hash algorithm for one input:
/// 1. Under replay protection, rewrite the fork value first.
/// 2. v1 (forkid) when the hashtype carries SIGHASH_FORKID and the
///    verifier enables it; v0 otherwise.
pub fn signature_hash(
    tx: &Transaction,
    index: usize,
    script_code: &[u8],
    value: Amount,
    hashtype: u32,
    flags: u32,
    cache: Option<&SighashMidstates>,
) -> Hash {
    let mut hashtype = hashtype;

    if flags & VERIFY_REPLAY_PROTECTION != 0 {
        // Isolate signatures from the pre-fork chain: the 24-bit fork
        // value is xored with 0xdead and forced into an unused range.
        let fork_value = hashtype >> 8;
        hashtype = (((fork_value ^ 0xdead) | 0xff0000) << 8) | (hashtype & 0xff);
    }

    if hashtype & SIGHASH_FORKID != 0 && flags & VERIFY_SIGHASH_FORKID != 0 {
        sighash_v1(tx, index, script_code, value, hashtype, cache)
    } else {
        sighash_v0(tx, index, script_code, hashtype)
    }
}

/// The legacy algorithm: serialize a trimmed copy of the spending
/// transaction, append the 4-byte hashtype, and double hash.
fn sighash_v0(tx: &Transaction, index: usize, script_code: &[u8], hashtype: u32) -> Hash {
    let base = hashtype & SIGHASH_BASE_MASK;

    // No output to sign: historical behaviour returns a constant.
    if base == SIGHASH_SINGLE && index >= tx.outputs.len() {
        return ONE_HASH;
    }

    let script_code = strip_code_separators(script_code);

    let mut buf = Vec::new();
    buf.extend_from_slice(&tx.version.to_le_bytes());

    if hashtype & SIGHASH_ANYONECANPAY != 0 {
        write_varint(&mut buf, 1);
        let input = &tx.inputs[index];
        buf.extend_from_slice(&input.prevout.hash);
        buf.extend_from_slice(&input.prevout.index.to_le_bytes());
        write_varint(&mut buf, script_code.len() as u64);
        buf.extend_from_slice(&script_code);
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    } else {
        write_varint(&mut buf, tx.inputs.len() as u64);
        for (i, input) in tx.inputs.iter().enumerate() {
            buf.extend_from_slice(&input.prevout.hash);
            buf.extend_from_slice(&input.prevout.index.to_le_bytes());
            if i == index {
                write_varint(&mut buf, script_code.len() as u64);
                buf.extend_from_slice(&script_code);
            } else {
                write_varint(&mut buf, 0);
            }
            let sequence = if i != index && (base == SIGHASH_NONE || base == SIGHASH_SINGLE) {
                0
            } else {
                input.sequence
            };
            buf.extend_from_slice(&sequence.to_le_bytes());
        }
    }

    match base {
        SIGHASH_NONE => {
            write_varint(&mut buf, 0);
        }
        SIGHASH_SINGLE => {
            // Outputs after the signed one are dropped, earlier ones
            // are nulled out.
            write_varint(&mut buf, index as u64 + 1);
            for _ in 0..index {
                write_output(&mut buf, -1, &[]);
            }
            let output = &tx.outputs[index];
            write_output(&mut buf, output.value, &output.script);
        }
        _ => {
            write_varint(&mut buf, tx.outputs.len() as u64);
            for output in &tx.outputs {
                write_output(&mut buf, output.value, &output.script);
            }
        }
    }

    buf.extend_from_slice(&tx.locktime.to_le_bytes());
    buf.extend_from_slice(&hashtype.to_le_bytes());
    double_sha256(&buf)
}

/// The forkid algorithm: a linear preimage over cached midstates that
/// also commits to the value of the output being spent.
fn sighash_v1(
    tx: &Transaction,
    index: usize,
    script_code: &[u8],
    value: Amount,
    hashtype: u32,
    cache: Option<&SighashMidstates>,
) -> Hash {
    let base = hashtype & SIGHASH_BASE_MASK;
    let anyone = hashtype & SIGHASH_ANYONECANPAY != 0;

    let prevouts = if anyone {
        ZERO_HASH
    } else {
        cache.map(|c| c.prevouts).unwrap_or_else(|| hash_prevouts(tx))
    };

    let sequences = if anyone || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        ZERO_HASH
    } else {
        cache
            .map(|c| c.sequences)
            .unwrap_or_else(|| hash_sequences(tx))
    };

    let outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        cache.map(|c| c.outputs).unwrap_or_else(|| hash_outputs(tx))
    } else if base == SIGHASH_SINGLE && index < tx.outputs.len() {
        let mut buf = Vec::new();
        let output = &tx.outputs[index];
        write_output(&mut buf, output.value, &output.script);
        double_sha256(&buf)
    } else {
        ZERO_HASH
    };

    let input = &tx.inputs[index];

    let mut buf = Vec::new();
    buf.extend_from_slice(&tx.version.to_le_bytes());
    buf.extend_from_slice(&prevouts);
    buf.extend_from_slice(&sequences);
    buf.extend_from_slice(&input.prevout.hash);
    buf.extend_from_slice(&input.prevout.index.to_le_bytes());
    write_varint(&mut buf, script_code.len() as u64);
    buf.extend_from_slice(script_code);
    buf.extend_from_slice(&(value as u64).to_le_bytes());
    buf.extend_from_slice(&input.sequence.to_le_bytes());
    buf.extend_from_slice(&outputs);
    buf.extend_from_slice(&tx.locktime.to_le_bytes());
    buf.extend_from_slice(&hashtype.to_le_bytes());
    double_sha256(&buf)
}
