//! Exact little-endian wire codec for consensus objects.
//!
//! Hashing is defined over this canonical serialization: a transaction
//! hash is the double-SHA-256 of [`encode_tx`], a block hash the
//! double-SHA-256 of the 80-byte header.

use sha2::{Digest, Sha256};

use crate::error::CodecError;
use crate::types::*;

/// Double SHA-256.
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Serialized size of a varint.
pub fn varint_size(value: u64) -> usize {
    if value < 0xfd {
        1
    } else if value <= 0xffff {
        3
    } else if value <= 0xffff_ffff {
        5
    } else {
        9
    }
}

/// Append a varint: one byte below 0xfd, then 0xfd+u16, 0xfe+u32, 0xff+u64.
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Byte cursor over an immutable buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_hash(&mut self) -> Result<Hash, CodecError> {
        let bytes = self.take(32)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    /// Canonical varint: a wider encoding of a value that fits a
    /// narrower one is rejected.
    fn read_varint(&mut self) -> Result<u64, CodecError> {
        let prefix = self.read_u8()?;
        match prefix {
            0xfd => {
                let value = self.read_u16()? as u64;
                if value < 0xfd {
                    return Err(CodecError::NonCanonicalVarint);
                }
                Ok(value)
            }
            0xfe => {
                let value = self.read_u32()? as u64;
                if value <= 0xffff {
                    return Err(CodecError::NonCanonicalVarint);
                }
                Ok(value)
            }
            0xff => {
                let value = self.read_u64()?;
                if value <= 0xffff_ffff {
                    return Err(CodecError::NonCanonicalVarint);
                }
                Ok(value)
            }
            byte => Ok(byte as u64),
        }
    }

    /// Read a count that prefixes `min_size`-byte items, bounding the
    /// allocation by the bytes actually remaining.
    fn read_count(&mut self, min_size: usize) -> Result<usize, CodecError> {
        let count = self.read_varint()?;
        if count as usize > self.remaining() / min_size.max(1) + 1 {
            return Err(CodecError::OversizedAllocation(count));
        }
        Ok(count as usize)
    }

    fn read_bytes(&mut self) -> Result<Bytes, CodecError> {
        let len = self.read_varint()?;
        if len as usize > self.remaining() {
            return Err(CodecError::OversizedAllocation(len));
        }
        Ok(self.take(len as usize)?.to_vec())
    }
}

fn write_input(buf: &mut Vec<u8>, input: &Input) {
    buf.extend_from_slice(&input.prevout.hash);
    buf.extend_from_slice(&input.prevout.index.to_le_bytes());
    write_varint(buf, input.script.len() as u64);
    buf.extend_from_slice(&input.script);
    buf.extend_from_slice(&input.sequence.to_le_bytes());
}

fn write_output(buf: &mut Vec<u8>, output: &Output) {
    buf.extend_from_slice(&(output.value as u64).to_le_bytes());
    write_varint(buf, output.script.len() as u64);
    buf.extend_from_slice(&output.script);
}

fn read_input(reader: &mut Reader) -> Result<Input, CodecError> {
    let hash = reader.read_hash()?;
    let index = reader.read_u32()?;
    let script = reader.read_bytes()?;
    let sequence = reader.read_u32()?;
    Ok(Input {
        prevout: OutPoint { hash, index },
        script,
        sequence,
    })
}

fn read_output(reader: &mut Reader) -> Result<Output, CodecError> {
    let value = reader.read_u64()? as i64;
    let script = reader.read_bytes()?;
    Ok(Output { value, script })
}

fn read_tx(reader: &mut Reader) -> Result<Transaction, CodecError> {
    let version = reader.read_u32()?;

    let input_count = reader.read_count(41)?;
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        inputs.push(read_input(reader)?);
    }

    let output_count = reader.read_count(9)?;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        outputs.push(read_output(reader)?);
    }

    let locktime = reader.read_u32()?;

    Ok(Transaction {
        version,
        inputs,
        outputs,
        locktime,
    })
}

/// Serialize a transaction: version, varint input count, inputs,
/// varint output count, outputs, locktime.
pub fn encode_tx(tx: &Transaction) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tx_size(tx));
    buf.extend_from_slice(&tx.version.to_le_bytes());
    write_varint(&mut buf, tx.inputs.len() as u64);
    for input in &tx.inputs {
        write_input(&mut buf, input);
    }
    write_varint(&mut buf, tx.outputs.len() as u64);
    for output in &tx.outputs {
        write_output(&mut buf, output);
    }
    buf.extend_from_slice(&tx.locktime.to_le_bytes());
    buf
}

/// Decode a transaction, requiring the buffer to be fully consumed.
pub fn decode_tx(data: &[u8]) -> Result<Transaction, CodecError> {
    let mut reader = Reader::new(data);
    let tx = read_tx(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(CodecError::TrailingBytes);
    }
    Ok(tx)
}

/// Serialized transaction size without materializing the encoding.
pub fn tx_size(tx: &Transaction) -> usize {
    let mut size = 4 + 4;
    size += varint_size(tx.inputs.len() as u64);
    for input in &tx.inputs {
        size += 36 + varint_size(input.script.len() as u64) + input.script.len() + 4;
    }
    size += varint_size(tx.outputs.len() as u64);
    for output in &tx.outputs {
        size += 8 + varint_size(output.script.len() as u64) + output.script.len();
    }
    size
}

/// Transaction hash: double-SHA-256 of the canonical serialization.
pub fn tx_hash(tx: &Transaction) -> Hash {
    double_sha256(&encode_tx(tx))
}

/// Serialize the fixed 80-byte header.
pub fn encode_header(header: &Header) -> [u8; 80] {
    let mut buf = [0u8; 80];
    buf[0..4].copy_from_slice(&header.version.to_le_bytes());
    buf[4..36].copy_from_slice(&header.prev);
    buf[36..68].copy_from_slice(&header.merkle_root);
    buf[68..72].copy_from_slice(&header.time.to_le_bytes());
    buf[72..76].copy_from_slice(&header.bits.to_le_bytes());
    buf[76..80].copy_from_slice(&header.nonce.to_le_bytes());
    buf
}

pub fn decode_header(data: &[u8]) -> Result<Header, CodecError> {
    let mut reader = Reader::new(data);
    let header = read_header(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(CodecError::TrailingBytes);
    }
    Ok(header)
}

fn read_header(reader: &mut Reader) -> Result<Header, CodecError> {
    let version = reader.read_u32()? as i32;
    let prev = reader.read_hash()?;
    let merkle_root = reader.read_hash()?;
    let time = reader.read_u32()?;
    let bits = reader.read_u32()?;
    let nonce = reader.read_u32()?;
    Ok(Header {
        version,
        prev,
        merkle_root,
        time,
        bits,
        nonce,
    })
}

/// Block hash: double-SHA-256 of the 80-byte header.
pub fn header_hash(header: &Header) -> Hash {
    double_sha256(&encode_header(header))
}

/// Serialize a block: 80-byte header, varint tx count, transactions.
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block_size(block));
    buf.extend_from_slice(&encode_header(&block.header));
    write_varint(&mut buf, block.txs.len() as u64);
    for tx in &block.txs {
        buf.extend_from_slice(&encode_tx(tx));
    }
    buf
}

pub fn decode_block(data: &[u8]) -> Result<Block, CodecError> {
    let mut reader = Reader::new(data);
    let header = read_header(&mut reader)?;
    let tx_count = reader.read_count(60)?;
    let mut txs = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        txs.push(read_tx(&mut reader)?);
    }
    if reader.remaining() != 0 {
        return Err(CodecError::TrailingBytes);
    }
    Ok(Block { header, txs })
}

/// Serialized block size.
pub fn block_size(block: &Block) -> usize {
    let mut size = 80 + varint_size(block.txs.len() as u64);
    for tx in &block.txs {
        size += tx_size(tx);
    }
    size
}

/// MerkleRoot: ℍ* → ℍ × {true, false}
///
/// Binary double-SHA-256 tree with odd-sibling duplication. The second
/// return is the malleation flag: true when two *distinct* siblings at
/// any level hash identically, which an attacker can exploit to mutate
/// a block without changing its root. The legitimate duplication of an
/// odd trailing node is not flagged.
pub fn merkle_root(mut hashes: Vec<Hash>) -> (Hash, bool) {
    if hashes.is_empty() {
        return (ZERO_HASH, false);
    }

    let mut malleated = false;

    while hashes.len() > 1 {
        let mut i = 0;
        while i + 1 < hashes.len() {
            if hashes[i] == hashes[i + 1] {
                malleated = true;
            }
            i += 2;
        }

        if hashes.len() % 2 == 1 {
            let last = *hashes.last().expect("non-empty level");
            hashes.push(last);
        }

        let mut next = Vec::with_capacity(hashes.len() / 2);
        for pair in hashes.chunks(2) {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(&pair[1]);
            next.push(double_sha256(&buf));
        }
        hashes = next;
    }

    (hashes[0], malleated)
}

/// Merkle root over a block's transactions.
pub fn block_merkle_root(block: &Block) -> (Hash, bool) {
    let hashes: Vec<Hash> = block.txs.iter().map(tx_hash).collect();
    merkle_root(hashes)
}
