//! Address encoding: Base58Check and cashaddr.
//!
//! An address is a script template type plus a 160-bit hash. Both
//! encodings carry the network in-band, Base58Check as a version byte
//! and cashaddr as the human readable prefix, so decoding always
//! validates against the expected network parameters.

use sha2::{Digest, Sha256};

use crate::codec::double_sha256;
use crate::error::AddressError;
use crate::params::Params;
use crate::types::Bytes;

const BASE58_ALPHABET: &[u8; 58] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const CASHADDR_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Longest Base58Check string we will attempt to decode.
const MAX_BASE58_SIZE: usize = 55;

/// Script template the address commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    PubkeyHash,
    ScriptHash,
}

/// A (type, 160-bit hash) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub ty: AddressType,
    pub hash: [u8; 20],
}

impl Address {
    pub fn pubkey_hash(hash: [u8; 20]) -> Self {
        Self {
            ty: AddressType::PubkeyHash,
            hash,
        }
    }

    pub fn script_hash(hash: [u8; 20]) -> Self {
        Self {
            ty: AddressType::ScriptHash,
            hash,
        }
    }

    /// Hash a public key into its P2PKH address.
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        let sha = Sha256::digest(pubkey);
        let rmd = ripemd::Ripemd160::digest(sha);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&rmd);
        Self::pubkey_hash(hash)
    }

    /// Output script paying to this address.
    pub fn to_script(&self) -> Bytes {
        match self.ty {
            AddressType::PubkeyHash => {
                // OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG
                let mut script = Vec::with_capacity(25);
                script.push(0x76);
                script.push(0xa9);
                script.push(20);
                script.extend_from_slice(&self.hash);
                script.push(0x88);
                script.push(0xac);
                script
            }
            AddressType::ScriptHash => {
                // OP_HASH160 <hash> OP_EQUAL
                let mut script = Vec::with_capacity(23);
                script.push(0xa9);
                script.push(20);
                script.extend_from_slice(&self.hash);
                script.push(0x87);
                script
            }
        }
    }

    /// Base58Check: `version | hash | first 4 bytes of dSHA-256`.
    pub fn to_base58(&self, params: &Params) -> String {
        let version = match self.ty {
            AddressType::PubkeyHash => params.address.pubkeyhash,
            AddressType::ScriptHash => params.address.scripthash,
        };

        let mut payload = Vec::with_capacity(25);
        payload.push(version);
        payload.extend_from_slice(&self.hash);
        let checksum = double_sha256(&payload);
        payload.extend_from_slice(&checksum[..4]);

        base58_encode(&payload)
    }

    pub fn from_base58(s: &str, params: &Params) -> Result<Self, AddressError> {
        if s.len() > MAX_BASE58_SIZE {
            return Err(AddressError::InvalidBase58Length);
        }

        let payload = base58_decode(s)?;
        if payload.len() != 25 {
            return Err(AddressError::InvalidBase58Length);
        }

        let checksum = double_sha256(&payload[..21]);
        if payload[21..] != checksum[..4] {
            return Err(AddressError::InvalidBase58Checksum);
        }

        let ty = if payload[0] == params.address.pubkeyhash {
            AddressType::PubkeyHash
        } else if payload[0] == params.address.scripthash {
            AddressType::ScriptHash
        } else {
            return Err(AddressError::UnknownPrefix);
        };

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..21]);
        Ok(Self { ty, hash })
    }

    /// Cashaddr: `prefix ':' base32(version byte | hash | checksum40)`.
    pub fn to_cashaddr(&self, params: &Params) -> String {
        let prefix = params.address.cashaddr;
        let type_bits = match self.ty {
            AddressType::PubkeyHash => 0u8,
            AddressType::ScriptHash => 1u8,
        };
        // Low three bits encode the hash size class; 160 bits is class 0.
        let version = type_bits << 3;

        let mut payload = Vec::with_capacity(21);
        payload.push(version);
        payload.extend_from_slice(&self.hash);
        let mut data = convert_bits(&payload, 8, 5, true).expect("padding allowed");

        let mut checked = expand_prefix(prefix);
        checked.extend_from_slice(&data);
        checked.extend_from_slice(&[0u8; 8]);
        let checksum = polymod(&checked);
        for i in 0..8 {
            data.push(((checksum >> (5 * (7 - i))) & 0x1f) as u8);
        }

        let mut out = String::with_capacity(prefix.len() + 1 + data.len());
        out.push_str(prefix);
        out.push(':');
        for value in data {
            out.push(CASHADDR_CHARSET[value as usize] as char);
        }
        out
    }

    pub fn from_cashaddr(s: &str, params: &Params) -> Result<Self, AddressError> {
        let (prefix, body) = match s.rfind(':') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => (params.address.cashaddr, s),
        };

        if body.is_empty() {
            return Err(AddressError::InvalidString);
        }

        // Mixed case anywhere after the separator is a hard reject; a
        // checksum over a case-folded string would otherwise accept it.
        let has_lower = body.bytes().any(|b| b.is_ascii_lowercase());
        let has_upper = body.bytes().any(|b| b.is_ascii_uppercase());
        if has_lower && has_upper {
            return Err(AddressError::InvalidCasing);
        }

        let prefix = prefix.to_lowercase();
        if prefix != params.address.cashaddr {
            return Err(AddressError::UnknownPrefix);
        }

        let mut data = Vec::with_capacity(body.len());
        for byte in body.bytes() {
            let c = byte.to_ascii_lowercase();
            let value = CASHADDR_CHARSET
                .iter()
                .position(|&x| x == c)
                .ok_or(AddressError::InvalidCashaddrCharacter)?;
            data.push(value as u8);
        }

        if data.len() < 9 {
            return Err(AddressError::InvalidCashaddrLength);
        }

        let mut checked = expand_prefix(&prefix);
        checked.extend_from_slice(&data);
        if polymod(&checked) != 0 {
            return Err(AddressError::InvalidCashaddrChecksum);
        }

        let payload = convert_bits(&data[..data.len() - 8], 5, 8, false)?;
        if payload.is_empty() {
            return Err(AddressError::InvalidCashaddrLength);
        }

        let version = payload[0];
        if version & 0x80 != 0 {
            return Err(AddressError::InvalidVersionByte);
        }

        let ty = match (version >> 3) & 0x0f {
            0 => AddressType::PubkeyHash,
            1 => AddressType::ScriptHash,
            _ => return Err(AddressError::InvalidVersionByte),
        };

        let size = match version & 0x07 {
            0 => 20usize,
            1 => 24,
            2 => 28,
            3 => 32,
            4 => 40,
            5 => 48,
            6 => 56,
            7 => 64,
            _ => unreachable!(),
        };

        let hash_bytes = &payload[1..];
        if hash_bytes.len() != size || size != 20 {
            return Err(AddressError::InvalidCashaddrLength);
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(hash_bytes);
        Ok(Self { ty, hash })
    }

    /// Parse an untyped address string.
    ///
    /// Mixed case cannot be a cashaddr, so it goes straight to Base58;
    /// otherwise cashaddr is tried first with Base58 as the fallback.
    pub fn parse(s: &str, params: &Params) -> Result<Self, AddressError> {
        let has_lower = s.bytes().any(|b| b.is_ascii_lowercase());
        let has_upper = s.bytes().any(|b| b.is_ascii_uppercase());

        if has_lower && has_upper {
            return Self::from_base58(s, params);
        }

        match Self::from_cashaddr(s, params) {
            Ok(address) => Ok(address),
            Err(AddressError::InvalidCasing) => Err(AddressError::InvalidCasing),
            Err(_) => Self::from_base58(s, params),
        }
    }
}

fn base58_encode(data: &[u8]) -> String {
    let zeros = data.iter().take_while(|&&b| b == 0).count();

    // Repeated division of the big-endian number by 58.
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 138 / 100 + 1);
    for &byte in data {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    for _ in 0..zeros {
        out.push('1');
    }
    for &digit in digits.iter().rev() {
        out.push(BASE58_ALPHABET[digit as usize] as char);
    }
    out
}

fn base58_decode(s: &str) -> Result<Vec<u8>, AddressError> {
    let zeros = s.bytes().take_while(|&b| b == b'1').count();

    let mut bytes: Vec<u8> = Vec::with_capacity(s.len());
    for c in s.bytes() {
        let value = BASE58_ALPHABET
            .iter()
            .position(|&x| x == c)
            .ok_or(AddressError::InvalidBase58Character)? as u32;

        let mut carry = value;
        for byte in bytes.iter_mut() {
            carry += *byte as u32 * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

/// The 40-bit cashaddr checksum polynomial over 5-bit symbols.
fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x0007_ffff_ffff) << 5) ^ d as u64;
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

/// Lower five bits of each prefix character, then a zero separator.
fn expand_prefix(prefix: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1);
    for byte in prefix.bytes() {
        out.push(byte & 0x1f);
    }
    out.push(0);
    out
}

/// Regroup a bit string, most significant bits first.
///
/// With `pad`, leftover bits are flushed zero-extended. Without it,
/// there must be fewer leftover bits than one input symbol and they
/// must all be zero.
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>, AddressError> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let maxv: u32 = (1 << to) - 1;
    let mut out = Vec::with_capacity((data.len() as u32 * from / to + 1) as usize);

    for &value in data {
        acc = (acc << from) | value as u32;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }

    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from {
        return Err(AddressError::InvalidPadding);
    } else if (acc << (to - bits)) & maxv != 0 {
        return Err(AddressError::NonZeroPadding);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash20(hex_str: &str) -> [u8; 20] {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hex::decode(hex_str).unwrap());
        hash
    }

    #[test]
    fn test_base58_leading_zeros() {
        let encoded = base58_encode(&[0, 0, 1]);
        assert_eq!(encoded, "112");
        assert_eq!(base58_decode(&encoded).unwrap(), vec![0, 0, 1]);
    }

    #[test]
    fn test_base58_round_trip() {
        let data = vec![0x00, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        assert_eq!(base58_decode(&base58_encode(&data)).unwrap(), data);
    }

    #[test]
    fn test_base58_rejects_bad_character() {
        assert_eq!(
            base58_decode("1Il0O").unwrap_err(),
            AddressError::InvalidBase58Character
        );
    }

    #[test]
    fn test_p2pkh_round_trip_mainnet() {
        let params = Params::main();
        let address = Address::pubkey_hash(hash20("e34cce70c86373273efcc54ce7d2a491bb4a0e84"));

        let base58 = address.to_base58(&params);
        assert_eq!(base58, "1MirQ9bwyQcGVJPwKUgapu5ouK2E2Ey4gX");
        assert_eq!(Address::from_base58(&base58, &params).unwrap(), address);

        let cash = address.to_cashaddr(&params);
        assert_eq!(
            cash,
            "bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgmkjswssk2puzvgv"
        );
        assert_eq!(Address::from_cashaddr(&cash, &params).unwrap(), address);
    }

    #[test]
    fn test_p2sh_round_trip_mainnet() {
        let params = Params::main();
        let address = Address::script_hash(hash20("f815b036d9bbbce5e9f2a00abd1bf3dc91e95510"));

        let base58 = address.to_base58(&params);
        assert_eq!(base58, "3QJmV3qfvL9SuYo34YihAf3sRCW3qSinyC");
        assert_eq!(Address::from_base58(&base58, &params).unwrap(), address);

        let cash = address.to_cashaddr(&params);
        assert_eq!(
            cash,
            "bitcoincash:pruptvpkmxamee0f72sq40gm70wfr624zq0yyxtycm"
        );
        assert_eq!(Address::from_cashaddr(&cash, &params).unwrap(), address);
    }

    #[test]
    fn test_cashaddr_accepts_uppercase() {
        let params = Params::main();
        let address = Address::pubkey_hash(hash20("e34cce70c86373273efcc54ce7d2a491bb4a0e84"));
        let upper = "bitcoincash:QR35ENNSEP3HXFE7LNZ5EE7J5JGMKJSWSSK2PUZVGV";
        assert_eq!(Address::from_cashaddr(upper, &params).unwrap(), address);
    }

    #[test]
    fn test_cashaddr_rejects_mixed_case() {
        let params = Params::main();
        let mixed = "bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgmkjswsSK2PUZVGV";
        let err = Address::from_cashaddr(mixed, &params).unwrap_err();
        assert_eq!(err, AddressError::InvalidCasing);
        assert_eq!(err.to_string(), "Invalid cashaddr casing");
    }

    #[test]
    fn test_cashaddr_rejects_bad_checksum() {
        let params = Params::main();
        let bad = "bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgmkjswssk2puzvgq";
        assert_eq!(
            Address::from_cashaddr(bad, &params).unwrap_err(),
            AddressError::InvalidCashaddrChecksum
        );
    }

    #[test]
    fn test_cashaddr_rejects_wrong_prefix() {
        let regtest = Params::regtest();
        let main_addr = "bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgmkjswssk2puzvgv";
        assert_eq!(
            Address::from_cashaddr(main_addr, &regtest).unwrap_err(),
            AddressError::UnknownPrefix
        );
    }

    #[test]
    fn test_parse_untyped() {
        let params = Params::main();
        let address = Address::pubkey_hash(hash20("e34cce70c86373273efcc54ce7d2a491bb4a0e84"));

        // Mixed case goes straight to Base58.
        assert_eq!(
            Address::parse("1MirQ9bwyQcGVJPwKUgapu5ouK2E2Ey4gX", &params).unwrap(),
            address
        );
        // Single-case strings try cashaddr first.
        assert_eq!(
            Address::parse("bitcoincash:qr35ennsep3hxfe7lnz5ee7j5jgmkjswssk2puzvgv", &params)
                .unwrap(),
            address
        );
    }

    #[test]
    fn test_convert_bits_strict_padding() {
        // 8 -> 5 of one byte leaves 2 pad bits; they must be zero.
        let five = convert_bits(&[0xff], 8, 5, true).unwrap();
        assert_eq!(five, vec![0x1f, 0x1c]);
        assert_eq!(convert_bits(&five, 5, 8, false).unwrap(), vec![0xff]);

        // Force non-zero padding.
        let bad = vec![0x1f, 0x1d];
        assert_eq!(
            convert_bits(&bad, 5, 8, false).unwrap_err(),
            AddressError::NonZeroPadding
        );

        // A full extra symbol of padding is rejected outright.
        let overlong = vec![0x00, 0x1f, 0x1c, 0x00];
        assert_eq!(
            convert_bits(&overlong, 5, 8, false).unwrap_err(),
            AddressError::InvalidPadding
        );
    }

    #[test]
    fn test_to_script_templates() {
        let address = Address::pubkey_hash([0xaa; 20]);
        let script = address.to_script();
        assert_eq!(script.len(), 25);
        assert_eq!(script[0], 0x76);
        assert_eq!(script[24], 0xac);

        let address = Address::script_hash([0xbb; 20]);
        let script = address.to_script();
        assert_eq!(script.len(), 23);
        assert_eq!(script[0], 0xa9);
        assert_eq!(script[22], 0x87);
    }
}
