//! Per-network consensus parameters.

use crate::types::{Hash, Header};

/// Address prefix bytes and the cashaddr human readable part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPrefixes {
    pub pubkeyhash: u8,
    pub scripthash: u8,
    pub cashaddr: &'static str,
}

/// Consensus parameters of one network.
///
/// Fields are public so that regtest-style harnesses can tweak
/// activation points without a builder ceremony.
#[derive(Debug, Clone)]
pub struct Params {
    pub name: &'static str,

    /// Compact encoding of the proof-of-work limit.
    pub pow_limit_bits: u32,

    /// Legacy retarget interval in blocks.
    pub retarget_interval: u32,

    /// Target block spacing in seconds.
    pub target_spacing: u64,

    /// Legacy retarget timespan in seconds.
    pub target_timespan: u64,

    /// Regtest: every block keeps the genesis difficulty.
    pub no_retargeting: bool,

    /// Height at which the 144-block difficulty window takes over
    /// from the legacy interval retarget.
    pub daa_height: u32,

    /// Median-time-past threshold activating canonical transaction
    /// ordering and the extended opcode set.
    pub magnetic_anomaly_time: u64,

    pub halving_interval: u32,
    pub coinbase_maturity: u32,

    pub address: AddressPrefixes,

    pub genesis: Header,
}

fn hash_from_rhex(rhex: &str) -> Hash {
    let mut bytes = [0u8; 32];
    let decoded = hex::decode(rhex).expect("valid network constant");
    bytes.copy_from_slice(&decoded);
    bytes.reverse();
    bytes
}

/// Merkle root of the shared genesis coinbase.
fn genesis_merkle_root() -> Hash {
    hash_from_rhex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
}

impl Params {
    pub fn main() -> Self {
        Self {
            name: "main",
            pow_limit_bits: 0x1d00_ffff,
            retarget_interval: 2016,
            target_spacing: 600,
            target_timespan: 14 * 24 * 60 * 60,
            no_retargeting: false,
            daa_height: 504_031,
            magnetic_anomaly_time: 1_542_300_000,
            halving_interval: 210_000,
            coinbase_maturity: 100,
            address: AddressPrefixes {
                pubkeyhash: 0x00,
                scripthash: 0x05,
                cashaddr: "bitcoincash",
            },
            genesis: Header {
                version: 1,
                prev: [0u8; 32],
                merkle_root: genesis_merkle_root(),
                time: 1_231_006_505,
                bits: 0x1d00_ffff,
                nonce: 2_083_236_893,
            },
        }
    }

    pub fn testnet() -> Self {
        Self {
            name: "testnet",
            pow_limit_bits: 0x1d00_ffff,
            retarget_interval: 2016,
            target_spacing: 600,
            target_timespan: 14 * 24 * 60 * 60,
            no_retargeting: false,
            daa_height: 1_188_697,
            magnetic_anomaly_time: 1_542_300_000,
            halving_interval: 210_000,
            coinbase_maturity: 100,
            address: AddressPrefixes {
                pubkeyhash: 0x6f,
                scripthash: 0xc4,
                cashaddr: "bchtest",
            },
            genesis: Header {
                version: 1,
                prev: [0u8; 32],
                merkle_root: genesis_merkle_root(),
                time: 1_296_688_602,
                bits: 0x1d00_ffff,
                nonce: 414_098_458,
            },
        }
    }

    pub fn regtest() -> Self {
        Self {
            name: "regtest",
            pow_limit_bits: 0x207f_ffff,
            retarget_interval: 2016,
            target_spacing: 600,
            target_timespan: 14 * 24 * 60 * 60,
            no_retargeting: true,
            daa_height: u32::MAX,
            // Off by default; harnesses flip this to exercise the
            // post-activation rules.
            magnetic_anomaly_time: u64::MAX,
            halving_interval: 150,
            coinbase_maturity: 100,
            address: AddressPrefixes {
                pubkeyhash: 0x6f,
                scripthash: 0xc4,
                cashaddr: "bchreg",
            },
            genesis: Header {
                version: 1,
                prev: [0u8; 32],
                merkle_root: genesis_merkle_root(),
                time: 1_296_688_602,
                bits: 0x207f_ffff,
                nonce: 2,
            },
        }
    }
}
