//! Consensus constants and the reward schedule.

/// Base currency units per coin.
pub const COIN: i64 = 100_000_000;

/// Maximum money supply in base units.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Subsidy of the genesis era: 50 coins.
pub const BASE_REWARD: i64 = 50 * COIN;

/// Half of the base reward, the unit the halving shift operates on.
pub const HALF_REWARD: i64 = BASE_REWARD / 2;

/// Maximum serialized transaction size in bytes.
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Maximum serialized size of a post-fork block in bytes.
pub const MAX_FORK_BLOCK_SIZE: usize = 32_000_000;

/// A block of `n` bytes may carry at most `n / 10` transactions.
pub const BLOCK_TX_SIZE_RATIO: usize = 10;

/// Maximum signature-checking operations per megabyte of block.
pub const MAX_BLOCK_SIGOPS_PER_MB: usize = 20_000;

/// Number of confirmations before a coinbase output may be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// Coinbase input scripts must be within [2, 100] bytes.
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Maximum script size in bytes.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed stack element.
pub const MAX_SCRIPT_PUSH: usize = 520;

/// Maximum combined depth of stack and altstack.
pub const MAX_SCRIPT_STACK: usize = 1_000;

/// Maximum executed non-push opcodes per script.
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum public keys in a single CHECKMULTISIG.
pub const MAX_MULTISIG_PUBKEYS: i64 = 20;

/// Locktime values below this threshold are block heights,
/// values at or above it are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number that opts an input out of locktime enforcement.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Sequence flag disabling relative locktime (BIP 68).
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;

/// Sequence flag selecting time-based relative locktime.
pub const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;

/// Mask extracting the relative locktime value from a sequence.
pub const SEQUENCE_MASK: u32 = 0x0000_ffff;

/// Granularity shift for time-based relative locktimes.
pub const SEQUENCE_GRANULARITY: u32 = 9;

/// Allowed clock skew for block timestamps, in seconds.
pub const MAX_TIME_DRIFT: u64 = 2 * 60 * 60;

/// Number of ancestor timestamps the median-time-past covers.
pub const MEDIAN_TIMESPAN: usize = 11;

/// Header version prefix for version-bits signalling.
pub const VERSION_TOP_BITS: u32 = 0x2000_0000;

/// Mask isolating the version-bits prefix.
pub const VERSION_TOP_MASK: u32 = 0xe000_0000;

/// True when a header version participates in version-bits signalling.
pub fn uses_version_bits(version: i32) -> bool {
    (version as u32 & VERSION_TOP_MASK) == VERSION_TOP_BITS
}

/// GetReward: ℕ × ℕ → ℤ
///
/// Block subsidy at `height` with a halving `interval`:
/// 1. halvings = ⌊height / interval⌋
/// 2. halvings ≥ 33: 0 (the schedule terminates; a 32-bit shift
///    cannot express further halvings)
/// 3. halvings = 0: BASE_REWARD
/// 4. otherwise: HALF_REWARD >> (halvings - 1)
pub fn get_reward(height: u32, interval: u32) -> i64 {
    let halvings = height / interval;

    if halvings >= 33 {
        return 0;
    }

    if halvings == 0 {
        return BASE_REWARD;
    }

    HALF_REWARD >> (halvings - 1)
}

/// Sum of all subsidies from genesis through `height` inclusive.
pub fn cumulative_supply(height: u32, interval: u32) -> i64 {
    let mut total = 0i64;
    for h in 0..=height {
        total += get_reward(h, interval);
    }
    total
}
