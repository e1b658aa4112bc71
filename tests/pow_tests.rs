//! Difficulty adjustment tests: the legacy interval retarget and the
//! 144-block cash rule, driven over synthetic chains of work points.

use cash_consensus::params::Params;
use cash_consensus::pow::{cash_bits, legacy_bits, work_from_bits, U256, WorkPoint};

// ============================================================================
// LEGACY RETARGET
// ============================================================================

#[test]
fn test_legacy_retarget_nominal() {
    let params = Params::main();
    // The first mainnet retarget: interval slightly faster than two
    // weeks lowers the target a little.
    let bits = legacy_bits(0x1d00ffff, 1_261_130_161, 1_262_152_739, &params);
    assert_eq!(bits, 0x1d00d86a);
}

#[test]
fn test_legacy_retarget_lower_clamp() {
    let params = Params::main();
    // An interval far under a quarter of the timespan clamps to 4x
    // harder.
    let bits = legacy_bits(0x1c05a3f4, 1_279_296_753, 1_279_297_671, &params);
    assert_eq!(bits, 0x1c0168fd);
}

#[test]
fn test_legacy_retarget_upper_clamp() {
    let params = Params::main();
    // An interval over four timespans clamps to 4x easier.
    let bits = legacy_bits(0x1c387f6f, 1_263_163_443, 1_269_211_443, &params);
    assert_eq!(bits, 0x1d00e1fd);
}

#[test]
fn test_legacy_retarget_respects_limit() {
    let params = Params::main();
    // Easing off an already-minimal difficulty cannot pass the limit.
    let bits = legacy_bits(
        0x1d00ffff,
        1_000_000_000,
        1_000_000_000 + params.target_timespan * 10,
        &params,
    );
    assert_eq!(bits, params.pow_limit_bits);
}

// ============================================================================
// CASH DAA
// ============================================================================

struct TestBlock {
    height: u32,
    time: u64,
    chainwork: U256,
}

fn append_block(blocks: &mut Vec<TestBlock>, interval: i64, bits: u32) {
    let prev = blocks.last().expect("non-empty chain");
    blocks.push(TestBlock {
        height: prev.height + 1,
        time: (prev.time as i64 + interval) as u64,
        chainwork: prev.chainwork.wrapping_add(&work_from_bits(bits)),
    });
}

fn next_bits(blocks: &[TestBlock], params: &Params) -> u32 {
    let tip = blocks.last().expect("non-empty chain");
    let h = tip.height as usize;
    let point = |i: usize| WorkPoint {
        time: blocks[i].time,
        chainwork: blocks[i].chainwork,
    };

    let last3 = [point(h - 2), point(h - 1), point(h)];
    let anchor = h - 144;
    let first3 = [point(anchor - 2), point(anchor - 1), point(anchor)];
    cash_bits(first3, last3, params)
}

fn target_of(bits: u32) -> U256 {
    U256::from_compact(bits).expect("valid test bits")
}

#[test]
fn test_cash_daa_sequence() {
    let params = Params::main();
    let limit = target_of(params.pow_limit_bits);
    let initial_bits = limit.shr(4).to_compact();
    assert_eq!(initial_bits, 0x1c0ffff0);

    let mut blocks = vec![TestBlock {
        height: 0,
        time: 1_269_211_443,
        chainwork: work_from_bits(initial_bits),
    }];

    // Pile up history at the exact target spacing.
    for _ in 1..2050 {
        append_block(&mut blocks, 600, initial_bits);
    }

    let mut bits = next_bits(&blocks, &params);
    assert_eq!(bits, initial_bits);

    // On-spacing blocks leave the difficulty untouched.
    for _ in 0..10 {
        append_block(&mut blocks, 600, bits);
        assert_eq!(next_bits(&blocks, &params), bits);
    }

    // A wildly future timestamp and the compensating block after it
    // are neutralized by the median-of-three edge selection.
    append_block(&mut blocks, 6000, bits);
    assert_eq!(next_bits(&blocks, &params), bits);
    append_block(&mut blocks, 2 * 600 - 6000, bits);
    assert_eq!(next_bits(&blocks, &params), bits);

    // The system continues unaffected by the bogus timestamps.
    for _ in 0..20 {
        append_block(&mut blocks, 600, bits);
        assert_eq!(next_bits(&blocks, &params), bits);
    }

    // Slightly faster blocks; the first one has no impact.
    append_block(&mut blocks, 550, bits);
    assert_eq!(next_bits(&blocks, &params), bits);

    // Then difficulty creeps up slowly.
    for _ in 0..10 {
        append_block(&mut blocks, 550, bits);
        let next = next_bits(&blocks, &params);
        let current_target = target_of(bits);
        let next_target = target_of(next);
        assert!(next_target < current_target);
        assert!(current_target.wrapping_sub(&next_target) < current_target.shr(10));
        bits = next;
    }
    assert_eq!(bits, 0x1c0fe7b1);

    // Dramatically shorter spacing drives difficulty up much faster.
    for _ in 0..20 {
        append_block(&mut blocks, 10, bits);
        let next = next_bits(&blocks, &params);
        assert!(target_of(next) < target_of(bits));
        bits = next;
    }
    assert_eq!(bits, 0x1c0db19f);

    // One very slow block eases off a little.
    append_block(&mut blocks, 6000, bits);
    bits = next_bits(&blocks, &params);
    assert_eq!(bits, 0x1c0d9222);

    // A long slow stretch keeps easing.
    for _ in 0..93 {
        append_block(&mut blocks, 6000, bits);
        let next = next_bits(&blocks, &params);
        let current_target = target_of(bits);
        let next_target = target_of(next);
        assert!(next_target <= limit);
        assert!(next_target > current_target);
        bits = next;
    }
    assert_eq!(bits, 0x1c2f13b9);

    // Keep stalling until the target floors at the limit.
    for _ in 0..250 {
        append_block(&mut blocks, 6000, bits);
        bits = next_bits(&blocks, &params);
    }
    assert_eq!(bits, params.pow_limit_bits);

    // Once floored, it sticks.
    for _ in 0..5 {
        append_block(&mut blocks, 6000, bits);
        assert_eq!(next_bits(&blocks, &params), params.pow_limit_bits);
    }
}

// ============================================================================
// COMPACT TARGET PROPERTIES
// ============================================================================

#[test]
fn test_compact_round_trip_sampled_targets() {
    // Canonical compact encodings across the plausible exponent range.
    for exponent in 3u32..=32 {
        for mantissa in [0x00ffffu32, 0x008000, 0x0123ab, 0x7fffff] {
            let compact = (exponent << 24) | mantissa;
            let target = match U256::from_compact(compact) {
                Some(t) if !t.is_zero() => t,
                _ => continue,
            };
            assert_eq!(
                U256::from_compact(target.to_compact()),
                Some(target),
                "round trip through compact for {:#010x}",
                compact
            );
        }
    }
}

#[test]
fn test_work_is_monotonic_in_difficulty() {
    // A smaller target means strictly more work.
    let easy = work_from_bits(0x1d00ffff);
    let hard = work_from_bits(0x1c0fe7b1);
    let harder = work_from_bits(0x1c0db19f);
    assert!(easy < hard);
    assert!(hard < harder);
}
