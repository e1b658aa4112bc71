//! Shared regtest harness for the integration tests.

use cash_consensus::chain::Chain;
use cash_consensus::codec::{merkle_root, tx_hash};
use cash_consensus::constants::{get_reward, SEQUENCE_FINAL};
use cash_consensus::params::Params;
use cash_consensus::script::{push_data, OP_1};
use cash_consensus::scriptnum;
use cash_consensus::store::MemStore;
use cash_consensus::types::{
    Amount, Block, Bytes, Hash, Header, Input, OutPoint, Output, Transaction,
};

/// Coinbase input script: height push plus a short tag.
pub fn coinbase_script(height: u32) -> Bytes {
    let mut script = Bytes::new();
    push_data(&mut script, &scriptnum::encode(height as i64));
    push_data(&mut script, b"it");
    script
}

/// Build the next block over the current tip, paying the subsidy to
/// `payout_script`.
pub fn next_block(chain: &Chain, payout_script: Bytes, txs: Vec<Transaction>) -> Block {
    let prev = chain.tip();
    let height = prev.height + 1;
    let reward = get_reward(height, chain.params().halving_interval);

    let mut all = vec![Transaction {
        version: 1,
        inputs: vec![Input {
            prevout: OutPoint::null(),
            script: coinbase_script(height),
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![Output {
            value: reward,
            script: payout_script,
        }],
        locktime: 0,
    }];
    all.extend(txs);

    let hashes: Vec<Hash> = all.iter().map(tx_hash).collect();
    let (root, _) = merkle_root(hashes);

    Block {
        header: Header {
            version: 1,
            prev: prev.hash,
            merkle_root: root,
            time: prev.time + 600,
            bits: chain.get_target(prev),
            nonce: 0,
        },
        txs: all,
    }
}

/// Open a regtest chain and mine `blocks` blocks to `payout_script`.
pub fn grown_chain(payout_script: Bytes, blocks: u32) -> Chain {
    let mut chain = Chain::open(Params::regtest(), Box::new(MemStore::new())).unwrap();
    for _ in 0..blocks {
        let block = next_block(&chain, payout_script.clone(), vec![]);
        chain.add(block).unwrap();
    }
    chain
}

/// Open a regtest chain mined to anyone-can-spend outputs.
pub fn anyone_chain(blocks: u32) -> Chain {
    grown_chain(vec![OP_1], blocks)
}

/// The coinbase output of the main-chain block at `height`.
pub fn coinbase_outpoint(chain: &Chain, height: u32) -> (OutPoint, Amount) {
    let entry = chain.entry_at(height).unwrap();
    let block = chain.read_block(&entry.hash).unwrap();
    (
        OutPoint::new(tx_hash(&block.txs[0]), 0),
        block.txs[0].outputs[0].value,
    )
}

/// A one-input, one-output spend to an anyone-can-spend output.
pub fn simple_spend(outpoint: OutPoint, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![Input {
            prevout: outpoint,
            script: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![Output {
            value,
            script: vec![OP_1],
        }],
        locktime: 0,
    }
}
