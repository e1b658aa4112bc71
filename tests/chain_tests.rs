//! End-to-end chain tests: real signed spends over the forkid sighash,
//! event ordering, and the reorganization law.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use cash_consensus::address::Address;
use cash_consensus::chain::{ChainEntry, ChainListener};
use cash_consensus::codec::tx_hash;
use cash_consensus::constants::{BASE_REWARD, COINBASE_MATURITY, SEQUENCE_FINAL};
use cash_consensus::error::ConsensusError;
use cash_consensus::script::{push_data, VERIFY_SIGHASH_FORKID};
use cash_consensus::sighash::{signature_hash, SIGHASH_ALL, SIGHASH_FORKID};
use cash_consensus::types::{Amount, Block, Bytes, Input, OutPoint, Output, Transaction};
use cash_consensus::utxo::{CoinSource, CoinView};

use common::{anyone_chain, coinbase_outpoint, grown_chain, next_block, simple_spend};

struct Wallet {
    secp: Secp256k1<secp256k1::All>,
    secret: SecretKey,
    pubkey: PublicKey,
}

impl Wallet {
    fn new(seed: u8) -> Self {
        let secp = Secp256k1::new();
        let mut key = [0u8; 32];
        key[31] = seed;
        let secret = SecretKey::from_slice(&key).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        Self {
            secp,
            secret,
            pubkey,
        }
    }

    fn address(&self) -> Address {
        Address::from_pubkey(&self.pubkey.serialize())
    }

    /// Sign one input with SIGHASH_ALL | SIGHASH_FORKID and fill in
    /// the P2PKH input script.
    fn sign_input(&self, tx: &mut Transaction, index: usize, prev_script: &[u8], value: Amount) {
        let hashtype = SIGHASH_ALL | SIGHASH_FORKID;
        let digest = signature_hash(
            tx,
            index,
            prev_script,
            value,
            hashtype,
            VERIFY_SIGHASH_FORKID,
            None,
        );
        let msg = Message::from_digest_slice(&digest).unwrap();
        let sig = self.secp.sign_ecdsa(&msg, &self.secret);

        let mut sig_bytes = sig.serialize_der().to_vec();
        sig_bytes.push(hashtype as u8);

        let mut script = Bytes::new();
        push_data(&mut script, &sig_bytes);
        push_data(&mut script, &self.pubkey.serialize());
        tx.inputs[index].script = script;
    }
}

#[test]
fn test_p2pkh_forkid_spend_connects() {
    let wallet = Wallet::new(1);
    let payout = wallet.address().to_script();
    let mut chain = grown_chain(payout.clone(), COINBASE_MATURITY + 1);

    let (outpoint, value) = coinbase_outpoint(&chain, 1);
    let mut spend = Transaction {
        version: 1,
        inputs: vec![Input {
            prevout: outpoint,
            script: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![Output {
            value: value - 10_000,
            script: wallet.address().to_script(),
        }],
        locktime: 0,
    };
    wallet.sign_input(&mut spend, 0, &payout, value);

    let spend_hash = tx_hash(&spend);
    let block = next_block(&chain, payout, vec![spend]);
    chain.add(block).unwrap();

    assert!(chain
        .coin(&OutPoint::new(spend_hash, 0))
        .is_some());
    assert!(chain.coin(&outpoint).is_none());
}

#[test]
fn test_p2pkh_wrong_key_rejected() {
    let wallet = Wallet::new(1);
    let intruder = Wallet::new(2);
    let payout = wallet.address().to_script();
    let mut chain = grown_chain(payout.clone(), COINBASE_MATURITY + 1);

    let (outpoint, value) = coinbase_outpoint(&chain, 1);
    let mut spend = Transaction {
        version: 1,
        inputs: vec![Input {
            prevout: outpoint,
            script: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![Output {
            value: value - 10_000,
            script: payout.clone(),
        }],
        locktime: 0,
    };
    intruder.sign_input(&mut spend, 0, &payout, value);

    let block = next_block(&chain, payout, vec![spend]);
    match chain.add(block) {
        Err(ConsensusError::Verify(err)) => {
            assert!(err.reason.starts_with("mandatory-script-verify-flag-failed"));
            assert_eq!(err.score, 100);
        }
        other => panic!("unexpected: {:?}", other.map(|e| e.height)),
    }
    assert_eq!(chain.height(), COINBASE_MATURITY + 1);
}

#[test]
fn test_p2pkh_signature_commits_to_value() {
    let wallet = Wallet::new(1);
    let payout = wallet.address().to_script();
    let mut chain = grown_chain(payout.clone(), COINBASE_MATURITY + 1);

    let (outpoint, value) = coinbase_outpoint(&chain, 1);
    let mut spend = Transaction {
        version: 1,
        inputs: vec![Input {
            prevout: outpoint,
            script: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![Output {
            value: value - 10_000,
            script: payout.clone(),
        }],
        locktime: 0,
    };
    // Sign as if the coin were worth one unit more: the forkid
    // preimage embeds the value, so verification must fail.
    wallet.sign_input(&mut spend, 0, &payout, value + 1);

    let block = next_block(&chain, payout, vec![spend]);
    assert!(matches!(
        chain.add(block),
        Err(ConsensusError::Verify(_))
    ));
}

#[derive(Clone, Default)]
struct Recorder {
    events: Rc<RefCell<Vec<String>>>,
}

impl ChainListener for Recorder {
    fn on_connect(&mut self, entry: &ChainEntry, block: &Block, _view: &CoinView) {
        self.events
            .borrow_mut()
            .push(format!("connect:{}:{}", entry.height, block.txs.len()));
    }
    fn on_disconnect(&mut self, entry: &ChainEntry, block: &Block, _view: &CoinView) {
        self.events
            .borrow_mut()
            .push(format!("disconnect:{}:{}", entry.height, block.txs.len()));
    }
    fn on_tip(&mut self, entry: &ChainEntry) {
        self.events.borrow_mut().push(format!("tip:{}", entry.height));
    }
}

#[test]
fn test_connect_events_in_height_order() {
    let mut chain = anyone_chain(0);
    let recorder = Recorder::default();
    let events = recorder.events.clone();
    chain.add_listener(Box::new(recorder));

    for _ in 0..3 {
        let block = next_block(&chain, vec![0x51], vec![]);
        chain.add(block).unwrap();
    }

    assert_eq!(
        events.borrow().as_slice(),
        &[
            "connect:1:1".to_string(),
            "tip:1".to_string(),
            "connect:2:1".to_string(),
            "tip:2".to_string(),
            "connect:3:1".to_string(),
            "tip:3".to_string(),
        ]
    );
}

#[test]
fn test_reorg_restores_spent_coin() {
    let mut chain = anyone_chain(COINBASE_MATURITY + 1);

    // Spend a mature coinbase at the tip.
    let (outpoint, value) = coinbase_outpoint(&chain, 1);
    let spend = simple_spend(outpoint, value - 5000);
    let spend_hash = tx_hash(&spend);
    let block = next_block(&chain, vec![0x51], vec![spend]);
    chain.add(block).unwrap();

    assert!(chain.coin(&outpoint).is_none());
    assert_eq!(chain.height(), COINBASE_MATURITY + 2);

    // Rewind across the spending block: the coin must come back and
    // the spend's output must be gone.
    chain.reset(COINBASE_MATURITY + 1).unwrap();
    let restored = chain.coin(&outpoint).expect("coin restored by undo");
    assert_eq!(restored.value(), BASE_REWARD);
    assert_eq!(restored.height, 1);
    assert!(restored.coinbase);
    assert!(chain.coin(&OutPoint::new(spend_hash, 0)).is_none());

    // The restored coin is spendable again.
    let respend = simple_spend(outpoint, value - 9000);
    let block = next_block(&chain, vec![0x51], vec![respend]);
    chain.add(block).unwrap();
}
