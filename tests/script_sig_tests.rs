//! Signature opcode tests against real ECDSA material: CHECKDATASIG
//! and its VERIFY form, encoding strictness, and high-S rejection.

use num_bigint::BigUint;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use cash_consensus::error::ScriptError;
use cash_consensus::script::{
    eval_script, push_data, NoChecker, OP_CHECKDATASIG, OP_CHECKDATASIGVERIFY,
    VERIFY_CHECKDATASIG, VERIFY_LOW_S, VERIFY_NULLFAIL, VERIFY_STRICTENC,
};

/// secp256k1 group order.
const CURVE_ORDER_HEX: &str =
    "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141";

struct Fixture {
    sig_der: Vec<u8>,
    pubkey: Vec<u8>,
    pubkey_uncompressed: Vec<u8>,
    message: Vec<u8>,
}

/// Sign the empty message with the private key 0x...01.
fn fixture() -> Fixture {
    let secp = Secp256k1::new();
    let mut key = [0u8; 32];
    key[31] = 1;
    let secret = SecretKey::from_slice(&key).unwrap();
    let pubkey = PublicKey::from_secret_key(&secp, &secret);

    let message: Vec<u8> = Vec::new();
    let digest = Sha256::digest(&message);
    let msg = Message::from_digest_slice(&digest).unwrap();
    let sig = secp.sign_ecdsa(&msg, &secret);

    Fixture {
        sig_der: sig.serialize_der().to_vec(),
        pubkey: pubkey.serialize().to_vec(),
        pubkey_uncompressed: pubkey.serialize_uncompressed().to_vec(),
        message,
    }
}

fn run_checkdatasig(
    sig: &[u8],
    msg: &[u8],
    pubkey: &[u8],
    opcode: u8,
    flags: u32,
) -> Result<Vec<Vec<u8>>, ScriptError> {
    let mut script = Vec::new();
    push_data(&mut script, sig);
    push_data(&mut script, msg);
    push_data(&mut script, pubkey);
    script.push(opcode);

    let mut stack = Vec::new();
    eval_script(&mut stack, &script, flags, &mut NoChecker)?;
    Ok(stack)
}

/// DER-encode an (r, s) pair the way a signer would.
fn der_from_scalars(r: &[u8], s: &[u8]) -> Vec<u8> {
    fn integer(out: &mut Vec<u8>, scalar: &[u8]) {
        let mut bytes: Vec<u8> = scalar.iter().copied().skip_while(|&b| b == 0).collect();
        if bytes.is_empty() {
            bytes.push(0);
        }
        if bytes[0] & 0x80 != 0 {
            bytes.insert(0, 0x00);
        }
        out.push(0x02);
        out.push(bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }

    let mut body = Vec::new();
    integer(&mut body, r);
    integer(&mut body, s);

    let mut out = vec![0x30, body.len() as u8];
    out.extend_from_slice(&body);
    out
}

/// Flip the signature's S scalar to its high form.
fn to_high_s(sig_der: &[u8]) -> Vec<u8> {
    let sig = secp256k1::ecdsa::Signature::from_der(sig_der).unwrap();
    let compact = sig.serialize_compact();

    let order = BigUint::parse_bytes(CURVE_ORDER_HEX.as_bytes(), 16).unwrap();
    let s = BigUint::from_bytes_be(&compact[32..]);
    let high_s = &order - &s;

    der_from_scalars(&compact[..32], &high_s.to_bytes_be())
}

#[test]
fn test_checkdatasig_accepts_valid_signature() {
    let f = fixture();
    let flags = VERIFY_CHECKDATASIG | VERIFY_STRICTENC;

    let stack = run_checkdatasig(&f.sig_der, &f.message, &f.pubkey, OP_CHECKDATASIG, flags)
        .unwrap();
    assert_eq!(stack, vec![vec![0x01]]);

    // The VERIFY form consumes the result entirely.
    let stack = run_checkdatasig(
        &f.sig_der,
        &f.message,
        &f.pubkey,
        OP_CHECKDATASIGVERIFY,
        flags,
    )
    .unwrap();
    assert!(stack.is_empty());
}

#[test]
fn test_checkdatasig_uncompressed_key_ok_under_strictenc() {
    let f = fixture();
    let flags = VERIFY_CHECKDATASIG | VERIFY_STRICTENC;
    let stack = run_checkdatasig(
        &f.sig_der,
        &f.message,
        &f.pubkey_uncompressed,
        OP_CHECKDATASIG,
        flags,
    )
    .unwrap();
    assert_eq!(stack, vec![vec![0x01]]);
}

#[test]
fn test_checkdatasig_hybrid_key_rejected_under_strictenc() {
    let f = fixture();
    let mut hybrid = f.pubkey_uncompressed.clone();
    // Hybrid encoding: 0x06/0x07 leading byte on a 65-byte key.
    hybrid[0] = 0x06 | (hybrid[64] & 1);

    let flags = VERIFY_CHECKDATASIG | VERIFY_STRICTENC;
    for opcode in [OP_CHECKDATASIG, OP_CHECKDATASIGVERIFY] {
        let err = run_checkdatasig(&f.sig_der, &f.message, &hybrid, opcode, flags).unwrap_err();
        assert_eq!(err, ScriptError::PubkeyType);
    }
}

#[test]
fn test_checkdatasig_high_s_rejected_under_low_s() {
    let f = fixture();
    let high = to_high_s(&f.sig_der);

    let flags = VERIFY_CHECKDATASIG | VERIFY_LOW_S;
    for opcode in [OP_CHECKDATASIG, OP_CHECKDATASIGVERIFY] {
        assert!(
            run_checkdatasig(&f.sig_der, &f.message, &f.pubkey, opcode, flags).is_ok(),
            "the low-S original passes"
        );

        let err = run_checkdatasig(&high, &f.message, &f.pubkey, opcode, flags).unwrap_err();
        assert_eq!(err, ScriptError::SigHighS);
    }
}

#[test]
fn test_checkdatasig_high_s_verifies_without_low_s() {
    let f = fixture();
    let high = to_high_s(&f.sig_der);

    // Without the policy flag, verification normalizes and accepts.
    let stack = run_checkdatasig(
        &high,
        &f.message,
        &f.pubkey,
        OP_CHECKDATASIG,
        VERIFY_CHECKDATASIG,
    )
    .unwrap();
    assert_eq!(stack, vec![vec![0x01]]);
}

#[test]
fn test_checkdatasig_wrong_message_nullfail() {
    let f = fixture();

    // Without NULLFAIL, a failed check pushes false.
    let stack = run_checkdatasig(
        &f.sig_der,
        b"wrong",
        &f.pubkey,
        OP_CHECKDATASIG,
        VERIFY_CHECKDATASIG,
    )
    .unwrap();
    assert_eq!(stack, vec![Vec::<u8>::new()]);

    // With it, a non-empty failing signature is an error.
    let err = run_checkdatasig(
        &f.sig_der,
        b"wrong",
        &f.pubkey,
        OP_CHECKDATASIG,
        VERIFY_CHECKDATASIG | VERIFY_NULLFAIL,
    )
    .unwrap_err();
    assert_eq!(err, ScriptError::NullFail);

    // An empty signature is the sanctioned way to fail.
    let stack = run_checkdatasig(
        &[],
        b"wrong",
        &f.pubkey,
        OP_CHECKDATASIG,
        VERIFY_CHECKDATASIG | VERIFY_NULLFAIL,
    )
    .unwrap();
    assert_eq!(stack, vec![Vec::<u8>::new()]);
}

#[test]
fn test_checkdatasigverify_failure_error() {
    let f = fixture();
    let err = run_checkdatasig(
        &[],
        &f.message,
        &f.pubkey,
        OP_CHECKDATASIGVERIFY,
        VERIFY_CHECKDATASIG,
    )
    .unwrap_err();
    assert_eq!(err, ScriptError::CheckDataSigVerify);
}
