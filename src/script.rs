//! Script execution engine.
//!
//! A stack machine over byte strings. Scripts run under a set of
//! verification flags passed explicitly by the caller; nothing here
//! reads global state. Signature operations defer transaction context
//! to a [`SignatureChecker`], so the interpreter itself stays pure.

use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};

use crate::constants::*;
use crate::error::ScriptError;
use crate::scriptnum;
use crate::sighash::{signature_hash, SighashMidstates, SIGHASH_ANYONECANPAY, SIGHASH_FORKID};
use crate::types::{Amount, Bytes, Hash, Transaction};

// ============================================================================
// VERIFICATION FLAGS
// ============================================================================

pub const VERIFY_NONE: u32 = 0;
pub const VERIFY_P2SH: u32 = 1 << 0;
pub const VERIFY_STRICTENC: u32 = 1 << 1;
pub const VERIFY_DERSIG: u32 = 1 << 2;
pub const VERIFY_LOW_S: u32 = 1 << 3;
pub const VERIFY_NULLFAIL: u32 = 1 << 4;
pub const VERIFY_MINIMALDATA: u32 = 1 << 5;
pub const VERIFY_CLEANSTACK: u32 = 1 << 6;
pub const VERIFY_SIGHASH_FORKID: u32 = 1 << 7;
pub const VERIFY_REPLAY_PROTECTION: u32 = 1 << 8;
pub const VERIFY_CHECKDATASIG: u32 = 1 << 9;
pub const VERIFY_COMPRESSED_PUBKEYTYPE: u32 = 1 << 10;
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 11;
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 12;

/// Flags every connected block is verified under.
pub const MANDATORY_VERIFY_FLAGS: u32 = VERIFY_P2SH
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLFAIL
    | VERIFY_SIGHASH_FORKID
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY;

/// Additional policy flags applied to mempool acceptance.
pub const STANDARD_VERIFY_FLAGS: u32 =
    MANDATORY_VERIFY_FLAGS | VERIFY_MINIMALDATA | VERIFY_CLEANSTACK;

// ============================================================================
// OPCODES
// ============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_2: u8 = 0x52;
pub const OP_3: u8 = 0x53;
pub const OP_4: u8 = 0x54;
pub const OP_5: u8 = 0x55;
pub const OP_6: u8 = 0x56;
pub const OP_7: u8 = 0x57;
pub const OP_8: u8 = 0x58;
pub const OP_9: u8 = 0x59;
pub const OP_10: u8 = 0x5a;
pub const OP_16: u8 = 0x60;

pub const OP_NOP: u8 = 0x61;
pub const OP_VER: u8 = 0x62;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;

pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_2OVER: u8 = 0x70;
pub const OP_2ROT: u8 = 0x71;
pub const OP_2SWAP: u8 = 0x72;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_ROT: u8 = 0x7b;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;

pub const OP_CAT: u8 = 0x7e;
pub const OP_SPLIT: u8 = 0x7f;
pub const OP_NUM2BIN: u8 = 0x80;
pub const OP_BIN2NUM: u8 = 0x81;
pub const OP_SIZE: u8 = 0x82;

pub const OP_INVERT: u8 = 0x83;
pub const OP_AND: u8 = 0x84;
pub const OP_OR: u8 = 0x85;
pub const OP_XOR: u8 = 0x86;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_RESERVED1: u8 = 0x89;
pub const OP_RESERVED2: u8 = 0x8a;

pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_2MUL: u8 = 0x8d;
pub const OP_2DIV: u8 = 0x8e;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_MUL: u8 = 0x95;
pub const OP_DIV: u8 = 0x96;
pub const OP_MOD: u8 = 0x97;
pub const OP_LSHIFT: u8 = 0x98;
pub const OP_RSHIFT: u8 = 0x99;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;

pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA1: u8 = 0xa7;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const OP_NOP1: u8 = 0xb0;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
pub const OP_NOP10: u8 = 0xb9;

pub const OP_CHECKDATASIG: u8 = 0xba;
pub const OP_CHECKDATASIGVERIFY: u8 = 0xbb;

// ============================================================================
// SCRIPT PARSING AND BUILDING
// ============================================================================

/// Decode the operation at `pos`: opcode, optional push payload, and
/// the position after it.
fn next_op(script: &[u8], pos: usize) -> Result<(u8, Option<&[u8]>, usize), ScriptError> {
    let opcode = script[pos];
    let mut cursor = pos + 1;

    let data_len = if opcode < OP_PUSHDATA1 {
        opcode as usize
    } else if opcode == OP_PUSHDATA1 {
        if cursor + 1 > script.len() {
            return Err(ScriptError::BadOpcode);
        }
        let len = script[cursor] as usize;
        cursor += 1;
        len
    } else if opcode == OP_PUSHDATA2 {
        if cursor + 2 > script.len() {
            return Err(ScriptError::BadOpcode);
        }
        let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
        cursor += 2;
        len
    } else if opcode == OP_PUSHDATA4 {
        if cursor + 4 > script.len() {
            return Err(ScriptError::BadOpcode);
        }
        let len = u32::from_le_bytes([
            script[cursor],
            script[cursor + 1],
            script[cursor + 2],
            script[cursor + 3],
        ]) as usize;
        cursor += 4;
        len
    } else {
        return Ok((opcode, None, cursor));
    };

    if cursor + data_len > script.len() {
        return Err(ScriptError::BadOpcode);
    }
    let data = &script[cursor..cursor + data_len];
    Ok((opcode, Some(data), cursor + data_len))
}

/// Append a minimal push of `data` to a script.
pub fn push_data(script: &mut Bytes, data: &[u8]) {
    if data.is_empty() {
        script.push(OP_0);
    } else if data.len() == 1 && data[0] >= 1 && data[0] <= 16 {
        script.push(OP_1 + data[0] - 1);
    } else if data.len() == 1 && data[0] == 0x81 {
        script.push(OP_1NEGATE);
    } else if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
        script.extend_from_slice(data);
    } else if data.len() <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
        script.extend_from_slice(data);
    } else if data.len() <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        script.extend_from_slice(data);
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(data.len() as u32).to_le_bytes());
        script.extend_from_slice(data);
    }
}

/// Append a minimal push of a script number.
pub fn push_number(script: &mut Bytes, value: i64) {
    push_data(script, &scriptnum::encode(value));
}

/// True when the push of `data` under `opcode` used the shortest form.
fn is_minimal_push(opcode: u8, data: &[u8]) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && data[0] >= 1 && data[0] <= 16 {
        return false;
    }
    if data.len() == 1 && data[0] == 0x81 {
        return false;
    }
    if data.len() < OP_PUSHDATA1 as usize {
        return opcode as usize == data.len();
    }
    if data.len() <= 0xff {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 0xffff {
        return opcode == OP_PUSHDATA2;
    }
    true
}

/// True when a script consists solely of push operations.
pub fn is_push_only(script: &[u8]) -> bool {
    let mut pos = 0;
    while pos < script.len() {
        match next_op(script, pos) {
            Ok((opcode, _, next)) => {
                if opcode > OP_16 {
                    return false;
                }
                pos = next;
            }
            Err(_) => return false,
        }
    }
    true
}

/// Pay-to-script-hash template: `OP_HASH160 <20 bytes> OP_EQUAL`.
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL
}

// ============================================================================
// SIGNATURE AND KEY ENCODING CHECKS
// ============================================================================

/// Structural strict-DER check over a raw signature (no hashtype byte).
fn is_valid_der(sig: &[u8]) -> bool {
    if sig.len() < 8 || sig.len() > 72 {
        return false;
    }
    if sig[0] != 0x30 {
        return false;
    }
    if sig[1] as usize != sig.len() - 2 {
        return false;
    }

    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 6 != sig.len() {
        return false;
    }

    if sig[2] != 0x02 || len_r == 0 {
        return false;
    }
    if sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0 && sig[5] & 0x80 == 0 {
        return false;
    }

    if sig[len_r + 4] != 0x02 || len_s == 0 {
        return false;
    }
    if sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }

    true
}

/// A signature is low-S when normalization leaves it unchanged.
fn is_low_s(sig: &[u8]) -> bool {
    let parsed = match Signature::from_der(sig) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let mut normalized = parsed;
    normalized.normalize_s();
    parsed.serialize_compact() == normalized.serialize_compact()
}

fn is_valid_hashtype(hashtype: u32) -> bool {
    let base = hashtype & !(SIGHASH_ANYONECANPAY | SIGHASH_FORKID);
    (0x01..=0x03).contains(&base)
}

fn check_raw_signature_encoding(sig: &[u8], flags: u32) -> Result<(), ScriptError> {
    if flags & (VERIFY_DERSIG | VERIFY_LOW_S | VERIFY_STRICTENC) != 0 && !is_valid_der(sig) {
        return Err(ScriptError::SigDer);
    }
    if flags & VERIFY_LOW_S != 0 && !is_low_s(sig) {
        return Err(ScriptError::SigHighS);
    }
    Ok(())
}

/// Encoding rules for a transaction signature (trailing hashtype byte).
fn check_signature_encoding(sig: &[u8], flags: u32) -> Result<(), ScriptError> {
    // An empty signature is a deliberate, correctly encoded failure.
    if sig.is_empty() {
        return Ok(());
    }

    check_raw_signature_encoding(&sig[..sig.len() - 1], flags)?;

    if flags & VERIFY_STRICTENC != 0 {
        let hashtype = sig[sig.len() - 1] as u32;
        if !is_valid_hashtype(hashtype) {
            return Err(ScriptError::SigHashType);
        }
        let has_forkid = hashtype & SIGHASH_FORKID != 0;
        if flags & VERIFY_SIGHASH_FORKID != 0 && !has_forkid {
            return Err(ScriptError::MustUseForkid);
        }
        if flags & VERIFY_SIGHASH_FORKID == 0 && has_forkid {
            return Err(ScriptError::IllegalForkid);
        }
    }

    Ok(())
}

/// Encoding rules for a data signature (no hashtype byte).
fn check_data_signature_encoding(sig: &[u8], flags: u32) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    check_raw_signature_encoding(sig, flags)
}

fn check_pubkey_encoding(key: &[u8], flags: u32) -> Result<(), ScriptError> {
    if flags & VERIFY_STRICTENC != 0 && !is_valid_pubkey(key) {
        return Err(ScriptError::PubkeyType);
    }
    if flags & VERIFY_COMPRESSED_PUBKEYTYPE != 0 && !is_compressed_pubkey(key) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

fn is_valid_pubkey(key: &[u8]) -> bool {
    match key.first() {
        Some(0x02) | Some(0x03) => key.len() == 33,
        Some(0x04) => key.len() == 65,
        _ => false,
    }
}

fn is_compressed_pubkey(key: &[u8]) -> bool {
    matches!(key.first(), Some(0x02) | Some(0x03)) && key.len() == 33
}

/// Verify a raw DER signature over a 32-byte digest.
fn ecdsa_verify_hash(digest: &Hash, sig_der: &[u8], pubkey: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();

    let pubkey = match PublicKey::from_slice(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };

    let mut signature = match Signature::from_der(sig_der) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    // High-S acceptance is the encoding checks' concern, not the
    // verifier's.
    signature.normalize_s();

    let message = match Message::from_digest_slice(digest) {
        Ok(msg) => msg,
        Err(_) => return false,
    };

    secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

/// Verify a data signature: ECDSA over the single SHA-256 of `msg`.
pub fn verify_data_signature(sig: &[u8], msg: &[u8], pubkey: &[u8]) -> bool {
    let digest = Sha256::digest(msg);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    ecdsa_verify_hash(&hash, sig, pubkey)
}

// ============================================================================
// SIGNATURE CHECKER
// ============================================================================

/// Transaction context for CHECKSIG-family and locktime opcodes.
pub trait SignatureChecker {
    /// Verify a transaction signature (with trailing hashtype byte).
    fn check_sig(
        &mut self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        flags: u32,
    ) -> Result<bool, ScriptError>;

    fn check_locktime(&self, locktime: i64) -> bool;

    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Checker with no transaction: every signature fails, every lock
/// fails. Suits raw script evaluation in tests.
pub struct NoChecker;

impl SignatureChecker for NoChecker {
    fn check_sig(
        &mut self,
        _sig: &[u8],
        _pubkey: &[u8],
        _script_code: &[u8],
        _flags: u32,
    ) -> Result<bool, ScriptError> {
        Ok(false)
    }

    fn check_locktime(&self, _locktime: i64) -> bool {
        false
    }

    fn check_sequence(&self, _sequence: i64) -> bool {
        false
    }
}

/// Checker bound to one input of a spending transaction.
pub struct TxChecker<'a> {
    pub tx: &'a Transaction,
    pub index: usize,
    pub value: Amount,
    pub midstates: Option<&'a SighashMidstates>,
}

impl<'a> TxChecker<'a> {
    pub fn new(tx: &'a Transaction, index: usize, value: Amount) -> Self {
        Self {
            tx,
            index,
            value,
            midstates: None,
        }
    }

    pub fn with_midstates(mut self, midstates: &'a SighashMidstates) -> Self {
        self.midstates = Some(midstates);
        self
    }
}

impl SignatureChecker for TxChecker<'_> {
    fn check_sig(
        &mut self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        flags: u32,
    ) -> Result<bool, ScriptError> {
        if sig.is_empty() {
            return Ok(false);
        }

        let hashtype = sig[sig.len() - 1] as u32;
        let digest = signature_hash(
            self.tx,
            self.index,
            script_code,
            self.value,
            hashtype,
            flags,
            self.midstates,
        );
        Ok(ecdsa_verify_hash(&digest, &sig[..sig.len() - 1], pubkey))
    }

    fn check_locktime(&self, locktime: i64) -> bool {
        let tx_locktime = self.tx.locktime as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;

        // Height locks and time locks do not compare.
        if (tx_locktime < threshold) != (locktime < threshold) {
            return false;
        }
        if locktime > tx_locktime {
            return false;
        }
        self.tx.inputs[self.index].sequence != SEQUENCE_FINAL
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        if self.tx.version < 2 {
            return false;
        }

        let tx_sequence = self.tx.inputs[self.index].sequence as i64;
        if tx_sequence & SEQUENCE_DISABLE_FLAG as i64 != 0 {
            return false;
        }

        let mask = (SEQUENCE_TYPE_FLAG | SEQUENCE_MASK) as i64;
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        let type_flag = SEQUENCE_TYPE_FLAG as i64;

        if (tx_masked < type_flag) != (masked < type_flag) {
            return false;
        }
        masked <= tx_masked
    }
}

// ============================================================================
// INTERPRETER
// ============================================================================

fn cast_to_bool(data: &[u8]) -> bool {
    for (i, &byte) in data.iter().enumerate() {
        if byte != 0 {
            // Negative zero counts as false.
            if i == data.len() - 1 && byte == 0x80 {
                return false;
            }
            return true;
        }
    }
    false
}

fn bool_item(value: bool) -> Bytes {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn pop(stack: &mut Vec<Bytes>) -> Result<Bytes, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn top(stack: &[Bytes], from_top: usize) -> Result<&Bytes, ScriptError> {
    if stack.len() <= from_top {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - 1 - from_top])
}

fn pop_num(stack: &mut Vec<Bytes>, flags: u32) -> Result<i64, ScriptError> {
    let item = pop(stack)?;
    scriptnum::decode(
        &item,
        flags & VERIFY_MINIMALDATA != 0,
        scriptnum::DEFAULT_MAX_NUM_SIZE,
    )
}

/// EvalScript: 𝕊 × 𝒮𝒯 × ℕ → 𝒮𝒯
///
/// Run one script over the given stack:
/// 1. Reject oversized scripts outright.
/// 2. Execute operations under the conditional state, enforcing the
///    push, stack, and operation limits as they are crossed.
/// 3. Surface the first failure as a typed [`ScriptError`].
pub fn eval_script(
    stack: &mut Vec<Bytes>,
    script: &[u8],
    flags: u32,
    checker: &mut dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut altstack: Vec<Bytes> = Vec::new();
    let mut cond_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut last_codesep = 0usize;
    let mut pos = 0usize;

    let require_minimal = flags & VERIFY_MINIMALDATA != 0;

    while pos < script.len() {
        let (opcode, push, next_pos) = next_op(script, pos)?;
        let executing = cond_stack.iter().all(|&active| active);

        if let Some(data) = push {
            if data.len() > MAX_SCRIPT_PUSH {
                return Err(ScriptError::PushSize);
            }
        }

        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_SCRIPT_OPS {
                return Err(ScriptError::OpCount);
            }
        }

        // Disabled opcodes poison the script wherever they appear.
        match opcode {
            OP_INVERT | OP_2MUL | OP_2DIV | OP_MUL | OP_LSHIFT | OP_RSHIFT => {
                return Err(ScriptError::DisabledOpcode);
            }
            OP_VERIF | OP_VERNOTIF => {
                return Err(ScriptError::BadOpcode);
            }
            _ => {}
        }

        if !executing && !(OP_IF..=OP_ENDIF).contains(&opcode) {
            pos = next_pos;
            continue;
        }

        if let Some(data) = push {
            if executing {
                if require_minimal && !is_minimal_push(opcode, data) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
            if stack.len() + altstack.len() > MAX_SCRIPT_STACK {
                return Err(ScriptError::StackSize);
            }
            pos = next_pos;
            continue;
        }

        match opcode {
            OP_1NEGATE => {
                stack.push(scriptnum::encode(-1));
            }
            OP_1..=OP_16 => {
                stack.push(scriptnum::encode((opcode - OP_1 + 1) as i64));
            }

            OP_NOP | OP_NOP1 | 0xb3..=OP_NOP10 => {}

            OP_IF | OP_NOTIF => {
                let mut value = false;
                if executing {
                    let item = pop(stack).map_err(|_| ScriptError::UnbalancedConditional)?;
                    value = cast_to_bool(&item);
                    if opcode == OP_NOTIF {
                        value = !value;
                    }
                }
                cond_stack.push(value);
            }
            OP_ELSE => {
                let last = cond_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            OP_ENDIF => {
                cond_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }

            OP_VERIFY => {
                let item = pop(stack)?;
                if !cast_to_bool(&item) {
                    return Err(ScriptError::Verify);
                }
            }
            OP_RETURN => {
                return Err(ScriptError::OpReturn);
            }
            OP_VER | OP_RESERVED | OP_RESERVED1 | OP_RESERVED2 => {
                return Err(ScriptError::BadOpcode);
            }

            OP_TOALTSTACK => {
                altstack.push(pop(stack)?);
            }
            OP_FROMALTSTACK => {
                let item = altstack
                    .pop()
                    .ok_or(ScriptError::InvalidAltstackOperation)?;
                stack.push(item);
            }

            OP_2DROP => {
                pop(stack)?;
                pop(stack)?;
            }
            OP_2DUP => {
                let a = top(stack, 1)?.clone();
                let b = top(stack, 0)?.clone();
                stack.push(a);
                stack.push(b);
            }
            OP_3DUP => {
                let a = top(stack, 2)?.clone();
                let b = top(stack, 1)?.clone();
                let c = top(stack, 0)?.clone();
                stack.push(a);
                stack.push(b);
                stack.push(c);
            }
            OP_2OVER => {
                let a = top(stack, 3)?.clone();
                let b = top(stack, 2)?.clone();
                stack.push(a);
                stack.push(b);
            }
            OP_2ROT => {
                if stack.len() < 6 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let b = stack.remove(stack.len() - 5);
                let a = stack.remove(stack.len() - 5);
                stack.push(a);
                stack.push(b);
            }
            OP_2SWAP => {
                if stack.len() < 4 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                stack.swap(len - 4, len - 2);
                stack.swap(len - 3, len - 1);
            }
            OP_IFDUP => {
                let item = top(stack, 0)?.clone();
                if cast_to_bool(&item) {
                    stack.push(item);
                }
            }
            OP_DEPTH => {
                stack.push(scriptnum::encode(stack.len() as i64));
            }
            OP_DROP => {
                pop(stack)?;
            }
            OP_DUP => {
                let item = top(stack, 0)?.clone();
                stack.push(item);
            }
            OP_NIP => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.remove(stack.len() - 2);
            }
            OP_OVER => {
                let item = top(stack, 1)?.clone();
                stack.push(item);
            }
            OP_PICK | OP_ROLL => {
                let n = pop_num(stack, flags)?;
                if n < 0 || n as usize >= stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let index = stack.len() - 1 - n as usize;
                if opcode == OP_PICK {
                    let item = stack[index].clone();
                    stack.push(item);
                } else {
                    let item = stack.remove(index);
                    stack.push(item);
                }
            }
            OP_ROT => {
                if stack.len() < 3 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let item = stack.remove(stack.len() - 3);
                stack.push(item);
            }
            OP_SWAP => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                stack.swap(len - 2, len - 1);
            }
            OP_TUCK => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let item = top(stack, 0)?.clone();
                stack.insert(stack.len() - 2, item);
            }

            OP_CAT => {
                let b = pop(stack)?;
                let mut a = pop(stack)?;
                if a.len() + b.len() > MAX_SCRIPT_PUSH {
                    return Err(ScriptError::PushSize);
                }
                a.extend_from_slice(&b);
                stack.push(a);
            }
            OP_SPLIT => {
                let position = pop_num(stack, flags)?;
                let data = pop(stack)?;
                if position < 0 || position as usize > data.len() {
                    return Err(ScriptError::InvalidSplitRange);
                }
                let at = position as usize;
                stack.push(data[..at].to_vec());
                stack.push(data[at..].to_vec());
            }
            OP_NUM2BIN => {
                let size = pop_num(stack, flags)?;
                if size < 0 {
                    return Err(ScriptError::ImpossibleEncoding);
                }
                if size as usize > MAX_SCRIPT_PUSH {
                    return Err(ScriptError::PushSize);
                }
                let size = size as usize;

                let mut raw = scriptnum::minimize(pop(stack)?);
                if raw.len() > size {
                    return Err(ScriptError::ImpossibleEncoding);
                }
                if raw.len() < size {
                    let sign = if let Some(last) = raw.last_mut() {
                        let bit = *last & 0x80;
                        *last &= 0x7f;
                        bit
                    } else {
                        0x00
                    };
                    while raw.len() < size - 1 {
                        raw.push(0x00);
                    }
                    raw.push(sign);
                }
                stack.push(raw);
            }
            OP_BIN2NUM => {
                let reduced = scriptnum::minimize(pop(stack)?);
                if reduced.len() > scriptnum::DEFAULT_MAX_NUM_SIZE {
                    return Err(ScriptError::InvalidNumberRange);
                }
                stack.push(reduced);
            }
            OP_SIZE => {
                let len = top(stack, 0)?.len();
                stack.push(scriptnum::encode(len as i64));
            }

            OP_AND | OP_OR | OP_XOR => {
                let b = pop(stack)?;
                let mut a = pop(stack)?;
                if a.len() != b.len() {
                    return Err(ScriptError::InvalidOperandSize);
                }
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    match opcode {
                        OP_AND => *x &= y,
                        OP_OR => *x |= y,
                        _ => *x ^= y,
                    }
                }
                stack.push(a);
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                let equal = a == b;
                if opcode == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    stack.push(bool_item(equal));
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let n = pop_num(stack, flags)?;
                let result = match opcode {
                    OP_1ADD => n + 1,
                    OP_1SUB => n - 1,
                    OP_NEGATE => -n,
                    OP_ABS => n.abs(),
                    OP_NOT => (n == 0) as i64,
                    _ => (n != 0) as i64,
                };
                stack.push(scriptnum::encode(result));
            }

            OP_ADD | OP_SUB | OP_DIV | OP_MOD | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL
            | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN
            | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                let b = pop_num(stack, flags)?;
                let a = pop_num(stack, flags)?;
                let result = match opcode {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_DIV => {
                        if b == 0 {
                            return Err(ScriptError::DivByZero);
                        }
                        a / b
                    }
                    OP_MOD => {
                        if b == 0 {
                            return Err(ScriptError::ModByZero);
                        }
                        a % b
                    }
                    OP_BOOLAND => (a != 0 && b != 0) as i64,
                    OP_BOOLOR => (a != 0 || b != 0) as i64,
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                    OP_NUMNOTEQUAL => (a != b) as i64,
                    OP_LESSTHAN => (a < b) as i64,
                    OP_GREATERTHAN => (a > b) as i64,
                    OP_LESSTHANOREQUAL => (a <= b) as i64,
                    OP_GREATERTHANOREQUAL => (a >= b) as i64,
                    OP_MIN => a.min(b),
                    _ => a.max(b),
                };
                if opcode == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::NumEqualVerify);
                    }
                } else {
                    stack.push(scriptnum::encode(result));
                }
            }

            OP_WITHIN => {
                let max = pop_num(stack, flags)?;
                let min = pop_num(stack, flags)?;
                let x = pop_num(stack, flags)?;
                stack.push(bool_item(min <= x && x < max));
            }

            OP_RIPEMD160 => {
                let item = pop(stack)?;
                stack.push(Ripemd160::digest(&item).to_vec());
            }
            OP_SHA1 => {
                let item = pop(stack)?;
                stack.push(Sha1::digest(&item).to_vec());
            }
            OP_SHA256 => {
                let item = pop(stack)?;
                stack.push(Sha256::digest(&item).to_vec());
            }
            OP_HASH160 => {
                let item = pop(stack)?;
                stack.push(Ripemd160::digest(Sha256::digest(&item)).to_vec());
            }
            OP_HASH256 => {
                let item = pop(stack)?;
                stack.push(Sha256::digest(Sha256::digest(&item)).to_vec());
            }

            OP_CODESEPARATOR => {
                last_codesep = next_pos;
            }

            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = pop(stack)?;
                let sig = pop(stack)?;

                check_signature_encoding(&sig, flags)?;
                check_pubkey_encoding(&pubkey, flags)?;

                let script_code = &script[last_codesep..];
                let success = if sig.is_empty() {
                    false
                } else {
                    checker.check_sig(&sig, &pubkey, script_code, flags)?
                };

                if !success && flags & VERIFY_NULLFAIL != 0 && !sig.is_empty() {
                    return Err(ScriptError::NullFail);
                }

                if opcode == OP_CHECKSIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    stack.push(bool_item(success));
                }
            }

            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let key_count = pop_num(stack, flags)?;
                if key_count < 0 || key_count > MAX_MULTISIG_PUBKEYS {
                    return Err(ScriptError::PubkeyCount);
                }
                op_count += key_count as usize;
                if op_count > MAX_SCRIPT_OPS {
                    return Err(ScriptError::OpCount);
                }

                let mut keys = Vec::with_capacity(key_count as usize);
                for _ in 0..key_count {
                    keys.push(pop(stack)?);
                }
                keys.reverse();

                let sig_count = pop_num(stack, flags)?;
                if sig_count < 0 || sig_count > key_count {
                    return Err(ScriptError::SigCount);
                }
                let mut sigs = Vec::with_capacity(sig_count as usize);
                for _ in 0..sig_count {
                    sigs.push(pop(stack)?);
                }
                sigs.reverse();

                // Historical off-by-one: an extra element is consumed.
                pop(stack)?;

                let script_code = &script[last_codesep..];
                let mut ikey = 0usize;
                let mut isig = 0usize;
                let mut success = true;

                while success && isig < sigs.len() {
                    let sig = &sigs[isig];
                    let key = &keys[ikey];

                    check_signature_encoding(sig, flags)?;
                    check_pubkey_encoding(key, flags)?;

                    let ok = !sig.is_empty()
                        && checker.check_sig(sig, key, script_code, flags)?;
                    if ok {
                        isig += 1;
                    }
                    ikey += 1;

                    if sigs.len() - isig > keys.len() - ikey {
                        success = false;
                    }
                }

                if !success && flags & VERIFY_NULLFAIL != 0 {
                    if sigs.iter().any(|sig| !sig.is_empty()) {
                        return Err(ScriptError::NullFail);
                    }
                }

                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    stack.push(bool_item(success));
                }
            }

            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                if flags & VERIFY_CHECKDATASIG == 0 {
                    return Err(ScriptError::BadOpcode);
                }

                let pubkey = pop(stack)?;
                let message = pop(stack)?;
                let sig = pop(stack)?;

                check_data_signature_encoding(&sig, flags)?;
                check_pubkey_encoding(&pubkey, flags)?;

                let success = !sig.is_empty() && verify_data_signature(&sig, &message, &pubkey);

                if !success && flags & VERIFY_NULLFAIL != 0 && !sig.is_empty() {
                    return Err(ScriptError::NullFail);
                }

                if opcode == OP_CHECKDATASIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckDataSigVerify);
                    }
                } else {
                    stack.push(bool_item(success));
                }
            }

            OP_CHECKLOCKTIMEVERIFY => {
                if flags & VERIFY_CHECKLOCKTIMEVERIFY != 0 {
                    let item = top(stack, 0)?;
                    let locktime = scriptnum::decode(item, require_minimal, 5)?;
                    if locktime < 0 {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    if !checker.check_locktime(locktime) {
                        return Err(ScriptError::UnsatisfiedLocktime);
                    }
                }
            }
            OP_CHECKSEQUENCEVERIFY => {
                if flags & VERIFY_CHECKSEQUENCEVERIFY != 0 {
                    let item = top(stack, 0)?;
                    let sequence = scriptnum::decode(item, require_minimal, 5)?;
                    if sequence < 0 {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    if sequence & SEQUENCE_DISABLE_FLAG as i64 == 0
                        && !checker.check_sequence(sequence)
                    {
                        return Err(ScriptError::UnsatisfiedLocktime);
                    }
                }
            }

            _ => {
                return Err(ScriptError::BadOpcode);
            }
        }

        if stack.len() + altstack.len() > MAX_SCRIPT_STACK {
            return Err(ScriptError::StackSize);
        }

        pos = next_pos;
    }

    if !cond_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }

    Ok(())
}

/// VerifyScript: 𝕊 × 𝕊 × ℕ → {ok, error}
///
/// Full input verification:
/// 1. Run the input script on an empty stack.
/// 2. Run the output script on the result; the top element must be
///    truthy.
/// 3. For pay-to-script-hash outputs, re-run with the redeem script
///    popped from the pristine input-script stack.
/// 4. Under CLEANSTACK, exactly one element may remain.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: u32,
    checker: &mut dyn SignatureChecker,
) -> Result<(), ScriptError> {
    let p2sh = flags & VERIFY_P2SH != 0 && is_p2sh(script_pubkey);

    if p2sh && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Bytes> = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker)?;

    let saved = if p2sh { stack.clone() } else { Vec::new() };

    eval_script(&mut stack, script_pubkey, flags, checker)?;

    if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
        return Err(ScriptError::EvalFalse);
    }

    if p2sh {
        stack = saved;
        let redeem = pop(&mut stack)?;
        eval_script(&mut stack, &redeem, flags, checker)?;
        if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
            return Err(ScriptError::EvalFalse);
        }
    }

    if flags & VERIFY_CLEANSTACK != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    Ok(())
}

// ============================================================================
// SIGOP COUNTING
// ============================================================================

/// Count signature operations in a script.
///
/// CHECKSIG counts one; CHECKMULTISIG counts the announced key count
/// when `accurate` and the count is visible, otherwise the maximum.
pub fn count_sigops(script: &[u8], accurate: bool) -> usize {
    let mut count = 0usize;
    let mut last_opcode = 0xffu8;
    let mut pos = 0usize;

    while pos < script.len() {
        let (opcode, _, next_pos) = match next_op(script, pos) {
            Ok(op) => op,
            Err(_) => break,
        };

        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY | OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                count += 1;
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += (last_opcode - OP_1 + 1) as usize;
                } else {
                    count += MAX_MULTISIG_PUBKEYS as usize;
                }
            }
            _ => {}
        }

        last_opcode = opcode;
        pos = next_pos;
    }

    count
}

/// Accurate sigop count of the redeem script spent by `script_sig`
/// against a P2SH output.
pub fn count_p2sh_sigops(script_pubkey: &[u8], script_sig: &[u8]) -> usize {
    if !is_p2sh(script_pubkey) {
        return 0;
    }
    if !is_push_only(script_sig) {
        return 0;
    }

    // The redeem script is the final push of the input script.
    let mut redeem: Option<&[u8]> = None;
    let mut pos = 0usize;
    while pos < script_sig.len() {
        match next_op(script_sig, pos) {
            Ok((_, data, next_pos)) => {
                redeem = data;
                pos = next_pos;
            }
            Err(_) => return 0,
        }
    }

    match redeem {
        Some(script) => count_sigops(script, true),
        None => 0,
    }
}
