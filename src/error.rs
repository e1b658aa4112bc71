//! Error types for consensus validation.
//!
//! Two kinds cross component boundaries: [`ScriptError`], raised inside
//! the interpreter, and [`VerifyError`], raised by transaction and chain
//! validation with a stable reason tag and a peer-banning score. Script
//! failures never escape an input check directly; they are converted to
//! a `VerifyError` at the edge of the interpreter.

use thiserror::Error;

/// Failure codes of the script interpreter.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("evaluated without error but finished with a false top element")]
    EvalFalse,

    #[error("OP_RETURN encountered")]
    OpReturn,

    #[error("script is larger than the maximum script size")]
    ScriptSize,

    #[error("push exceeds the maximum element size")]
    PushSize,

    #[error("operation limit exceeded")]
    OpCount,

    #[error("stack limit exceeded")]
    StackSize,

    #[error("signature count out of range")]
    SigCount,

    #[error("public key count out of range")]
    PubkeyCount,

    #[error("verify failed")]
    Verify,

    #[error("equalverify failed")]
    EqualVerify,

    #[error("checksigverify failed")]
    CheckSigVerify,

    #[error("checkdatasigverify failed")]
    CheckDataSigVerify,

    #[error("numequalverify failed")]
    NumEqualVerify,

    #[error("bad opcode")]
    BadOpcode,

    #[error("disabled opcode")]
    DisabledOpcode,

    #[error("invalid stack operation")]
    InvalidStackOperation,

    #[error("invalid altstack operation")]
    InvalidAltstackOperation,

    #[error("unbalanced conditional")]
    UnbalancedConditional,

    #[error("negative locktime")]
    NegativeLocktime,

    #[error("locktime requirement not satisfied")]
    UnsatisfiedLocktime,

    #[error("operands to a bitwise operation differ in size")]
    InvalidOperandSize,

    #[error("number is outside the representable range")]
    InvalidNumberRange,

    #[error("split position is outside the operand")]
    InvalidSplitRange,

    #[error("the requested encoding is impossible to satisfy")]
    ImpossibleEncoding,

    #[error("division by zero")]
    DivByZero,

    #[error("modulo by zero")]
    ModByZero,

    #[error("signature hash type is invalid")]
    SigHashType,

    #[error("signature is not strict DER")]
    SigDer,

    #[error("signature S value is too high")]
    SigHighS,

    #[error("signature must be empty on failure")]
    NullFail,

    #[error("public key is not correctly encoded")]
    PubkeyType,

    #[error("non-push operation in a push-only script")]
    SigPushOnly,

    #[error("stack not clean after evaluation")]
    CleanStack,

    #[error("signature must not use the forkid bit")]
    IllegalForkid,

    #[error("signature must use the forkid bit")]
    MustUseForkid,

    #[error("push is not minimally encoded")]
    MinimalData,

    #[error("unknown error")]
    UnknownError,
}

/// Rejection raised by transaction or chain validation.
///
/// `reason` is a short stable tag of the form `bad-txns-vin-empty`;
/// `score` is the 0-100 weight a peer manager would add to the ban
/// score of whoever relayed the offending object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct VerifyError {
    pub reason: String,
    pub score: u8,
}

impl VerifyError {
    pub fn new(reason: &str, score: u8) -> Self {
        Self {
            reason: reason.to_string(),
            score,
        }
    }

    /// Wrap a script failure in the consensus reason used for input checks.
    pub fn from_script(err: ScriptError) -> Self {
        Self {
            reason: format!("mandatory-script-verify-flag-failed ({})", err),
            score: 100,
        }
    }
}

/// Failures of the wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of data")]
    UnexpectedEnd,

    #[error("non-canonical varint")]
    NonCanonicalVarint,

    #[error("trailing bytes after decoded object")]
    TrailingBytes,

    #[error("size exceeds sanity bound: {0}")]
    OversizedAllocation(u64),
}

/// Failures of address encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address string")]
    InvalidString,

    #[error("Invalid base58 character")]
    InvalidBase58Character,

    #[error("Invalid base58 length")]
    InvalidBase58Length,

    #[error("Invalid base58 checksum")]
    InvalidBase58Checksum,

    #[error("Unknown address prefix")]
    UnknownPrefix,

    #[error("Invalid cashaddr casing")]
    InvalidCasing,

    #[error("Invalid cashaddr character")]
    InvalidCashaddrCharacter,

    #[error("Invalid cashaddr checksum")]
    InvalidCashaddrChecksum,

    #[error("Invalid cashaddr data length")]
    InvalidCashaddrLength,

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Non zero padding")]
    NonZeroPadding,

    #[error("Invalid cashaddr version byte")]
    InvalidVersionByte,
}

/// Failures surfaced by the backing store, passed through unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store schema version mismatch: found {found}, expected {expected}")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("store corruption: {0}")]
    Corruption(String),
}

/// Umbrella error for every fallible crate operation.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
