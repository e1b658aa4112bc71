//! # cash-consensus
//!
//! Consensus core of a Bitcoin Cash style full node: the subsystems
//! that decide, byte for byte with peers, which transactions and
//! blocks are valid and which chain is best.
//!
//! ## Architecture
//!
//! The crate is layered bottom-up:
//! - `types` / `codec`: the data model and its exact wire format.
//! - `address`: Base58Check and cashaddr encodings.
//! - `scriptnum` / `sighash` / `script`: the script engine, including
//!   the cash opcode set and the forkid signing algorithm.
//! - `transaction`: context-free sanity and contextual input rules.
//! - `utxo` / `store`: the coin view overlay and the abstract
//!   persistence interface.
//! - `pow` / `params` / `chain`: difficulty, activation, connection,
//!   and reorganization.
//! - `mempool` / `mining`: the transaction pool and block assembly.
//!
//! ## Design principles
//!
//! 1. No global state: verification flags, network parameters, and
//!    clocks are explicit arguments or chain fields.
//! 2. Typed errors at every boundary; the interpreter never leaks
//!    control flow across components.
//! 3. Deterministic behaviour: identical inputs produce identical
//!    validation outcomes on every node.
//!
//! ## Usage
//!
//! ```rust
//! use cash_consensus::chain::Chain;
//! use cash_consensus::params::Params;
//! use cash_consensus::store::MemStore;
//!
//! let chain = Chain::open(Params::regtest(), Box::new(MemStore::new())).unwrap();
//! assert_eq!(chain.height(), 0);
//! ```

pub mod address;
pub mod chain;
pub mod codec;
pub mod constants;
pub mod error;
pub mod mempool;
pub mod mining;
pub mod params;
pub mod pow;
pub mod script;
pub mod scriptnum;
pub mod sighash;
pub mod store;
pub mod transaction;
pub mod types;
pub mod utxo;

// Re-export the types most callers touch.
pub use address::{Address, AddressType};
pub use chain::{Chain, ChainEntry, ChainListener, InputVerifier};
pub use constants::{COIN, MAX_MONEY};
pub use error::{ConsensusError, Result, ScriptError, VerifyError};
pub use mempool::Mempool;
pub use mining::{assemble, AssemblerOptions, BlockTemplate};
pub use params::Params;
pub use store::{MemStore, Store};
pub use types::{Amount, Block, Hash, Header, Input, OutPoint, Output, Transaction};
