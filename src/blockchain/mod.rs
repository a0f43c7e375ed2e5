// Blockchain module
//
// This module contains the consensus and validation engine:
// - Hashing and signature primitives
// - Transactions and the pending transaction pool
// - Wallets and chain-derived balances
// - Blocks, proof of work and difficulty retargeting
// - Chain validation and the longest valid chain rule
// - Optional sled persistence

pub mod block;
pub mod chain;
pub mod crypto;
pub mod pool;
pub mod storage;
pub mod transaction;
pub mod wallet;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, ChainError};
pub use crypto::{Address, DigitalSignature};
pub use pool::TransactionPool;
pub use transaction::{Transaction, TransactionError, TransactionInput};
pub use wallet::Wallet;

/// Balance of an address that has neither spent nor received anything.
pub const STARTING_BALANCE: u64 = 1000;

/// Amount minted to the miner of each block.
pub const MINING_REWARD: u64 = 50;

/// Difficulty of the genesis block.
pub const INITIAL_DIFFICULTY: u32 = 3;

/// Target time between blocks, in milliseconds.
pub const MINE_RATE_MS: i64 = 1000;
