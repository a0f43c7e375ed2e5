use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use std::sync::atomic::{AtomicBool, Ordering};

use super::crypto::{hash_tokens, stringify, CryptoError};
use super::transaction::Transaction;
use super::INITIAL_DIFFICULTY;
use super::MINE_RATE_MS;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Milliseconds since the Unix epoch when the nonce was found
    pub timestamp: i64,

    /// Hash of the previous block
    pub last_hash: String,

    /// Hash over every other field
    pub hash: String,

    /// Transactions confirmed by this block
    pub data: Vec<Transaction>,

    /// Proof of work search variable
    pub nonce: u64,

    /// Required leading zero bits of `hash`
    pub difficulty: u32,
}

impl Block {
    /// The hardcoded first block of every chain
    pub fn genesis() -> Self {
        Block {
            timestamp: 1,
            last_hash: "genesis-last-hash".to_string(),
            hash: "genesis-hash".to_string(),
            data: Vec::new(),
            nonce: 0,
            difficulty: INITIAL_DIFFICULTY,
        }
    }

    /// Recomputes the hash from the block's fields
    pub fn calculate_hash(&self) -> Result<String, CryptoError> {
        let data = stringify(&self.data)?;
        Self::hash_fields(self.timestamp, &self.last_hash, &data, self.nonce, self.difficulty)
    }

    /// `data` is the already stringified transaction list
    fn hash_fields(
        timestamp: i64,
        last_hash: &str,
        data: &str,
        nonce: u64,
        difficulty: u32,
    ) -> Result<String, CryptoError> {
        let timestamp = stringify(&timestamp)?;
        let last_hash = stringify(last_hash)?;
        let nonce = stringify(&nonce)?;
        let difficulty = stringify(&difficulty)?;

        Ok(hash_tokens(&mut [
            timestamp.as_str(),
            last_hash.as_str(),
            data,
            nonce.as_str(),
            difficulty.as_str(),
        ]))
    }

    /// Difficulty for a block stamped `timestamp` following `last_block`
    ///
    /// One step harder when the block came faster than [`MINE_RATE_MS`], one
    /// step easier otherwise, never below 1.
    pub fn adjust_difficulty(last_block: &Block, timestamp: i64) -> u32 {
        let difficulty = last_block.difficulty.max(1);

        if timestamp.saturating_sub(last_block.timestamp) < MINE_RATE_MS {
            difficulty + 1
        } else {
            (difficulty - 1).max(1)
        }
    }

    /// Mines a block on top of `last_block`
    pub fn mine(last_block: &Block, data: Vec<Transaction>) -> Result<Block, CryptoError> {
        let data_token = stringify(&data)?;
        let mut nonce: u64 = 0;

        loop {
            nonce = nonce.wrapping_add(1);
            if let Some(found) = Self::attempt(last_block, &data_token, nonce)? {
                return Ok(found.into_block(last_block, data));
            }
        }
    }

    /// Mines a block on top of `last_block`, giving up once `cancel` is set
    ///
    /// Returns `Ok(None)` when cancelled.
    pub fn mine_cancellable(
        last_block: &Block,
        data: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Option<Block>, CryptoError> {
        let data_token = stringify(&data)?;
        let mut nonce: u64 = 0;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }

            nonce = nonce.wrapping_add(1);
            if let Some(found) = Self::attempt(last_block, &data_token, nonce)? {
                return Ok(Some(found.into_block(last_block, data)));
            }
        }
    }

    /// Tries one nonce. The timestamp is restamped on every attempt and the
    /// difficulty follows it.
    fn attempt(
        last_block: &Block,
        data_token: &str,
        nonce: u64,
    ) -> Result<Option<Solution>, CryptoError> {
        let timestamp = Utc::now().timestamp_millis();
        let difficulty = Self::adjust_difficulty(last_block, timestamp);
        let hash = Self::hash_fields(timestamp, &last_block.hash, data_token, nonce, difficulty)?;

        if meets_difficulty(&hash, difficulty) {
            Ok(Some(Solution {
                timestamp,
                hash,
                nonce,
                difficulty,
            }))
        } else {
            Ok(None)
        }
    }
}

/// Header fields of a successful nonce search
struct Solution {
    timestamp: i64,
    hash: String,
    nonce: u64,
    difficulty: u32,
}

impl Solution {
    fn into_block(self, last_block: &Block, data: Vec<Transaction>) -> Block {
        Block {
            timestamp: self.timestamp,
            last_hash: last_block.hash.clone(),
            hash: self.hash,
            data,
            nonce: self.nonce,
            difficulty: self.difficulty,
        }
    }
}

/// Counts the leading zero bits of a hex digest
///
/// Counting stops at the first non-hex character.
pub fn leading_zero_bits(hash: &str) -> u32 {
    let mut total = 0u32;
    for c in hash.chars() {
        match c.to_digit(16) {
            Some(0) => total += 4,
            Some(nibble) => {
                total += nibble.leading_zeros() - 28;
                break;
            }
            None => break,
        }
    }
    total
}

/// The proof of work predicate
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    leading_zero_bits(hash) >= difficulty
}
