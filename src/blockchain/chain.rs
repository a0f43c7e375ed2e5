use log::{error, info};
use thiserror::Error;

use std::collections::HashSet;

use super::block::{meets_difficulty, Block};
use super::crypto::{Address, CryptoError};
use super::transaction::{Transaction, TransactionError, TransactionInput};
use super::wallet::Wallet;
use super::MINING_REWARD;

/// Reasons a chain, or a block offered for it, is rejected
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("The incoming chain must be longer: {candidate} blocks against {current}")]
    NotLonger { candidate: usize, current: usize },

    #[error("The chain does not start with the genesis block")]
    InvalidGenesis,

    #[error("Block {index} does not link to the hash of its predecessor")]
    BrokenLink { index: usize },

    #[error("Block {index} has a hash that does not match its contents")]
    HashMismatch { index: usize },

    #[error("Block {index} does not meet its difficulty of {difficulty}")]
    InsufficientWork { index: usize, difficulty: u32 },

    #[error("Block {index} claims a difficulty of zero")]
    ZeroDifficulty { index: usize },

    #[error("Block {index} jumps difficulty from {from} to {to}")]
    DifficultyJump { index: usize, from: u32, to: u32 },

    #[error("Block {index} has more than one reward transaction")]
    MultipleRewards { index: usize },

    #[error("Block {index} has a malformed reward transaction {id}")]
    InvalidReward { index: usize, id: String },

    #[error("Block {index} has an invalid transaction: {source}")]
    InvalidTransaction {
        index: usize,
        #[source]
        source: TransactionError,
    },

    #[error("Block {index}: {address} claims a balance of {claimed}, the chain holds {balance}")]
    InvalidInputAmount {
        index: usize,
        address: Address,
        claimed: u64,
        balance: u64,
    },

    #[error("Block {index} contains transaction {id} more than once")]
    DuplicateTransaction { index: usize, id: String },

    #[error("Block {index} contains more than one transaction signed by {address}")]
    DuplicateSender { index: usize, address: Address },

    #[error("Mined block extends {expected} but the tip is now {actual}")]
    StaleTip { expected: String, actual: String },

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Represents the blockchain
///
/// Always starts with [`Block::genesis`]. Grows through [`Blockchain::add_block`]
/// or [`Blockchain::append_mined`] and is swapped wholesale by
/// [`Blockchain::replace_chain`].
#[derive(Debug, Clone)]
pub struct Blockchain {
    chain: Vec<Block>,
}

impl Blockchain {
    /// Creates a new blockchain with the genesis block
    pub fn new() -> Self {
        Blockchain {
            chain: vec![Block::genesis()],
        }
    }

    /// Adopts blocks loaded from storage, if they form a valid chain
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self, ChainError> {
        Self::check_chain(&blocks)?;
        Self::check_transaction_data(&blocks)?;
        Ok(Blockchain { chain: blocks })
    }

    /// All blocks, oldest first
    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Number of blocks including genesis
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Never true, a chain holds at least the genesis block
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> &Block {
        // the constructors guarantee at least the genesis block
        &self.chain[self.chain.len() - 1]
    }

    /// Mines `data` on top of the tip and appends the result
    pub fn add_block(&mut self, data: Vec<Transaction>) -> Result<&Block, ChainError> {
        let block = Block::mine(self.last_block(), data)?;
        self.chain.push(block);
        Ok(self.last_block())
    }

    /// Appends a block mined elsewhere against a snapshot of the tip
    ///
    /// Fails with [`ChainError::StaleTip`] when the tip moved while mining.
    pub fn append_mined(&mut self, block: Block) -> Result<(), ChainError> {
        let tip = self.last_block();
        if block.last_hash != tip.hash {
            return Err(ChainError::StaleTip {
                expected: block.last_hash,
                actual: tip.hash.clone(),
            });
        }

        Self::check_link(tip, &block, self.chain.len())?;
        self.chain.push(block);
        Ok(())
    }

    /// Replaces the chain when `candidate` is longer and fully valid
    ///
    /// Ties keep the incumbent. Every rejection is logged and leaves the
    /// local chain untouched.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> Result<(), ChainError> {
        if candidate.len() <= self.chain.len() {
            let err = ChainError::NotLonger {
                candidate: candidate.len(),
                current: self.chain.len(),
            };
            error!("{}", err);
            return Err(err);
        }

        if let Err(err) = Self::check_chain(&candidate) {
            error!("The incoming chain must be valid: {}", err);
            return Err(err);
        }

        if let Err(err) = Self::check_transaction_data(&candidate) {
            error!("The incoming chain has invalid transaction data: {}", err);
            return Err(err);
        }

        info!(
            "Replacing chain of {} blocks with {} blocks",
            self.chain.len(),
            candidate.len()
        );
        self.chain = candidate;
        Ok(())
    }

    /// Checks genesis, linkage, hashes, proof of work and difficulty steps
    pub fn is_valid_chain(chain: &[Block]) -> bool {
        Self::check_chain(chain).is_ok()
    }

    /// [`Blockchain::is_valid_chain`] with the reason of the first failure
    pub fn check_chain(chain: &[Block]) -> Result<(), ChainError> {
        match chain.first() {
            Some(first) if *first == Block::genesis() => {}
            _ => return Err(ChainError::InvalidGenesis),
        }

        for (index, pair) in chain.windows(2).enumerate() {
            Self::check_link(&pair[0], &pair[1], index + 1)?;
        }

        Ok(())
    }

    fn check_link(previous: &Block, block: &Block, index: usize) -> Result<(), ChainError> {
        if block.last_hash != previous.hash {
            return Err(ChainError::BrokenLink { index });
        }

        match block.calculate_hash() {
            Ok(hash) if hash == block.hash => {}
            _ => return Err(ChainError::HashMismatch { index }),
        }

        if block.difficulty == 0 {
            return Err(ChainError::ZeroDifficulty { index });
        }

        if !meets_difficulty(&block.hash, block.difficulty) {
            return Err(ChainError::InsufficientWork {
                index,
                difficulty: block.difficulty,
            });
        }

        if previous.difficulty.abs_diff(block.difficulty) > 1 {
            return Err(ChainError::DifficultyJump {
                index,
                from: previous.difficulty,
                to: block.difficulty,
            });
        }

        Ok(())
    }

    /// Checks every transaction of every block after genesis
    pub fn valid_transaction_data(chain: &[Block]) -> bool {
        Self::check_transaction_data(chain).is_ok()
    }

    /// [`Blockchain::valid_transaction_data`] with the reason of the first failure
    ///
    /// Per block: at most one reward, shaped as a single [`MINING_REWARD`]
    /// output; every other transaction verifies, claims no more than the
    /// sender's balance replayed from the blocks before it, and is the only
    /// one from its sender; no id appears twice.
    pub fn check_transaction_data(chain: &[Block]) -> Result<(), ChainError> {
        for (index, block) in chain.iter().enumerate().skip(1) {
            let mut rewards = 0;
            let mut ids = HashSet::new();
            let mut senders = HashSet::new();

            for transaction in &block.data {
                match &transaction.input {
                    TransactionInput::Reward => {
                        rewards += 1;
                        if rewards > 1 {
                            return Err(ChainError::MultipleRewards { index });
                        }

                        let well_formed = transaction.output_map.len() == 1
                            && transaction.output_map.values().all(|v| *v == MINING_REWARD);
                        if !well_formed {
                            return Err(ChainError::InvalidReward {
                                index,
                                id: transaction.id.clone(),
                            });
                        }
                    }
                    TransactionInput::Regular(input) => {
                        transaction
                            .verify()
                            .map_err(|source| ChainError::InvalidTransaction { index, source })?;

                        let balance = Wallet::calculate_balance(&chain[..index], &input.address);
                        if input.amount > balance {
                            return Err(ChainError::InvalidInputAmount {
                                index,
                                address: input.address.clone(),
                                claimed: input.amount,
                                balance,
                            });
                        }

                        if !senders.insert(&input.address) {
                            return Err(ChainError::DuplicateSender {
                                index,
                                address: input.address.clone(),
                            });
                        }
                    }
                }

                if !ids.insert(&transaction.id) {
                    return Err(ChainError::DuplicateTransaction {
                        index,
                        id: transaction.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::SignedInput;
    use crate::blockchain::transaction::OutputMap;
    use crate::blockchain::STARTING_BALANCE;
    use chrono::Utc;
    use log::Level;

    fn payment(wallet: &mut Wallet, amount: u64, blockchain: &Blockchain) -> Transaction {
        wallet
            .create_transaction(Address::from("foo-recipient"), amount, Some(blockchain.chain()))
            .unwrap()
    }

    #[test]
    fn test_new_blockchain() {
        let blockchain = Blockchain::new();

        assert_eq!(blockchain.len(), 1);
        assert_eq!(blockchain.chain()[0], Block::genesis());
    }

    #[test]
    fn test_add_block() {
        let mut blockchain = Blockchain::new();
        let reward = Transaction::reward(&Address::from("miner"));

        blockchain.add_block(vec![reward.clone()]).unwrap();

        assert_eq!(blockchain.len(), 2);
        assert_eq!(blockchain.last_block().data, vec![reward]);
        assert!(Blockchain::is_valid_chain(blockchain.chain()));
    }

    #[test]
    fn test_invalid_genesis() {
        let mut blockchain = Blockchain::new();
        blockchain.chain[0].hash = "fake-genesis".to_string();

        assert!(!Blockchain::is_valid_chain(blockchain.chain()));
        assert!(matches!(
            Blockchain::check_chain(blockchain.chain()),
            Err(ChainError::InvalidGenesis)
        ));
        assert!(!Blockchain::is_valid_chain(&[]));
    }

    fn blockchain_with_blocks() -> Blockchain {
        let mut blockchain = Blockchain::new();
        for miner in ["Bears", "Beets", "Battlestar Galactica"] {
            blockchain
                .add_block(vec![Transaction::reward(&Address::from(miner))])
                .unwrap();
        }
        blockchain
    }

    #[test]
    fn test_untouched_chain_is_valid() {
        let blockchain = blockchain_with_blocks();
        assert!(Blockchain::is_valid_chain(blockchain.chain()));
    }

    #[test]
    fn test_changed_last_hash_is_invalid() {
        let mut blockchain = blockchain_with_blocks();
        blockchain.chain[2].last_hash = "broken-lastHash".to_string();

        assert!(matches!(
            Blockchain::check_chain(blockchain.chain()),
            Err(ChainError::BrokenLink { index: 2 })
        ));
    }

    #[test]
    fn test_changed_data_is_invalid() {
        let mut blockchain = blockchain_with_blocks();
        blockchain.chain[2].data = vec![Transaction::reward(&Address::from("broken-data"))];

        assert!(matches!(
            Blockchain::check_chain(blockchain.chain()),
            Err(ChainError::HashMismatch { index: 2 })
        ));
    }

    /// Re-mines a block with a fixed difficulty, bypassing retargeting
    fn forge(last_block: &Block, difficulty: u32) -> Block {
        let mut block = Block {
            timestamp: last_block.timestamp + 1,
            last_hash: last_block.hash.clone(),
            hash: String::new(),
            data: Vec::new(),
            nonce: 0,
            difficulty,
        };
        loop {
            block.hash = block.calculate_hash().unwrap();
            if meets_difficulty(&block.hash, difficulty) {
                return block;
            }
            block.nonce += 1;
        }
    }

    #[test]
    fn test_jumped_difficulty_is_invalid() {
        let mut blockchain = blockchain_with_blocks();
        let last = blockchain.last_block().clone();
        let jumped = forge(&last, last.difficulty + 3);
        blockchain.chain.push(jumped);

        assert!(matches!(
            Blockchain::check_chain(blockchain.chain()),
            Err(ChainError::DifficultyJump { index: 4, .. })
        ));
    }

    fn descending_chain(difficulties: &[u32]) -> Vec<Block> {
        let mut chain = vec![Block::genesis()];
        for difficulty in difficulties {
            let next = forge(&chain[chain.len() - 1], *difficulty);
            chain.push(next);
        }
        chain
    }

    #[test]
    fn test_zero_difficulty_is_invalid() {
        let chain = descending_chain(&[2, 1, 0, 0, 0]);

        assert!(matches!(
            Blockchain::check_chain(&chain),
            Err(ChainError::ZeroDifficulty { index: 3 })
        ));

        let mut blockchain = Blockchain::new();
        assert!(blockchain.replace_chain(chain).is_err());
        assert_eq!(blockchain.len(), 1);
    }

    #[test]
    fn test_append_mined_rejects_zero_difficulty() {
        let mut blockchain = Blockchain::from_blocks(descending_chain(&[2, 1])).unwrap();
        let free = forge(blockchain.last_block(), 0);

        assert!(matches!(
            blockchain.append_mined(free),
            Err(ChainError::ZeroDifficulty { index: 3 })
        ));
        assert_eq!(blockchain.len(), 3);
    }

    #[test]
    fn test_missing_work_is_invalid() {
        let mut blockchain = blockchain_with_blocks();
        let last = blockchain.last_block().clone();
        let mut lazy = forge(&last, 1);

        // claim more work than was done, keeping the hash honest
        lazy.difficulty = 64;
        lazy.hash = lazy.calculate_hash().unwrap();
        blockchain.chain.push(lazy);

        assert!(!Blockchain::is_valid_chain(blockchain.chain()));
    }

    /// Records log output of the current thread
    mod log_capture {
        use log::{Level, LevelFilter, Log, Metadata, Record};
        use std::cell::RefCell;
        use std::sync::Once;

        thread_local! {
            static RECORDS: RefCell<Vec<(Level, String)>> = RefCell::new(Vec::new());
        }

        struct CaptureLogger;

        impl Log for CaptureLogger {
            fn enabled(&self, _: &Metadata) -> bool {
                true
            }

            fn log(&self, record: &Record) {
                RECORDS.with(|records| {
                    records
                        .borrow_mut()
                        .push((record.level(), record.args().to_string()))
                });
            }

            fn flush(&self) {}
        }

        static LOGGER: CaptureLogger = CaptureLogger;
        static INIT: Once = Once::new();

        pub fn start() {
            INIT.call_once(|| {
                let _ = log::set_logger(&LOGGER);
                log::set_max_level(LevelFilter::Trace);
            });
            RECORDS.with(|records| records.borrow_mut().clear());
        }

        pub fn logged(level: Level, needle: &str) -> bool {
            RECORDS.with(|records| {
                records
                    .borrow()
                    .iter()
                    .any(|(l, message)| *l == level && message.contains(needle))
            })
        }
    }

    #[test]
    fn test_replace_with_shorter_chain_keeps_original() {
        log_capture::start();
        let mut blockchain = blockchain_with_blocks();
        let original = blockchain.chain().to_vec();

        let mut candidate = Blockchain::new();
        candidate.chain[0].data = vec![Transaction::reward(&Address::from("new"))];

        let result = blockchain.replace_chain(candidate.chain().to_vec());

        assert!(matches!(result, Err(ChainError::NotLonger { .. })));
        assert_eq!(blockchain.chain(), original.as_slice());
        assert!(log_capture::logged(Level::Error, "must be longer"));
    }

    #[test]
    fn test_replace_with_equal_length_keeps_original() {
        log_capture::start();
        let mut blockchain = Blockchain::new();
        blockchain.add_block(Vec::new()).unwrap();
        let original = blockchain.chain().to_vec();

        let mut candidate = Blockchain::new();
        candidate.add_block(Vec::new()).unwrap();

        assert!(blockchain.replace_chain(candidate.chain().to_vec()).is_err());
        assert_eq!(blockchain.chain(), original.as_slice());
        assert!(log_capture::logged(Level::Error, "must be longer"));
    }

    fn longer_chain() -> Blockchain {
        let mut candidate = Blockchain::new();
        let mut wallet = Wallet::new();
        for amount in [50, 60, 70] {
            let transaction = payment(&mut wallet, amount, &candidate);
            candidate.add_block(vec![transaction]).unwrap();
        }
        candidate
    }

    #[test]
    fn test_replace_with_longer_invalid_chain_keeps_original() {
        log_capture::start();
        let mut blockchain = Blockchain::new();
        let original = blockchain.chain().to_vec();

        let mut candidate = longer_chain();
        candidate.chain[2].hash = "broken-hash".to_string();

        assert!(blockchain.replace_chain(candidate.chain().to_vec()).is_err());
        assert_eq!(blockchain.chain(), original.as_slice());
        assert!(log_capture::logged(Level::Error, "must be valid"));
        assert!(!log_capture::logged(Level::Info, "Replacing chain"));
    }

    #[test]
    fn test_replace_with_longer_valid_chain() {
        log_capture::start();
        let mut blockchain = Blockchain::new();
        let candidate = longer_chain();

        blockchain.replace_chain(candidate.chain().to_vec()).unwrap();
        assert_eq!(blockchain.chain(), candidate.chain());
        assert!(log_capture::logged(Level::Info, "Replacing chain of 1 blocks with 4 blocks"));
    }

    #[test]
    fn test_replace_rejects_bad_transaction_data() {
        let mut blockchain = Blockchain::new();
        let mut candidate = Blockchain::new();
        let miner = Address::from("miner");

        candidate
            .add_block(vec![Transaction::reward(&miner), Transaction::reward(&miner)])
            .unwrap();
        candidate.add_block(Vec::new()).unwrap();

        assert!(matches!(
            blockchain.replace_chain(candidate.chain().to_vec()),
            Err(ChainError::MultipleRewards { index: 1 })
        ));
        assert_eq!(blockchain.len(), 1);
    }

    #[test]
    fn test_append_mined_rejects_stale_tip() {
        let mut blockchain = Blockchain::new();
        let stale = Block::mine(blockchain.last_block(), Vec::new()).unwrap();
        blockchain.add_block(Vec::new()).unwrap();

        assert!(matches!(
            blockchain.append_mined(stale),
            Err(ChainError::StaleTip { .. })
        ));
        assert_eq!(blockchain.len(), 2);

        let fresh = Block::mine(blockchain.last_block(), Vec::new()).unwrap();
        blockchain.append_mined(fresh).unwrap();
        assert_eq!(blockchain.len(), 3);
    }

    #[test]
    fn test_from_blocks() {
        let candidate = longer_chain();
        let restored = Blockchain::from_blocks(candidate.chain().to_vec()).unwrap();
        assert_eq!(restored.chain(), candidate.chain());

        let mut broken = candidate.chain().to_vec();
        broken[1].last_hash = "elsewhere".to_string();
        assert!(Blockchain::from_blocks(broken).is_err());
    }

    mod transaction_data {
        use super::*;

        struct Fixture {
            new_chain: Blockchain,
            wallet: Wallet,
            transaction: Transaction,
            reward: Transaction,
        }

        fn fixture() -> Fixture {
            let new_chain = Blockchain::new();
            let mut wallet = Wallet::new();
            let transaction = payment(&mut wallet, 65, &new_chain);
            let reward = Transaction::reward(wallet.address());

            Fixture {
                new_chain,
                wallet,
                transaction,
                reward,
            }
        }

        #[test]
        fn test_valid_data() {
            let mut f = fixture();
            f.new_chain.add_block(vec![f.transaction, f.reward]).unwrap();

            assert!(Blockchain::valid_transaction_data(f.new_chain.chain()));
        }

        #[test]
        fn test_multiple_rewards() {
            let mut f = fixture();
            let second = Transaction::reward(f.wallet.address());
            f.new_chain
                .add_block(vec![f.transaction, f.reward, second])
                .unwrap();

            assert!(matches!(
                Blockchain::check_transaction_data(f.new_chain.chain()),
                Err(ChainError::MultipleRewards { index: 1 })
            ));
        }

        #[test]
        fn test_same_reward_twice() {
            let mut f = fixture();
            f.new_chain
                .add_block(vec![f.transaction, f.reward.clone(), f.reward])
                .unwrap();

            assert!(!Blockchain::valid_transaction_data(f.new_chain.chain()));
        }

        #[test]
        fn test_malformed_output_map() {
            let mut f = fixture();
            f.transaction
                .output_map
                .insert(f.wallet.address().clone(), 999_999);
            f.new_chain.add_block(vec![f.transaction, f.reward]).unwrap();

            assert!(matches!(
                Blockchain::check_transaction_data(f.new_chain.chain()),
                Err(ChainError::InvalidTransaction { index: 1, .. })
            ));
        }

        #[test]
        fn test_malformed_reward() {
            let mut f = fixture();
            f.reward
                .output_map
                .insert(f.wallet.address().clone(), 999_999);
            f.new_chain.add_block(vec![f.transaction, f.reward]).unwrap();

            assert!(matches!(
                Blockchain::check_transaction_data(f.new_chain.chain()),
                Err(ChainError::InvalidReward { index: 1, .. })
            ));
        }

        #[test]
        fn test_reward_with_extra_output() {
            let mut f = fixture();
            f.reward.output_map.insert(Address::from("accomplice"), MINING_REWARD);
            f.new_chain.add_block(vec![f.reward]).unwrap();

            assert!(!Blockchain::valid_transaction_data(f.new_chain.chain()));
        }

        #[test]
        fn test_malformed_input() {
            let mut f = fixture();
            let claimed = 9000;

            let mut evil_output_map = OutputMap::new();
            evil_output_map.insert(f.wallet.address().clone(), 8900);
            evil_output_map.insert(Address::from("foo-recipient"), 100);

            let evil = Transaction {
                id: "evil".to_string(),
                input: TransactionInput::Regular(SignedInput {
                    timestamp: Utc::now().timestamp_millis(),
                    amount: claimed,
                    address: f.wallet.address().clone(),
                    signature: f.wallet.sign(&evil_output_map).unwrap(),
                }),
                output_map: evil_output_map,
            };
            assert!(evil.verify().is_ok());

            f.new_chain.add_block(vec![evil]).unwrap();

            assert!(matches!(
                Blockchain::check_transaction_data(f.new_chain.chain()),
                Err(ChainError::InvalidInputAmount {
                    index: 1,
                    claimed: 9000,
                    balance: STARTING_BALANCE,
                    ..
                })
            ));
        }

        #[test]
        fn test_replayed_spend() {
            let mut f = fixture();
            f.new_chain.add_block(vec![f.transaction.clone()]).unwrap();
            assert!(Blockchain::valid_transaction_data(f.new_chain.chain()));

            // same signed spend again, against a balance that has since dropped
            let replay = Transaction {
                id: "replay".to_string(),
                ..f.transaction
            };
            f.new_chain.add_block(vec![replay]).unwrap();

            assert!(matches!(
                Blockchain::check_transaction_data(f.new_chain.chain()),
                Err(ChainError::InvalidInputAmount { index: 2, .. })
            ));
        }

        #[test]
        fn test_identical_transactions() {
            let mut f = fixture();
            f.new_chain
                .add_block(vec![f.transaction.clone(), f.transaction])
                .unwrap();

            assert!(!Blockchain::valid_transaction_data(f.new_chain.chain()));
        }

        #[test]
        fn test_duplicate_id() {
            let mut f = fixture();
            let mut other = Transaction::reward(&Address::from("miner"));
            other.id = f.transaction.id.clone();
            f.new_chain.add_block(vec![f.transaction, other]).unwrap();

            assert!(matches!(
                Blockchain::check_transaction_data(f.new_chain.chain()),
                Err(ChainError::DuplicateTransaction { index: 1, .. })
            ));
        }

        #[test]
        fn test_two_spends_from_one_sender() {
            let mut f = fixture();
            let second = payment(&mut f.wallet, 30, &Blockchain::new());
            f.new_chain
                .add_block(vec![f.transaction, second])
                .unwrap();

            assert!(matches!(
                Blockchain::check_transaction_data(f.new_chain.chain()),
                Err(ChainError::DuplicateSender { index: 1, .. })
            ));
        }
    }
}
