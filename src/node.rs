// Node module
//
// Owns the shared chain, pool and wallet of one process and coordinates
// mining with inbound chains, blocks and transactions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::blockchain::crypto::CryptoError;
use crate::blockchain::storage::{ChainStorage, StorageError};
use crate::blockchain::{
    Address, Block, Blockchain, ChainError, Transaction, TransactionError, TransactionPool, Wallet,
};

/// Blocks per page of [`Node::blocks_page`]
pub const BLOCKS_PER_PAGE: usize = 5;

/// Errors that can occur while the node handles a request
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Chain rejected: {0}")]
    Chain(#[from] ChainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Mining task failed: {0}")]
    Mining(String),
}

/// Outbound side of the peer network
pub trait Broadcaster: Send + Sync {
    /// Announces a block this node just mined
    fn broadcast_block(&self, block: &Block);

    /// Announces a transaction this node just signed
    fn broadcast_transaction(&self, transaction: &Transaction);
}

/// Broadcaster for a node without peers
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn broadcast_block(&self, block: &Block) {
        debug!("Broadcasting block {}", block.hash);
    }

    fn broadcast_transaction(&self, transaction: &Transaction) {
        debug!("Broadcasting transaction {}", transaction.id);
    }
}

/// Address and chain balance of the node wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WalletInfo {
    /// The wallet's address
    pub address: Address,

    /// Balance replayed from the local chain
    pub balance: u64,
}

/// Handle to a running node
///
/// Clones share the same state. Locks are always taken wallet first, then
/// chain.
#[derive(Clone)]
pub struct Node {
    blockchain: Arc<RwLock<Blockchain>>,
    pool: TransactionPool,
    wallet: Arc<Mutex<Wallet>>,
    broadcaster: Arc<dyn Broadcaster>,
    storage: Option<Arc<ChainStorage>>,
    /// Set to abandon the mining attempt in flight. Replaced after every
    /// change of the tip.
    cancel: Arc<Mutex<Arc<AtomicBool>>>,
}

impl Node {
    /// Creates an in-memory node starting from genesis
    pub fn new(wallet: Wallet, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self::from_parts(Blockchain::new(), wallet, broadcaster, None)
    }

    /// Creates a node backed by `storage`
    ///
    /// A stored chain is adopted only if it validates. Otherwise the node
    /// starts from genesis and overwrites what was stored.
    pub fn with_storage(
        wallet: Wallet,
        broadcaster: Arc<dyn Broadcaster>,
        storage: ChainStorage,
    ) -> Result<Self, NodeError> {
        let blockchain = match storage.get_all_blocks() {
            Ok(blocks) => {
                let loaded = blocks.len() as u64;
                let recorded = storage.get_block_height()? + 1;
                match Blockchain::from_blocks(blocks) {
                    Ok(blockchain) => {
                        info!("Loaded chain of {} blocks from storage", loaded);
                        if loaded != recorded {
                            warn!(
                                "Storage records {} blocks but holds {} readable ones, rewriting it",
                                recorded, loaded
                            );
                            storage.replace_chain(blockchain.chain())?;
                        }
                        blockchain
                    }
                    Err(err) => {
                        warn!("Stored chain is invalid, starting from genesis: {}", err);
                        Self::reset_storage(&storage)?
                    }
                }
            }
            Err(StorageError::NotFound(_)) => {
                info!("No stored chain, starting from genesis");
                Self::reset_storage(&storage)?
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self::from_parts(
            blockchain,
            wallet,
            broadcaster,
            Some(Arc::new(storage)),
        ))
    }

    fn reset_storage(storage: &ChainStorage) -> Result<Blockchain, StorageError> {
        let blockchain = Blockchain::new();
        storage.replace_chain(blockchain.chain())?;
        Ok(blockchain)
    }

    fn from_parts(
        blockchain: Blockchain,
        wallet: Wallet,
        broadcaster: Arc<dyn Broadcaster>,
        storage: Option<Arc<ChainStorage>>,
    ) -> Self {
        Node {
            blockchain: Arc::new(RwLock::new(blockchain)),
            pool: TransactionPool::new(),
            wallet: Arc::new(Mutex::new(wallet)),
            broadcaster,
            storage,
            cancel: Arc::new(Mutex::new(Arc::new(AtomicBool::new(false)))),
        }
    }

    /// Mines the valid pool contents plus a reward for the node wallet
    ///
    /// The proof of work runs on the blocking pool. When the tip moves while
    /// mining, the attempt is dropped and restarted on the new tip.
    pub async fn mine_transactions(&self) -> Result<Block, NodeError> {
        let miner = self.wallet.lock().address().clone();

        loop {
            let cancel = Arc::clone(&*self.cancel.lock());

            let (last_block, data) = {
                let blockchain = self.blockchain.read();
                let mut data = self.select_transactions(blockchain.chain());
                data.push(Transaction::reward(&miner));
                (blockchain.last_block().clone(), data)
            };

            let flag = Arc::clone(&cancel);
            let mined = tokio::task::spawn_blocking(move || {
                Block::mine_cancellable(&last_block, data, &flag)
            })
            .await
            .map_err(|e| NodeError::Mining(e.to_string()))??;

            let block = match mined {
                Some(block) => block,
                None => {
                    warn!("Chain changed while mining, restarting on the new tip");
                    continue;
                }
            };

            let reissued = {
                let mut wallet = self.wallet.lock();
                let mut blockchain = self.blockchain.write();
                match blockchain.append_mined(block.clone()) {
                    Ok(()) => {}
                    Err(err @ ChainError::StaleTip { .. }) => {
                        warn!("Discarding mined block: {}", err);
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }

                if let Some(storage) = &self.storage {
                    let index = (blockchain.len() - 1) as u64;
                    if let Err(err) = storage.save_block(index, &block) {
                        error!("Failed to persist block {}: {}", block.hash, err);
                    }
                }

                self.reconcile_pool(&mut wallet, blockchain.chain())
            };

            self.rotate_cancel();

            info!(
                "Mined block {} with {} transactions at difficulty {}",
                block.hash,
                block.data.len(),
                block.difficulty
            );
            self.broadcaster.broadcast_block(&block);
            if let Some(transaction) = reissued {
                self.broadcaster.broadcast_transaction(&transaction);
            }

            return Ok(block);
        }
    }

    /// Pool transactions that the chain can still pay for
    ///
    /// Keeps the oldest transaction per sender and drops any whose input
    /// exceeds the sender's balance on `chain`.
    fn select_transactions(&self, chain: &[Block]) -> Vec<Transaction> {
        let mut senders = HashSet::new();

        self.pool
            .valid_transactions()
            .into_iter()
            .filter(|transaction| {
                let (Some(sender), Some(amount)) =
                    (transaction.sender(), transaction.input_amount())
                else {
                    return false;
                };

                let balance = Wallet::calculate_balance(chain, sender);
                if amount > balance {
                    error!(
                        "Leaving transaction {} in the pool: input {} exceeds balance {}",
                        transaction.id, amount, balance
                    );
                    return false;
                }

                senders.insert(sender.clone())
            })
            .collect()
    }

    fn rotate_cancel(&self) {
        let mut cancel = self.cancel.lock();
        cancel.store(true, Ordering::Relaxed);
        *cancel = Arc::new(AtomicBool::new(false));
    }

    /// Adopts `candidate` if it is longer than the local chain and valid
    ///
    /// On success the mining attempt in flight is abandoned and the pool
    /// drops every transaction the new chain confirms.
    pub fn receive_chain(&self, candidate: Vec<Block>) -> Result<(), NodeError> {
        let reissued = {
            let mut wallet = self.wallet.lock();
            let mut blockchain = self.blockchain.write();
            blockchain.replace_chain(candidate)?;

            if let Some(storage) = &self.storage {
                if let Err(err) = storage.replace_chain(blockchain.chain()) {
                    error!("Failed to persist adopted chain: {}", err);
                }
            }

            self.reconcile_pool(&mut wallet, blockchain.chain())
        };

        self.rotate_cancel();
        if let Some(transaction) = reissued {
            self.broadcaster.broadcast_transaction(&transaction);
        }
        Ok(())
    }

    /// Drops the transactions `chain` confirms from the pool
    ///
    /// A pooled update of the node wallet's transaction that lost the race
    /// against its confirmed copy is paid again from the new balance. Returns
    /// the wallet's pooled transaction when anything was paid again.
    fn reconcile_pool(&self, wallet: &mut Wallet, chain: &[Block]) -> Option<Transaction> {
        let mut reissued = None;

        for pending in self.pool.clear_blockchain_transactions(chain) {
            if pending.sender() != Some(wallet.address()) {
                error!(
                    "Dropping transaction {}: a different version is confirmed",
                    pending.id
                );
                continue;
            }

            let confirmed = chain
                .iter()
                .flat_map(|block| block.data.iter())
                .find(|transaction| transaction.id == pending.id);

            for (recipient, amount) in unconfirmed_outputs(&pending, confirmed) {
                match self.pay(wallet, chain, recipient.clone(), amount) {
                    Ok(transaction) => reissued = Some(transaction),
                    Err(err) => error!(
                        "Failed to pay {} to {} again after its update missed the block: {}",
                        amount, recipient, err
                    ),
                }
            }
        }

        reissued
    }

    /// Adds a payment to the wallet's pooled transaction, or signs a new one
    /// against `chain`
    fn pay(
        &self,
        wallet: &mut Wallet,
        chain: &[Block],
        recipient: Address,
        amount: u64,
    ) -> Result<Transaction, NodeError> {
        let transaction = match self.pool.existing_transaction(wallet.address()) {
            Some(mut transaction) => {
                transaction.update(wallet, recipient, amount)?;
                transaction
            }
            None => wallet.create_transaction(recipient, amount, Some(chain))?,
        };

        self.pool.set_transaction(transaction.clone());
        Ok(transaction)
    }

    /// Validates `block` as the next block of the local chain
    pub fn receive_block(&self, block: Block) -> Result<(), NodeError> {
        let mut candidate = self.chain();
        candidate.push(block);
        self.receive_chain(candidate)
    }

    /// Adds a transaction announced by a peer to the pool
    pub fn receive_transaction(&self, transaction: Transaction) -> Result<(), NodeError> {
        let admitted = if transaction.is_reward() {
            Err(TransactionError::UnexpectedReward)
        } else {
            transaction.verify()
        };

        if let Err(err) = admitted {
            error!("Rejected transaction {}: {}", transaction.id, err);
            return Err(err.into());
        }

        self.pool.set_transaction(transaction);
        Ok(())
    }

    /// Pays `amount` to `recipient` from the node wallet
    ///
    /// Folds into the wallet's unconfirmed transaction when there is one.
    pub fn transact(&self, recipient: Address, amount: u64) -> Result<Transaction, NodeError> {
        let transaction = {
            let mut wallet = self.wallet.lock();
            let blockchain = self.blockchain.read();
            self.pay(&mut wallet, blockchain.chain(), recipient, amount)?
        };

        self.broadcaster.broadcast_transaction(&transaction);
        Ok(transaction)
    }

    /// Copy of the local chain, oldest first
    pub fn chain(&self) -> Vec<Block> {
        self.blockchain.read().chain().to_vec()
    }

    pub fn chain_len(&self) -> usize {
        self.blockchain.read().len()
    }

    /// Page `page` of the chain, newest first; page 1 holds the newest blocks
    pub fn blocks_page(&self, page: usize) -> Vec<Block> {
        if page == 0 {
            return Vec::new();
        }

        self.blockchain
            .read()
            .chain()
            .iter()
            .rev()
            .skip((page - 1).saturating_mul(BLOCKS_PER_PAGE))
            .take(BLOCKS_PER_PAGE)
            .cloned()
            .collect()
    }

    /// Copy of the pool, keyed by transaction id
    pub fn pool(&self) -> HashMap<String, Transaction> {
        self.pool.transaction_map()
    }

    pub fn wallet_info(&self) -> WalletInfo {
        let wallet = self.wallet.lock();
        let address = wallet.address().clone();
        let balance = self.balance_of(&address);

        WalletInfo { address, balance }
    }

    /// Balance of `address` replayed from the local chain
    pub fn balance_of(&self, address: &Address) -> u64 {
        Wallet::calculate_balance(self.blockchain.read().chain(), address)
    }

    /// Every address credited anywhere on the local chain
    pub fn known_addresses(&self) -> Vec<Address> {
        let blockchain = self.blockchain.read();
        let addresses: BTreeSet<&Address> = blockchain
            .chain()
            .iter()
            .flat_map(|block| block.data.iter())
            .flat_map(|transaction| transaction.output_map.keys())
            .collect();

        addresses.into_iter().cloned().collect()
    }
}

/// Outputs of `pending` to other addresses that `confirmed` does not pay
fn unconfirmed_outputs(
    pending: &Transaction,
    confirmed: Option<&Transaction>,
) -> Vec<(Address, u64)> {
    pending
        .output_map
        .iter()
        .filter(|(address, _)| Some(*address) != pending.sender())
        .filter_map(|(address, amount)| {
            let paid = confirmed
                .and_then(|transaction| transaction.output_map.get(address))
                .copied()
                .unwrap_or(0);
            amount
                .checked_sub(paid)
                .filter(|extra| *extra > 0)
                .map(|extra| (address.clone(), extra))
        })
        .collect()
}
