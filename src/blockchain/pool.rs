use dashmap::DashMap;
use log::error;

use std::collections::HashMap;
use std::sync::Arc;

use super::block::Block;
use super::crypto::Address;
use super::transaction::{Transaction, TransactionInput};

/// Signed transactions waiting to be mined, keyed by id
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    transaction_map: Arc<DashMap<String, Transaction>>,
}

impl TransactionPool {
    /// Creates an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `transaction`, replacing any entry with the same id
    pub fn set_transaction(&self, transaction: Transaction) {
        self.transaction_map
            .insert(transaction.id.clone(), transaction);
    }

    /// The unconfirmed transaction signed by `address`, if any
    pub fn existing_transaction(&self, address: &Address) -> Option<Transaction> {
        self.transaction_map
            .iter()
            .find(|entry| entry.value().sender() == Some(address))
            .map(|entry| entry.value().clone())
    }

    /// Pooled transactions that pass verification, oldest first
    ///
    /// Rejected entries stay in the map and are logged with the reason.
    pub fn valid_transactions(&self) -> Vec<Transaction> {
        let mut valid: Vec<Transaction> = self
            .transaction_map
            .iter()
            .filter_map(|entry| {
                let transaction = entry.value();
                if transaction.is_reward() {
                    error!(
                        "Skipping pooled reward transaction {}: rewards are minted by the miner",
                        transaction.id
                    );
                    return None;
                }
                match transaction.verify() {
                    Ok(()) => Some(transaction.clone()),
                    Err(err) => {
                        error!("Skipping invalid transaction {}: {}", transaction.id, err);
                        None
                    }
                }
            })
            .collect();

        valid.sort_by(|a, b| {
            signed_at(a)
                .cmp(&signed_at(b))
                .then_with(|| a.id.cmp(&b.id))
        });
        valid
    }

    /// Removes every transaction
    pub fn clear(&self) {
        self.transaction_map.clear();
    }

    /// Removes every transaction whose id is confirmed somewhere in `chain`
    ///
    /// Returns the removed entries that differ from their confirmed version,
    /// i.e. updates signed after the confirmed copy was taken.
    pub fn clear_blockchain_transactions(&self, chain: &[Block]) -> Vec<Transaction> {
        let mut confirmed: HashMap<&str, &Transaction> = HashMap::new();
        for transaction in chain.iter().flat_map(|block| block.data.iter()) {
            confirmed.entry(transaction.id.as_str()).or_insert(transaction);
        }

        let mut superseded = Vec::new();
        for (id, transaction) in confirmed {
            if let Some((_, pooled)) = self.transaction_map.remove(id) {
                if pooled != *transaction {
                    superseded.push(pooled);
                }
            }
        }
        superseded
    }

    /// Gets a transaction by id
    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.transaction_map.get(id).map(|entry| entry.value().clone())
    }

    /// Copies the pool out, keyed by id
    pub fn transaction_map(&self) -> HashMap<String, Transaction> {
        self.transaction_map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transaction_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transaction_map.is_empty()
    }
}

fn signed_at(transaction: &Transaction) -> i64 {
    match &transaction.input {
        TransactionInput::Regular(input) => input.timestamp,
        TransactionInput::Reward => 0,
    }
}
