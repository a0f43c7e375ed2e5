use chrono::Utc;
use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use std::collections::BTreeMap;

use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature};
use super::wallet::Wallet;
use super::MINING_REWARD;

/// Recipient address to amount
pub type OutputMap = BTreeMap<Address, u64>;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid signature from {0}")]
    InvalidSignature(Address),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Outputs of transaction from {address} sum to {outputs}, input declares {input}")]
    ConservationMismatch {
        address: Address,
        input: u64,
        outputs: u128,
    },

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Invalid recipient address: {0}")]
    InvalidRecipientAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Reward transactions are minted by miners, not signed")]
    UnexpectedReward,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// The signer's snapshot of its balance, plus the signature over the output map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedInput {
    pub timestamp: i64,
    pub amount: u64,
    pub address: Address,
    pub signature: DigitalSignature,
}

/// Where the value of a transaction comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionInput {
    /// Spent from the signer's balance
    Regular(SignedInput),
    /// Minted for the miner of the enclosing block
    Reward,
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique identifier for the transaction
    pub id: String,

    /// Signed balance snapshot, or the reward marker
    #[schema(value_type = Object)]
    pub input: TransactionInput,

    /// Amount credited to each address, including the signer's change
    #[schema(value_type = Object)]
    pub output_map: OutputMap,
}

impl Transaction {
    /// Creates a signed transaction from `sender`'s current balance
    ///
    /// # Arguments
    ///
    /// * `sender` - The wallet paying, its cached balance is the input amount
    /// * `recipient` - The address of the recipient
    /// * `amount` - The amount to transfer
    pub fn new(sender: &Wallet, recipient: Address, amount: u64) -> Result<Self, TransactionError> {
        let balance = sender.balance();
        if amount > balance {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: balance,
            });
        }
        Self::check_payment(sender.address(), &recipient, amount)?;

        let mut output_map = OutputMap::new();
        output_map.insert(recipient, amount);
        output_map.insert(sender.address().clone(), balance - amount);

        let input = SignedInput {
            timestamp: Utc::now().timestamp_millis(),
            amount: balance,
            address: sender.address().clone(),
            signature: sender.sign(&output_map)?,
        };

        Ok(Transaction {
            id: Uuid::new_v4().to_string(),
            input: TransactionInput::Regular(input),
            output_map,
        })
    }

    /// Creates a reward transaction paying [`MINING_REWARD`] to the miner
    pub fn reward(miner: &Address) -> Self {
        let mut output_map = OutputMap::new();
        output_map.insert(miner.clone(), MINING_REWARD);

        Transaction {
            id: Uuid::new_v4().to_string(),
            input: TransactionInput::Reward,
            output_map,
        }
    }

    /// Adds another payment to an unconfirmed transaction
    ///
    /// The amount is taken out of the sender's remaining change. The input keeps
    /// its original timestamp and balance snapshot, only the signature is
    /// refreshed.
    pub fn update(
        &mut self,
        sender: &Wallet,
        recipient: Address,
        amount: u64,
    ) -> Result<(), TransactionError> {
        let input = match &mut self.input {
            TransactionInput::Regular(input) => input,
            TransactionInput::Reward => return Err(TransactionError::UnexpectedReward),
        };
        if &input.address != sender.address() {
            return Err(TransactionError::InvalidSenderAddress(
                "Wallet address does not match the transaction signer".to_string(),
            ));
        }
        Self::check_payment(sender.address(), &recipient, amount)?;

        let remaining = self.output_map.get(sender.address()).copied().unwrap_or(0);
        if amount > remaining {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: remaining,
            });
        }

        *self.output_map.entry(recipient).or_insert(0) += amount;
        self.output_map
            .insert(sender.address().clone(), remaining - amount);
        input.signature = sender.sign(&self.output_map)?;

        Ok(())
    }

    fn check_payment(sender: &Address, recipient: &Address, amount: u64) -> Result<(), TransactionError> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }
        if recipient == sender {
            return Err(TransactionError::InvalidRecipientAddress(
                "Recipient must differ from the sender".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks conservation and the signature, returning the reason on failure
    ///
    /// Reward transactions pass, their shape is checked per block by the chain.
    pub fn verify(&self) -> Result<(), TransactionError> {
        let input = match &self.input {
            TransactionInput::Regular(input) => input,
            TransactionInput::Reward => return Ok(()),
        };

        let outputs: u128 = self.output_map.values().map(|v| *v as u128).sum();
        if outputs != input.amount as u128 {
            return Err(TransactionError::ConservationMismatch {
                address: input.address.clone(),
                input: input.amount,
                outputs,
            });
        }

        match verify_signature(&input.address, &self.output_map, &input.signature) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(TransactionError::InvalidSignature(input.address.clone())),
        }
    }

    /// Same as [`Transaction::verify`], logging the reason of a rejection
    pub fn is_valid(&self) -> bool {
        match self.verify() {
            Ok(()) => true,
            Err(err) => {
                error!("Invalid transaction {}: {}", self.id, err);
                false
            }
        }
    }

    /// Checks if the transaction is a mining reward
    pub fn is_reward(&self) -> bool {
        matches!(self.input, TransactionInput::Reward)
    }

    /// The signer's address, `None` for rewards
    pub fn sender(&self) -> Option<&Address> {
        match &self.input {
            TransactionInput::Regular(input) => Some(&input.address),
            TransactionInput::Reward => None,
        }
    }

    /// The signer's declared balance, `None` for rewards
    pub fn input_amount(&self) -> Option<u64> {
        match &self.input {
            TransactionInput::Regular(input) => Some(input.amount),
            TransactionInput::Reward => None,
        }
    }
}
