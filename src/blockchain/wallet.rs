use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;

use super::block::Block;
use super::crypto::{hash_of, Address, CryptoError, DigitalSignature};
use super::transaction::{Transaction, TransactionError};
use super::STARTING_BALANCE;

/// Represents a wallet with a keypair
///
/// The balance is a cache. It is refreshed from the chain whenever the wallet
/// builds a transaction against one.
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    address: Address,
    balance: u64,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Self::from_signing_key(signing_key)
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes_array)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = Address::from_public_key(&verifying_key);

        Wallet {
            signing_key,
            verifying_key,
            address,
            balance: STARTING_BALANCE,
        }
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Gets the wallet's public key
    pub fn public_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Balance as of the last refresh
    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// Signs the hash of `data` with the wallet's private key
    pub fn sign<T: Serialize + ?Sized>(&self, data: &T) -> Result<DigitalSignature, CryptoError> {
        let message = hash_of(data)?;
        let signature = self.signing_key.sign(message.as_bytes());
        Ok(DigitalSignature::from_signature(&signature))
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// Builds and signs a transaction paying `amount` to `recipient`
    ///
    /// When `chain` is given the balance is recomputed from it first.
    pub fn create_transaction(
        &mut self,
        recipient: Address,
        amount: u64,
        chain: Option<&[Block]>,
    ) -> Result<Transaction, TransactionError> {
        if let Some(chain) = chain {
            self.balance = Self::calculate_balance(chain, &self.address);
        }

        Transaction::new(self, recipient, amount)
    }

    /// Replays `chain` from oldest to newest and returns the balance of `address`
    ///
    /// A block in which `address` signed a transaction is a reset point: the
    /// balance becomes whatever that block credits to `address` (its change
    /// plus any other outputs in the same block). Credits in later blocks are
    /// added on top. An address that never spent starts from
    /// [`STARTING_BALANCE`].
    pub fn calculate_balance(chain: &[Block], address: &Address) -> u64 {
        let mut balance = STARTING_BALANCE;

        for block in chain.iter().skip(1) {
            let mut spent = false;
            let mut credited: u64 = 0;

            for transaction in &block.data {
                if transaction.sender() == Some(address) {
                    spent = true;
                }
                if let Some(amount) = transaction.output_map.get(address) {
                    credited = credited.saturating_add(*amount);
                }
            }

            balance = if spent {
                credited
            } else {
                balance.saturating_add(credited)
            };
        }

        balance
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}
