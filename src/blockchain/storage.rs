use std::path::Path;

use log::warn;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Sled-backed copy of the local chain
///
/// Blocks are keyed by their big-endian index so iteration yields them in
/// chain order.
pub struct ChainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl std::fmt::Debug for ChainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStorage").finish()
    }
}

impl ChainStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            metadata,
        })
    }

    /// Saves the block at position `index` of the chain
    pub fn save_block(&self, index: u64, block: &Block) -> Result<(), StorageError> {
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.blocks.insert(index.to_be_bytes(), value)?;

        let height_bytes = bincode::serialize(&index)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.metadata.insert("block_height", height_bytes)?;

        Ok(())
    }

    /// Overwrites the stored chain with `chain`
    pub fn replace_chain(&self, chain: &[Block]) -> Result<(), StorageError> {
        self.blocks.clear()?;
        for (index, block) in chain.iter().enumerate() {
            self.save_block(index as u64, block)?;
        }
        self.flush()
    }

    /// Gets all blocks in chain order
    ///
    /// Stops at the first undecodable block: everything after it would no
    /// longer link.
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();

        for result in self.blocks.iter() {
            let (_, value) = result?;
            match bincode::deserialize::<Block>(&value) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    warn!(
                        "Failed to deserialize block {}, keeping the {} before it: {}",
                        blocks.len(),
                        blocks.len(),
                        e
                    );
                    break;
                }
            }
        }

        if blocks.is_empty() {
            return Err(StorageError::NotFound("No blocks found in storage".to_string()));
        }

        Ok(blocks)
    }

    /// Gets the index of the last saved block
    ///
    /// Compared against the blocks actually readable when a node loads.
    pub fn get_block_height(&self) -> Result<u64, StorageError> {
        if let Some(value) = self.metadata.get("block_height")? {
            let height: u64 = bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string()))?;

            Ok(height)
        } else {
            Ok(0)
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
