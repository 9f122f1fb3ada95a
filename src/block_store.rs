//! Block Store Module
//!
//! The block store is the leaf collaborator of every blockset: an opaque
//! key/value store of blocks addressed by [`BlockId`]. Only the base layer
//! talks to it directly. This module defines the contract and the in-memory
//! backend; the on-disk backend lives in [`crate::file_store`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{Interrupted, OpContext};

/// Opaque handle to a stored block, issued by the block store on `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Size of a block identifier in its binary encoding
    pub const ENCODED_LEN: usize = 16;

    /// Allocate a fresh, unique identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Errors that can occur during block store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Block not found: {id}")]
    NotFound { id: BlockId },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block {id} is corrupted: {reason}")]
    Corrupted { id: BlockId, reason: String },

    #[error("Block store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Result type for block store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Content store of fixed blocks keyed by an opaque identifier
#[async_trait]
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Backend name, as registered in the [`crate::registry::BlockStoreRegistry`]
    fn name(&self) -> &str;

    /// Store `data` as a new block and return its identifier
    async fn put(&self, ctx: &OpContext, data: &[u8]) -> StoreResult<BlockId>;

    /// Fetch the bytes of a block
    async fn get(&self, ctx: &OpContext, id: &BlockId) -> StoreResult<Vec<u8>>;

    /// Remove a block
    async fn delete(&self, ctx: &OpContext, id: &BlockId) -> StoreResult<()>;
}

/// In-memory block store.
///
/// Clones share the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<BlockId, Vec<u8>>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.read().contains_key(id)
    }

    /// Replace the stored bytes of an existing block in place, bypassing the
    /// normal write path. Returns false if the block does not exist.
    ///
    /// This is how media corruption is simulated.
    pub fn overwrite(&self, id: &BlockId, data: Vec<u8>) -> bool {
        match self.blocks.write().get_mut(id) {
            Some(slot) => {
                *slot = data;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, ctx: &OpContext, data: &[u8]) -> StoreResult<BlockId> {
        ctx.check()?;
        let id = BlockId::generate();
        self.blocks.write().insert(id, data.to_vec());
        Ok(id)
    }

    async fn get(&self, ctx: &OpContext, id: &BlockId) -> StoreResult<Vec<u8>> {
        ctx.check()?;
        self.blocks
            .read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound { id: *id })
    }

    async fn delete(&self, ctx: &OpContext, id: &BlockId) -> StoreResult<()> {
        ctx.check()?;
        match self.blocks.write().remove(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound { id: *id }),
        }
    }
}
