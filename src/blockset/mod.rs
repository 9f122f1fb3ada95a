//! Blockset Module
//!
//! A blockset maps one inode's logical block indices onto blocks held in a
//! [`BlockStore`]. It is composed of a chain of layers, outermost first, each
//! owning exactly one inner layer and ending in a single terminal layer:
//!
//! - [`BaseLayer`]: terminal; maps block index to block identifier
//! - [`IntegrityLayer`]: records and verifies a CRC32 per block index
//! - [`ReplicationLayer`]: fans writes out to several placements and repairs
//!   failed placements on read
//!
//! Every layer implements [`BlockLayer`]. Callers use the composed
//! [`Blockset`] handle, which serializes same-index writes and gives the wire
//! serializer a consistent view of the whole chain.

pub mod base;
pub mod builder;
pub mod integrity;
pub mod replication;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::block_store::{BlockId, StoreError};
use crate::context::{Interrupted, OpContext};
use crate::inode::{BlockIndex, InodeRef};
use crate::layer_spec::{BlockLayerSpec, LayerDescriptor, LayerKind, SpecError};
use crate::wire::WireError;

pub use base::{BaseLayer, BlockEntry};
pub use builder::build_layers;
pub use integrity::IntegrityLayer;
pub use replication::{PlacementState, ReplicationLayer};

/// Number of lock stripes used to serialize operations on the same index
const INDEX_LOCK_STRIPES: usize = 64;

/// Errors raised by blockset operations
#[derive(Error, Debug)]
pub enum BlocksetError {
    #[error("Block {index} not found ({layer} layer)")]
    NotFound { index: BlockIndex, layer: LayerKind },

    #[error("Checksum mismatch for block {index} ({layer} layer): expected {expected:08x}, calculated {calculated:08x}")]
    Integrity {
        index: BlockIndex,
        layer: LayerKind,
        expected: u32,
        calculated: u32,
    },

    #[error("Block {index} has data but no recorded checksum ({layer} layer)")]
    MissingChecksum { index: BlockIndex, layer: LayerKind },

    #[error("I/O error on block {index} ({layer} layer): {source}")]
    Io {
        index: BlockIndex,
        layer: LayerKind,
        #[source]
        source: StoreError,
    },

    #[error("Quorum not met for block {index}: {succeeded} of {required} required placements written")]
    QuorumNotMet {
        index: BlockIndex,
        succeeded: usize,
        required: usize,
    },

    #[error("All {attempted} placements failed for block {index}: {last}")]
    AllReplicasFailed {
        index: BlockIndex,
        attempted: usize,
        #[source]
        last: Box<BlocksetError>,
    },

    #[error("Operation on block {index} cancelled ({layer} layer)")]
    Cancelled { index: BlockIndex, layer: LayerKind },

    #[error("Operation on block {index} timed out after {timeout:?} ({layer} layer)")]
    Timeout {
        index: BlockIndex,
        layer: LayerKind,
        timeout: Duration,
    },

    #[error("Block index {index} is out of range for the {layer} layer")]
    IndexOutOfRange { index: BlockIndex, layer: LayerKind },

    #[error("Decode error: {0}")]
    Decode(#[from] WireError),

    #[error("Invalid layer spec: {0}")]
    Spec(#[from] SpecError),
}

impl BlocksetError {
    /// Map an interrupted delegated call to `Cancelled` or `Timeout`
    pub fn interrupted(index: BlockIndex, layer: LayerKind, reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => BlocksetError::Cancelled { index, layer },
            Interrupted::TimedOut(timeout) => BlocksetError::Timeout {
                index,
                layer,
                timeout,
            },
        }
    }

    /// Map a block store failure for a mapped block
    pub fn store(index: BlockIndex, layer: LayerKind, err: StoreError) -> Self {
        match err {
            StoreError::Interrupted(reason) => Self::interrupted(index, layer, reason),
            source => BlocksetError::Io {
                index,
                layer,
                source,
            },
        }
    }

    /// True for failures a caller may retry with the same arguments
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlocksetError::Io { .. }
                | BlocksetError::QuorumNotMet { .. }
                | BlocksetError::AllReplicasFailed { .. }
                | BlocksetError::Cancelled { .. }
                | BlocksetError::Timeout { .. }
        )
    }

    /// True when stored data or checksum metadata is inconsistent
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            BlocksetError::Integrity { .. } | BlocksetError::MissingChecksum { .. }
        )
    }

    /// True when a failed put still replaced the data some reads return
    pub fn is_partial_write(&self) -> bool {
        matches!(self, BlocksetError::QuorumNotMet { succeeded, .. } if *succeeded > 0)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlocksetError::NotFound { .. })
    }

    /// True when the caller's context ended the operation
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            BlocksetError::Cancelled { .. } | BlocksetError::Timeout { .. }
        )
    }
}

/// Result type for blockset operations
pub type BlocksetResult<T> = Result<T, BlocksetError>;

/// Contract shared by every layer of a blockset.
///
/// Layers assume the caller serializes operations on the same index, which
/// the [`Blockset`] handle does. Operations on distinct indices may run
/// concurrently.
#[async_trait]
pub trait BlockLayer: Send + Sync + fmt::Debug {
    /// Type tag of this layer
    fn kind(&self) -> LayerKind;

    /// Descriptor that rebuilds a layer with the same parameters
    fn descriptor(&self) -> LayerDescriptor;

    /// The wrapped layer, `None` for the terminal layer
    fn inner(&self) -> Option<&dyn BlockLayer>;

    /// Return the bytes most recently written at `index`
    async fn get_block(&self, ctx: &OpContext, index: BlockIndex) -> BlocksetResult<Vec<u8>>;

    /// Write or overwrite the bytes at `index`, attributed to `writer`
    async fn put_block(
        &self,
        ctx: &OpContext,
        writer: InodeRef,
        index: BlockIndex,
        data: &[u8],
    ) -> BlocksetResult<()>;

    /// Indices with live content, ascending
    fn indices(&self) -> Vec<BlockIndex>;

    /// Number of indices with live content
    fn len(&self) -> usize {
        self.indices().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logically remove every index `>= len`
    fn truncate(&self, len: BlockIndex);

    /// Inode generations that wrote a currently mapped block
    fn live_inodes(&self) -> BTreeSet<InodeRef>;

    /// Every block identifier referenced by this layer chain
    fn block_ids(&self) -> Vec<BlockId>;

    /// Encode this layer's own state; the inner layer is encoded separately
    fn marshal_state(&self) -> Vec<u8>;
}

/// A live, composed layer stack bound to one inode's block index space
pub struct Blockset {
    root: Box<dyn BlockLayer>,
    barrier: RwLock<()>,
    index_locks: Vec<RwLock<()>>,
    /// Reads can write back through a replication layer
    repairs_on_read: bool,
}

impl fmt::Debug for Blockset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blockset")
            .field("spec", &self.spec().to_string())
            .field("root", &self.root)
            .finish()
    }
}

impl Blockset {
    /// Wrap a fully composed layer chain
    pub fn from_root(root: Box<dyn BlockLayer>) -> Self {
        let index_locks = (0..INDEX_LOCK_STRIPES).map(|_| RwLock::new(())).collect();
        let mut blockset = Self {
            root,
            barrier: RwLock::new(()),
            index_locks,
            repairs_on_read: false,
        };
        blockset.repairs_on_read = blockset
            .layers()
            .iter()
            .any(|layer| layer.kind() == LayerKind::Replication);
        blockset
    }

    pub fn root(&self) -> &dyn BlockLayer {
        self.root.as_ref()
    }

    /// The layer chain, outermost first
    pub fn layers(&self) -> Vec<&dyn BlockLayer> {
        let mut layers = Vec::new();
        let mut current = Some(self.root.as_ref());
        while let Some(layer) = current {
            layers.push(layer);
            current = layer.inner();
        }
        layers
    }

    /// Spec describing this stack; equal to the spec it was built from
    pub fn spec(&self) -> BlockLayerSpec {
        BlockLayerSpec::from_live_stack(self.layers().iter().map(|l| l.descriptor()).collect())
    }

    fn index_lock(&self, index: BlockIndex) -> &RwLock<()> {
        &self.index_locks[(index % INDEX_LOCK_STRIPES as u64) as usize]
    }

    /// Read the bytes at `index`
    pub async fn get_block(&self, ctx: &OpContext, index: BlockIndex) -> BlocksetResult<Vec<u8>> {
        let layer = self.root.kind();
        // Reads may repair replicas, so they also hold the barrier shared
        let _barrier = ctx
            .run(self.barrier.read())
            .await
            .map_err(|e| BlocksetError::interrupted(index, layer, e))?;

        // Read-repair writes to the index; hold it exclusively
        if self.repairs_on_read {
            let _index = ctx
                .run(self.index_lock(index).write())
                .await
                .map_err(|e| BlocksetError::interrupted(index, layer, e))?;
            self.root.get_block(ctx, index).await
        } else {
            let _index = ctx
                .run(self.index_lock(index).read())
                .await
                .map_err(|e| BlocksetError::interrupted(index, layer, e))?;
            self.root.get_block(ctx, index).await
        }
    }

    /// Write `data` at `index`, attributed to `writer`
    pub async fn put_block(
        &self,
        ctx: &OpContext,
        writer: InodeRef,
        index: BlockIndex,
        data: &[u8],
    ) -> BlocksetResult<()> {
        let layer = self.root.kind();
        let _barrier = ctx
            .run(self.barrier.read())
            .await
            .map_err(|e| BlocksetError::interrupted(index, layer, e))?;
        let _index = ctx
            .run(self.index_lock(index).write())
            .await
            .map_err(|e| BlocksetError::interrupted(index, layer, e))?;

        debug!("Put block {} ({} bytes) for {}", index, data.len(), writer);
        self.root.put_block(ctx, writer, index, data).await
    }

    pub fn indices(&self) -> Vec<BlockIndex> {
        self.root.indices()
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Remove every index `>= len`. Released blocks are left for external GC.
    pub async fn truncate(&self, len: BlockIndex) {
        let _barrier = self.barrier.write().await;
        debug!("Truncating blockset to {} blocks", len);
        self.root.truncate(len);
    }

    pub fn live_inodes(&self) -> BTreeSet<InodeRef> {
        self.root.live_inodes()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.root.block_ids()
    }

    /// Run `f` over the layer chain with every mutation excluded
    pub(crate) async fn with_consistent_view<R>(&self, f: impl FnOnce(&dyn BlockLayer) -> R) -> R {
        let _barrier = self.barrier.write().await;
        f(self.root.as_ref())
    }
}
