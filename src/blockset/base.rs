//! Terminal layer: block index to block identifier mapping.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{BlockLayer, BlocksetError, BlocksetResult};
use crate::block_store::{BlockId, BlockStore};
use crate::context::OpContext;
use crate::inode::{BlockIndex, InodeRef};
use crate::layer_spec::{LayerDescriptor, LayerKind};
use crate::wire::{StateReader, WireResult};

/// Encoded size of one mapping entry: index, block id, inode, generation
const ENTRY_LEN: usize = 8 + BlockId::ENCODED_LEN + 8 + 8;

/// Where the bytes of one index live, and who wrote them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub id: BlockId,
    pub writer: InodeRef,
}

/// Leaf layer mapping each block index to a block in the bound store.
///
/// Overwrites replace the mapping in place. The block previously mapped at
/// that index is not deleted; releasing it is left to garbage collection
/// driven by [`BlockLayer::live_inodes`] and [`BlockLayer::block_ids`].
#[derive(Debug)]
pub struct BaseLayer {
    store: Arc<dyn BlockStore>,
    entries: RwLock<BTreeMap<BlockIndex, BlockEntry>>,
}

impl BaseLayer {
    /// Create an empty base layer bound to `store`
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Mapping entry for `index`, if the index is live
    pub fn entry(&self, index: BlockIndex) -> Option<BlockEntry> {
        self.entries.read().get(&index).copied()
    }

    /// Rebuild a base layer from its encoded mapping
    pub(crate) fn unmarshal_state(state: &[u8], store: Arc<dyn BlockStore>) -> WireResult<Self> {
        let mut reader = StateReader::new(LayerKind::Base, state);
        let count = reader.read_count(ENTRY_LEN)?;

        let mut entries = BTreeMap::new();
        let mut previous: Option<BlockIndex> = None;
        for _ in 0..count {
            let index = reader.read_u64()?;
            let id = reader.read_block_id()?;
            let writer = InodeRef::new(reader.read_u64()?, reader.read_u64()?);

            if previous.is_some_and(|p| p >= index) {
                return Err(reader.invalid(format!("block index {} out of order", index)));
            }
            previous = Some(index);
            entries.insert(index, BlockEntry { id, writer });
        }
        reader.finish()?;

        Ok(Self {
            store,
            entries: RwLock::new(entries),
        })
    }
}

#[async_trait]
impl BlockLayer for BaseLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Base
    }

    fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor::Base
    }

    fn inner(&self) -> Option<&dyn BlockLayer> {
        None
    }

    async fn get_block(&self, ctx: &OpContext, index: BlockIndex) -> BlocksetResult<Vec<u8>> {
        let entry = self.entry(index).ok_or(BlocksetError::NotFound {
            index,
            layer: LayerKind::Base,
        })?;

        ctx.run(self.store.get(ctx, &entry.id))
            .await
            .map_err(|e| BlocksetError::interrupted(index, LayerKind::Base, e))?
            .map_err(|e| BlocksetError::store(index, LayerKind::Base, e))
    }

    async fn put_block(
        &self,
        ctx: &OpContext,
        writer: InodeRef,
        index: BlockIndex,
        data: &[u8],
    ) -> BlocksetResult<()> {
        // Data first; the mapping only changes once the block is durable
        let id = ctx
            .run(self.store.put(ctx, data))
            .await
            .map_err(|e| BlocksetError::interrupted(index, LayerKind::Base, e))?
            .map_err(|e| BlocksetError::store(index, LayerKind::Base, e))?;

        let previous = self.entries.write().insert(index, BlockEntry { id, writer });
        match previous {
            Some(old) => debug!(
                "Block {} remapped {} -> {} by {}, {} orphaned",
                index, old.id, id, writer, old.id
            ),
            None => debug!("Block {} mapped to {} by {}", index, id, writer),
        }
        Ok(())
    }

    fn indices(&self) -> Vec<BlockIndex> {
        self.entries.read().keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn truncate(&self, len: BlockIndex) {
        let released = self.entries.write().split_off(&len);
        if !released.is_empty() {
            debug!("Truncated {} block mappings at index {}", released.len(), len);
        }
    }

    fn live_inodes(&self) -> BTreeSet<InodeRef> {
        self.entries.read().values().map(|e| e.writer).collect()
    }

    fn block_ids(&self) -> Vec<BlockId> {
        self.entries.read().values().map(|e| e.id).collect()
    }

    fn marshal_state(&self) -> Vec<u8> {
        let entries = self.entries.read();
        let mut buffer = Vec::with_capacity(8 + entries.len() * ENTRY_LEN);

        buffer.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for (index, entry) in entries.iter() {
            buffer.extend_from_slice(&index.to_le_bytes());
            buffer.extend_from_slice(entry.id.as_bytes());
            buffer.extend_from_slice(&entry.writer.inode.to_le_bytes());
            buffer.extend_from_slice(&entry.writer.generation.to_le_bytes());
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::MemoryBlockStore;

    fn create_layer() -> (BaseLayer, MemoryBlockStore) {
        let store = MemoryBlockStore::new();
        (BaseLayer::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let (layer, store) = create_layer();
        let ctx = OpContext::background();
        let writer = InodeRef::new(1, 1);

        layer.put_block(&ctx, writer, 0, b"Some data").await.unwrap();
        let first = layer.entry(0).unwrap();
        layer
            .put_block(&ctx, writer, 0, b"Some different data")
            .await
            .unwrap();

        assert_eq!(
            layer.get_block(&ctx, 0).await.unwrap(),
            b"Some different data"
        );
        // The old block is orphaned, not deleted
        assert!(store.contains(&first.id));
        assert_ne!(layer.entry(0).unwrap().id, first.id);
        assert_eq!(layer.len(), 1);
    }

    #[tokio::test]
    async fn test_unwritten_index_not_found() {
        let (layer, _store) = create_layer();
        let ctx = OpContext::background();

        assert!(matches!(
            layer.get_block(&ctx, 3).await,
            Err(BlocksetError::NotFound { index: 3, layer: LayerKind::Base })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_put_keeps_mapping() {
        let (layer, _store) = create_layer();
        let ctx = OpContext::background();
        let writer = InodeRef::new(1, 1);
        layer.put_block(&ctx, writer, 0, b"before").await.unwrap();

        let cancelled = ctx.child();
        cancelled.cancel();
        let result = layer.put_block(&cancelled, writer, 0, b"after").await;
        assert!(matches!(result, Err(BlocksetError::Cancelled { index: 0, .. })));
        assert_eq!(layer.get_block(&ctx, 0).await.unwrap(), b"before");
    }

    #[tokio::test]
    async fn test_truncate_and_provenance() {
        let (layer, _store) = create_layer();
        let ctx = OpContext::background();

        for index in 0..4 {
            let writer = InodeRef::new(7, index);
            layer.put_block(&ctx, writer, index, b"x").await.unwrap();
        }
        layer.truncate(2);

        assert_eq!(layer.indices(), vec![0, 1]);
        assert_eq!(
            layer.live_inodes().into_iter().collect::<Vec<_>>(),
            vec![InodeRef::new(7, 0), InodeRef::new(7, 1)]
        );
        assert_eq!(layer.block_ids().len(), 2);
        assert!(layer.get_block(&ctx, 3).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let (layer, store) = create_layer();
        let ctx = OpContext::background();
        layer.put_block(&ctx, InodeRef::new(1, 1), 4, b"four").await.unwrap();
        layer.put_block(&ctx, InodeRef::new(1, 2), 9, b"nine").await.unwrap();

        let state = layer.marshal_state();
        assert_eq!(state.len(), 8 + 2 * ENTRY_LEN);

        let restored = BaseLayer::unmarshal_state(&state, Arc::new(store)).unwrap();
        assert_eq!(restored.entry(4), layer.entry(4));
        assert_eq!(restored.entry(9), layer.entry(9));
        assert_eq!(restored.get_block(&ctx, 9).await.unwrap(), b"nine");
    }

    #[test]
    fn test_unmarshal_rejects_unordered_indices() {
        let id = BlockId::generate();
        let mut state = 2u64.to_le_bytes().to_vec();
        for index in [5u64, 5] {
            state.extend_from_slice(&index.to_le_bytes());
            state.extend_from_slice(id.as_bytes());
            state.extend_from_slice(&[0u8; 16]);
        }

        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        assert!(BaseLayer::unmarshal_state(&state, store).is_err());
    }
}
