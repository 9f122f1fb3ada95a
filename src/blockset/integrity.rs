//! Integrity layer: a CRC32 per block index, verified on every read.
//!
//! The checksum is committed only after the inner put succeeds, so a failed
//! or cancelled put leaves the previous checksum in place. An inner put that
//! was partly applied (a missed replication quorum) still changes what reads
//! return, so its checksum is committed too. A mismatch on read
//! is reported as [`BlocksetError::Integrity`] and is never corrected here;
//! a replication layer above this one falls back to another placement.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{BlockLayer, BlocksetError, BlocksetResult};
use crate::block_format::calculate_checksum;
use crate::block_store::BlockId;
use crate::context::OpContext;
use crate::inode::{BlockIndex, InodeRef};
use crate::layer_spec::{LayerDescriptor, LayerKind};
use crate::wire::{StateReader, WireResult};

/// Encoded size of one checksum entry: index, crc
const ENTRY_LEN: usize = 8 + 4;

/// Checksumming layer wrapping one inner layer
#[derive(Debug)]
pub struct IntegrityLayer {
    inner: Box<dyn BlockLayer>,
    checksums: RwLock<BTreeMap<BlockIndex, u32>>,
}

impl IntegrityLayer {
    pub fn new(inner: Box<dyn BlockLayer>) -> Self {
        Self {
            inner,
            checksums: RwLock::new(BTreeMap::new()),
        }
    }

    /// Recorded checksum for `index`
    pub fn checksum(&self, index: BlockIndex) -> Option<u32> {
        self.checksums.read().get(&index).copied()
    }

    pub(crate) fn unmarshal_state(state: &[u8], inner: Box<dyn BlockLayer>) -> WireResult<Self> {
        let mut reader = StateReader::new(LayerKind::Crc, state);
        let count = reader.read_count(ENTRY_LEN)?;

        let mut checksums = BTreeMap::new();
        for _ in 0..count {
            let index = reader.read_u64()?;
            let crc = reader.read_u32()?;
            if checksums.insert(index, crc).is_some() {
                return Err(reader.invalid(format!("duplicate checksum for block {}", index)));
            }
        }
        reader.finish()?;

        Ok(Self {
            inner,
            checksums: RwLock::new(checksums),
        })
    }
}

#[async_trait]
impl BlockLayer for IntegrityLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Crc
    }

    fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor::Crc
    }

    fn inner(&self) -> Option<&dyn BlockLayer> {
        Some(self.inner.as_ref())
    }

    async fn get_block(&self, ctx: &OpContext, index: BlockIndex) -> BlocksetResult<Vec<u8>> {
        let data = self.inner.get_block(ctx, index).await?;

        let expected = self.checksum(index).ok_or_else(|| {
            warn!("Block {} returned by inner layer has no checksum", index);
            BlocksetError::MissingChecksum {
                index,
                layer: LayerKind::Crc,
            }
        })?;

        let calculated = calculate_checksum(&data);
        if calculated != expected {
            warn!(
                "Checksum mismatch on block {}: expected {:08x}, calculated {:08x}",
                index, expected, calculated
            );
            return Err(BlocksetError::Integrity {
                index,
                layer: LayerKind::Crc,
                expected,
                calculated,
            });
        }

        Ok(data)
    }

    async fn put_block(
        &self,
        ctx: &OpContext,
        writer: InodeRef,
        index: BlockIndex,
        data: &[u8],
    ) -> BlocksetResult<()> {
        let crc = calculate_checksum(data);
        let result = self.inner.put_block(ctx, writer, index, data).await;

        let partial = match &result {
            Ok(()) => false,
            Err(e) => e.is_partial_write(),
        };
        if result.is_err() && !partial {
            return result;
        }

        self.checksums.write().insert(index, crc);
        if partial {
            warn!("Recorded checksum {:08x} for partly written block {}", crc, index);
        } else {
            debug!("Recorded checksum {:08x} for block {}", crc, index);
        }
        result
    }

    fn indices(&self) -> Vec<BlockIndex> {
        self.inner.indices()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn truncate(&self, len: BlockIndex) {
        self.checksums.write().split_off(&len);
        self.inner.truncate(len);
    }

    fn live_inodes(&self) -> BTreeSet<InodeRef> {
        self.inner.live_inodes()
    }

    fn block_ids(&self) -> Vec<BlockId> {
        self.inner.block_ids()
    }

    fn marshal_state(&self) -> Vec<u8> {
        let checksums = self.checksums.read();
        let mut buffer = Vec::with_capacity(8 + checksums.len() * ENTRY_LEN);

        buffer.extend_from_slice(&(checksums.len() as u64).to_le_bytes());
        for (index, crc) in checksums.iter() {
            buffer.extend_from_slice(&index.to_le_bytes());
            buffer.extend_from_slice(&crc.to_le_bytes());
        }
        buffer
    }
}
