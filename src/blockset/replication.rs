//! Replication layer.
//!
//! Each logical block index is stored at `factor` placements inside the single
//! inner layer: placement `p` of index `i` lives at inner index
//! `i * factor + p`. Writes go to every placement concurrently and succeed once
//! `quorum` placements acknowledge. Placements that missed a successful write
//! are marked stale and skipped on read until read-repair rewrites them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::{BlockLayer, BlocksetError, BlocksetResult};
use crate::block_store::BlockId;
use crate::context::OpContext;
use crate::inode::{BlockIndex, InodeRef};
use crate::layer_spec::{LayerDescriptor, LayerKind, ReadPolicy, SpecResult};
use crate::wire::{StateReader, WireResult};

/// Encoded size of one placement entry: index, stale mask, inode, generation
const ENTRY_LEN: usize = 8 + 1 + 8 + 8;

/// Placement bookkeeping for one logical index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementState {
    /// Last writer, used to attribute read-repair writes
    pub writer: InodeRef,
    /// Bit `p` set when placement `p` missed the latest successful write
    pub stale: u8,
}

impl PlacementState {
    pub fn is_stale(&self, placement: u32) -> bool {
        self.stale & (1 << placement) != 0
    }

    pub fn stale_placements(&self) -> impl Iterator<Item = u32> + '_ {
        (0..u8::BITS).filter(move |p| self.is_stale(*p))
    }
}

/// Replicating layer wrapping one inner layer
#[derive(Debug)]
pub struct ReplicationLayer {
    inner: Box<dyn BlockLayer>,
    factor: u32,
    quorum: u32,
    read_policy: ReadPolicy,
    placements: RwLock<BTreeMap<BlockIndex, PlacementState>>,
    next_start: AtomicUsize,
}

impl ReplicationLayer {
    /// Create a replication layer; `factor` and `quorum` are range checked
    pub fn new(
        inner: Box<dyn BlockLayer>,
        factor: u32,
        quorum: u32,
        read_policy: ReadPolicy,
    ) -> SpecResult<Self> {
        LayerDescriptor::Replication {
            factor,
            quorum,
            read_policy,
        }
        .validate()?;

        Ok(Self {
            inner,
            factor,
            quorum,
            read_policy,
            placements: RwLock::new(BTreeMap::new()),
            next_start: AtomicUsize::new(0),
        })
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn quorum(&self) -> u32 {
        self.quorum
    }

    pub fn read_policy(&self) -> ReadPolicy {
        self.read_policy
    }

    /// Placement bookkeeping for `index`
    pub fn placement_state(&self, index: BlockIndex) -> Option<PlacementState> {
        self.placements.read().get(&index).copied()
    }

    /// Inner index holding placement `placement` of `index`
    pub fn placement_index(&self, index: BlockIndex, placement: u32) -> BlocksetResult<BlockIndex> {
        index
            .checked_mul(self.factor as u64)
            .and_then(|base| base.checked_add(placement as u64))
            .ok_or(BlocksetError::IndexOutOfRange {
                index,
                layer: LayerKind::Replication,
            })
    }

    /// Placements in the order a read should try them
    fn read_order(&self) -> Vec<u32> {
        let start = match self.read_policy {
            ReadPolicy::FirstHealthy => 0,
            ReadPolicy::RoundRobin => {
                (self.next_start.fetch_add(1, Ordering::Relaxed) % self.factor as usize) as u32
            }
        };
        (0..self.factor).map(|k| (start + k) % self.factor).collect()
    }

    /// Rewrite `data` to the placements that failed or are stale.
    /// Failures are logged and leave the placement stale.
    async fn read_repair(
        &self,
        ctx: &OpContext,
        index: BlockIndex,
        writer: InodeRef,
        targets: &[u32],
        data: &[u8],
    ) {
        for &placement in targets {
            let target = match self.placement_index(index, placement) {
                Ok(target) => target,
                Err(_) => continue,
            };

            match self.inner.put_block(ctx, writer, target, data).await {
                Ok(()) => {
                    if let Some(state) = self.placements.write().get_mut(&index) {
                        state.stale &= !(1u8 << placement);
                    }
                    info!("Read-repaired placement {} of block {}", placement, index);
                }
                Err(e) => {
                    warn!(
                        "Read-repair of placement {} of block {} failed: {}",
                        placement, index, e
                    );
                }
            }
        }
    }

    pub(crate) fn unmarshal_state(state: &[u8], inner: Box<dyn BlockLayer>) -> WireResult<Self> {
        let mut reader = StateReader::new(LayerKind::Replication, state);
        let factor = reader.read_u8()? as u32;
        let quorum = reader.read_u8()? as u32;
        let policy = reader.read_u8()?;
        let read_policy = ReadPolicy::from_tag(policy)
            .ok_or_else(|| reader.invalid(format!("unknown read policy {}", policy)))?;

        let layer = Self::new(inner, factor, quorum, read_policy)
            .map_err(|e| reader.invalid(e.to_string()))?;

        let all_placements = ((1u16 << factor) - 1) as u8;
        let count = reader.read_count(ENTRY_LEN)?;
        let mut placements = BTreeMap::new();
        for _ in 0..count {
            let index = reader.read_u64()?;
            let stale = reader.read_u8()?;
            let writer = InodeRef::new(reader.read_u64()?, reader.read_u64()?);

            if stale & !all_placements != 0 || stale == all_placements {
                return Err(reader.invalid(format!(
                    "invalid stale mask {:08b} for block {}",
                    stale, index
                )));
            }
            if placements
                .insert(index, PlacementState { writer, stale })
                .is_some()
            {
                return Err(reader.invalid(format!("duplicate placement entry for block {}", index)));
            }
        }
        reader.finish()?;

        *layer.placements.write() = placements;
        Ok(layer)
    }
}

#[async_trait]
impl BlockLayer for ReplicationLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Replication
    }

    fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor::Replication {
            factor: self.factor,
            quorum: self.quorum,
            read_policy: self.read_policy,
        }
    }

    fn inner(&self) -> Option<&dyn BlockLayer> {
        Some(self.inner.as_ref())
    }

    async fn get_block(&self, ctx: &OpContext, index: BlockIndex) -> BlocksetResult<Vec<u8>> {
        let state = self.placement_state(index);
        let mut failed = Vec::new();
        let mut last_error = None;

        for placement in self.read_order() {
            if state.is_some_and(|s| s.is_stale(placement)) {
                continue;
            }
            let target = self.placement_index(index, placement)?;

            match self.inner.get_block(ctx, target).await {
                Ok(data) => {
                    if let Some(state) = state {
                        let mut targets = failed.clone();
                        targets.extend(state.stale_placements());
                        if !targets.is_empty() {
                            self.read_repair(ctx, index, state.writer, &targets, &data)
                                .await;
                        }
                    }
                    return Ok(data);
                }
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) if e.is_not_found() => {
                    debug!("Placement {} of block {} not found", placement, index);
                    failed.push(placement);
                }
                Err(e) => {
                    warn!(
                        "Placement {} of block {} failed, trying next placement: {}",
                        placement, index, e
                    );
                    failed.push(placement);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => Err(BlocksetError::NotFound {
                index,
                layer: LayerKind::Replication,
            }),
            Some(last) => {
                error!("All placements of block {} failed", index);
                Err(BlocksetError::AllReplicasFailed {
                    index,
                    attempted: failed.len(),
                    last: Box::new(last),
                })
            }
        }
    }

    async fn put_block(
        &self,
        ctx: &OpContext,
        writer: InodeRef,
        index: BlockIndex,
        data: &[u8],
    ) -> BlocksetResult<()> {
        let targets = (0..self.factor)
            .map(|p| self.placement_index(index, p))
            .collect::<BlocksetResult<Vec<_>>>()?;

        let results = join_all(
            targets
                .iter()
                .map(|&target| self.inner.put_block(ctx, writer, target, data)),
        )
        .await;

        let mut succeeded = 0usize;
        let mut stale = 0u8;
        let mut interrupted = None;
        for (placement, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(
                        "Write of placement {} of block {} failed: {}",
                        placement, index, e
                    );
                    stale |= 1 << placement;
                    if e.is_interrupted() {
                        interrupted = Some(e);
                    }
                }
            }
        }

        if succeeded > 0 {
            self.placements
                .write()
                .insert(index, PlacementState { writer, stale });
            if stale != 0 {
                warn!("Block {} has stale placements {:08b}", index, stale);
            }
        }

        if succeeded < self.quorum as usize {
            if let (0, Some(e)) = (succeeded, interrupted) {
                return Err(e);
            }
            error!(
                "Quorum not met for block {}: {} of {} placements written",
                index, succeeded, self.quorum
            );
            return Err(BlocksetError::QuorumNotMet {
                index,
                succeeded,
                required: self.quorum as usize,
            });
        }

        Ok(())
    }

    fn indices(&self) -> Vec<BlockIndex> {
        let factor = self.factor as u64;
        let mut indices: Vec<BlockIndex> =
            self.inner.indices().into_iter().map(|i| i / factor).collect();
        indices.dedup();
        indices
    }

    fn truncate(&self, len: BlockIndex) {
        self.placements.write().split_off(&len);
        self.inner.truncate(len.saturating_mul(self.factor as u64));
    }

    fn live_inodes(&self) -> BTreeSet<InodeRef> {
        self.inner.live_inodes()
    }

    fn block_ids(&self) -> Vec<BlockId> {
        self.inner.block_ids()
    }

    fn marshal_state(&self) -> Vec<u8> {
        let placements = self.placements.read();
        let mut buffer = Vec::with_capacity(3 + 8 + placements.len() * ENTRY_LEN);

        buffer.push(self.factor as u8);
        buffer.push(self.quorum as u8);
        buffer.push(self.read_policy.tag());
        buffer.extend_from_slice(&(placements.len() as u64).to_le_bytes());
        for (index, state) in placements.iter() {
            buffer.extend_from_slice(&index.to_le_bytes());
            buffer.push(state.stale);
            buffer.extend_from_slice(&state.writer.inode.to_le_bytes());
            buffer.extend_from_slice(&state.writer.generation.to_le_bytes());
        }
        buffer
    }
}
