//! Builds a live layer chain from a parsed [`BlockLayerSpec`].
//!
//! The spec is walked from its terminal layer backward, each new layer taking
//! the previously built one as its inner layer. The same spec always yields a
//! stack with the same layer kinds and parameters.

use std::sync::Arc;

use tracing::debug;

use super::{BaseLayer, BlockLayer, Blockset, BlocksetResult, IntegrityLayer, ReplicationLayer};
use crate::block_store::BlockStore;
use crate::layer_spec::{BlockLayerSpec, LayerDescriptor, SpecError, SpecResult};

/// Instantiate the layers of `spec`, outermost layer returned
pub fn build_layers(
    spec: &BlockLayerSpec,
    store: Arc<dyn BlockStore>,
) -> SpecResult<Box<dyn BlockLayer>> {
    let mut built: Option<Box<dyn BlockLayer>> = None;

    for (position, descriptor) in spec.layers().iter().enumerate().rev() {
        let layer: Box<dyn BlockLayer> = match (*descriptor, built.take()) {
            (LayerDescriptor::Base, None) => Box::new(BaseLayer::new(Arc::clone(&store))),
            (LayerDescriptor::Base, Some(_)) => {
                return Err(SpecError::MultipleTerminals { position })
            }
            (LayerDescriptor::Crc, Some(inner)) => Box::new(IntegrityLayer::new(inner)),
            (
                LayerDescriptor::Replication {
                    factor,
                    quorum,
                    read_policy,
                },
                Some(inner),
            ) => Box::new(ReplicationLayer::new(inner, factor, quorum, read_policy)?),
            (other, None) => {
                return Err(SpecError::MissingTerminal {
                    last: other.to_string(),
                })
            }
        };
        debug!("Built {} layer at position {}", layer.kind(), position);
        built = Some(layer);
    }

    built.ok_or(SpecError::Empty)
}

impl Blockset {
    /// Build an empty blockset from a parsed spec, bound to `store`
    pub fn build(spec: &BlockLayerSpec, store: Arc<dyn BlockStore>) -> BlocksetResult<Self> {
        let root = build_layers(spec, store)?;
        Ok(Blockset::from_root(root))
    }

    /// Parse `spec` and build an empty blockset bound to `store`
    pub fn build_from_str(spec: &str, store: Arc<dyn BlockStore>) -> BlocksetResult<Self> {
        let spec = BlockLayerSpec::parse(spec)?;
        Self::build(&spec, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::MemoryBlockStore;
    use crate::layer_spec::{LayerKind, ReadPolicy};

    fn store() -> Arc<dyn BlockStore> {
        Arc::new(MemoryBlockStore::new())
    }

    fn kinds(blockset: &Blockset) -> Vec<LayerKind> {
        blockset.layers().iter().map(|l| l.kind()).collect()
    }

    #[test]
    fn test_build_single_base() {
        let blockset = Blockset::build_from_str("base", store()).unwrap();
        assert_eq!(kinds(&blockset), vec![LayerKind::Base]);
    }

    #[test]
    fn test_build_crc_base() {
        let blockset = Blockset::build_from_str("crc,base", store()).unwrap();
        assert_eq!(kinds(&blockset), vec![LayerKind::Crc, LayerKind::Base]);
    }

    #[test]
    fn test_build_replication() {
        let blockset = Blockset::build_from_str("replication:3,base", store()).unwrap();
        assert_eq!(
            kinds(&blockset),
            vec![LayerKind::Replication, LayerKind::Base]
        );
        assert_eq!(
            blockset.root().descriptor(),
            LayerDescriptor::Replication {
                factor: 3,
                quorum: 3,
                read_policy: ReadPolicy::FirstHealthy,
            }
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let text = "replication:3:2:rr,crc,base";
        let first = Blockset::build_from_str(text, store()).unwrap();
        let second = Blockset::build_from_str(text, store()).unwrap();
        assert_eq!(first.spec(), second.spec());
        assert_eq!(first.spec(), BlockLayerSpec::parse(text).unwrap());
    }

    #[test]
    fn test_build_rejects_bad_spec() {
        assert!(Blockset::build_from_str("crc", store()).is_err());
        assert!(Blockset::build_from_str("gzip,base", store()).is_err());
    }
}
