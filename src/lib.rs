//! Library entrypoint for layerfs.
//!
//! layerfs maps an inode's logical block indices onto blocks held in a
//! pluggable block store, through a stack of composable layers (base mapping,
//! CRC integrity, replication) described by a textual layer spec. The stack
//! itself can be encoded to bytes and rebuilt against a block store later.

pub mod block_format;
pub mod block_store;
pub mod blockset;
pub mod config;
pub mod context;
pub mod file_store;
pub mod inode;
pub mod layer_spec;
pub mod metadata;
pub mod registry;
pub mod scrub;
pub mod wire;

pub use block_store::{BlockId, BlockStore, MemoryBlockStore, StoreError, StoreResult};
pub use blockset::{
    BaseLayer, BlockLayer, Blockset, BlocksetError, BlocksetResult, IntegrityLayer,
    ReplicationLayer,
};
pub use config::{BlockStoreConfig, ConfigError, LayerfsConfig};
pub use context::{Interrupted, OpContext};
pub use file_store::FileBlockStore;
pub use inode::{BlockIndex, InodeRef};
pub use layer_spec::{BlockLayerSpec, LayerDescriptor, LayerKind, ReadPolicy, SpecError};
pub use metadata::{
    load_blockset, make_key, save_blockset, MemoryMetadataStore, MetadataError, MetadataStore,
};
pub use registry::{BlockStoreFactory, BlockStoreRegistry, RegistryError};
pub use scrub::{BlocksetScrubber, ScrubConfig, ScrubReport};
pub use wire::{marshal_to_wire, unmarshal_from_wire, WireError};
