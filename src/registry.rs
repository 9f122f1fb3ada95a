//! Block store backend registry.
//!
//! Backends are selected by name. The registry is an ordinary value built at
//! process start and passed to whoever opens stores.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::block_store::{BlockStore, MemoryBlockStore, StoreError};
use crate::config::BlockStoreConfig;
use crate::file_store::FileBlockStore;

/// Errors raised while opening a block store by name
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown block store backend '{name}' (registered: {registered})")]
    UnknownBackend { name: String, registered: String },

    #[error("Block store backend '{name}' is already registered")]
    DuplicateBackend { name: String },

    #[error("Failed to open '{name}' block store: {source}")]
    Open {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// What a factory returns
pub type OpenResult = Result<Arc<dyn BlockStore>, StoreError>;

/// Opens a block store from configuration
pub trait BlockStoreFactory: Send + Sync {
    fn open(&self, config: &BlockStoreConfig) -> OpenResult;
}

impl<F> BlockStoreFactory for F
where
    F: Fn(&BlockStoreConfig) -> OpenResult + Send + Sync,
{
    fn open(&self, config: &BlockStoreConfig) -> OpenResult {
        self(config)
    }
}

/// Name to factory map of block store backends
#[derive(Default)]
pub struct BlockStoreRegistry {
    factories: BTreeMap<String, Box<dyn BlockStoreFactory>>,
}

impl fmt::Debug for BlockStoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStoreRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}

impl BlockStoreRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `memory` and `file` backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            "memory".to_string(),
            Box::new(|_: &BlockStoreConfig| -> OpenResult {
                Ok(Arc::new(MemoryBlockStore::new()))
            }),
        );
        registry.factories.insert(
            "file".to_string(),
            Box::new(|config: &BlockStoreConfig| -> OpenResult {
                Ok(Arc::new(FileBlockStore::new(&config.root)?))
            }),
        );
        registry
    }

    /// Register a backend under `name`
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl BlockStoreFactory + 'static,
    ) -> RegistryResult<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::DuplicateBackend { name });
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Registered backend names, sorted
    pub fn backends(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Open the backend named in `config`
    pub fn open(&self, config: &BlockStoreConfig) -> RegistryResult<Arc<dyn BlockStore>> {
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| RegistryError::UnknownBackend {
                name: config.backend.clone(),
                registered: self.backends().join(", "),
            })?;

        let store = factory.open(config).map_err(|source| RegistryError::Open {
            name: config.backend.clone(),
            source,
        })?;
        info!("Opened '{}' block store", config.backend);
        Ok(store)
    }
}
