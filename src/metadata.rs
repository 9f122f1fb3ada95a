//! Metadata Module
//!
//! Transaction contract of the metadata store that persists encoded
//! blocksets, an in-memory implementation of it, and the helpers that save
//! and load a blockset under optimistic concurrency control.
//!
//! A transaction evaluates all of its guards atomically. When every guard
//! holds, the `and_then` operations run; otherwise the `or_else` operations
//! run. Each key carries a version: 0 while the key is absent, incremented by
//! every put.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block_store::BlockStore;
use crate::blockset::Blockset;
use crate::context::{Interrupted, OpContext};
use crate::layer_spec::{BlockLayerSpec, SpecError};
use crate::wire::WireError;

/// Key suffix holding the encoded blockset
pub const BLOCKSET_KEY: &str = "blockset";

/// Key suffix holding the layer spec string
pub const LAYERS_KEY: &str = "layers";

/// Errors raised by the metadata store and the blockset record helpers
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Version conflict on '{key}': expected version {expected_version}")]
    Conflict { key: String, expected_version: u64 },

    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Stored layer spec '{stored}' does not match decoded stack '{decoded}'")]
    SpecMismatch { stored: String, decoded: String },

    #[error("Stored value under '{key}' is not valid UTF-8")]
    InvalidValue { key: String },

    #[error("Metadata backend error: {reason}")]
    Backend { reason: String },

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Invalid layer spec: {0}")]
    Spec(#[from] SpecError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

/// A stored key with its value and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

/// Guard evaluated against a single key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    KeyExists(String),
    KeyNotExists(String),
    ValueEquals(String, Vec<u8>),
    VersionEquals(String, u64),
}

impl Compare {
    /// Guard on the version of `key`; version 0 means the key must be absent
    pub fn version(key: impl Into<String>, version: u64) -> Self {
        let key = key.into();
        if version == 0 {
            Compare::KeyNotExists(key)
        } else {
            Compare::VersionEquals(key, version)
        }
    }

    fn holds(&self, data: &BTreeMap<String, Versioned>) -> bool {
        match self {
            Compare::KeyExists(key) => data.contains_key(key),
            Compare::KeyNotExists(key) => !data.contains_key(key),
            Compare::ValueEquals(key, value) => data.get(key).is_some_and(|v| &v.value == value),
            Compare::VersionEquals(key, version) => {
                data.get(key).map_or(0, |v| v.version) == *version
            }
        }
    }
}

/// Operation executed by a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    GetPrefix { prefix: String },
    /// Delete keys in `[start, end)`
    DeleteRange { start: String, end: String },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    pub fn get_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::GetPrefix {
            prefix: prefix.into(),
        }
    }

    /// Delete exactly one key
    pub fn delete(key: impl Into<String>) -> Self {
        let start = key.into();
        let end = format!("{}\0", start);
        TxnOp::DeleteRange { start, end }
    }

    pub fn delete_range(start: impl Into<String>, end: impl Into<String>) -> Self {
        TxnOp::DeleteRange {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Conditional multi-operation transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

/// Outcome of a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    /// True when every guard held and the `and_then` branch ran
    pub succeeded: bool,
    /// Key/values read by `Get` and `GetPrefix` operations, in order
    pub results: Vec<KeyValue>,
}

impl TxnResponse {
    /// First result for `key`
    pub fn get(&self, key: &str) -> Option<&KeyValue> {
        self.results.iter().find(|kv| kv.key == key)
    }
}

/// Metadata store offering atomic conditional transactions
#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    async fn txn(&self, ctx: &OpContext, txn: Txn) -> MetadataResult<TxnResponse>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Versioned {
    value: Vec<u8>,
    version: u64,
}

/// In-memory metadata store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataStore {
    data: Arc<RwLock<BTreeMap<String, Versioned>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key/value, ordered by key
    pub fn snapshot(&self) -> Vec<KeyValue> {
        self.data
            .read()
            .iter()
            .map(|(key, v)| KeyValue {
                key: key.clone(),
                value: v.value.clone(),
                version: v.version,
            })
            .collect()
    }

    /// Rebuild a store from a snapshot
    pub fn restore(entries: Vec<KeyValue>) -> Self {
        let data = entries
            .into_iter()
            .map(|kv| {
                (
                    kv.key,
                    Versioned {
                        value: kv.value,
                        version: kv.version,
                    },
                )
            })
            .collect();
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Snapshot encoded as JSON
    pub fn to_json(&self) -> MetadataResult<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    pub fn from_json(json: &str) -> MetadataResult<Self> {
        let entries: Vec<KeyValue> = serde_json::from_str(json)?;
        Ok(Self::restore(entries))
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn apply(data: &mut BTreeMap<String, Versioned>, op: TxnOp, results: &mut Vec<KeyValue>) {
        match op {
            TxnOp::Put { key, value } => {
                let version = data.get(&key).map_or(0, |v| v.version) + 1;
                data.insert(key, Versioned { value, version });
            }
            TxnOp::Get { key } => {
                if let Some(v) = data.get(&key) {
                    results.push(KeyValue {
                        key,
                        value: v.value.clone(),
                        version: v.version,
                    });
                }
            }
            TxnOp::GetPrefix { prefix } => {
                results.extend(
                    data.range(prefix.clone()..)
                        .take_while(|(key, _)| key.starts_with(&prefix))
                        .map(|(key, v)| KeyValue {
                            key: key.clone(),
                            value: v.value.clone(),
                            version: v.version,
                        }),
                );
            }
            TxnOp::DeleteRange { start, end } => {
                if start < end {
                    let doomed: Vec<String> =
                        data.range(start..end).map(|(key, _)| key.clone()).collect();
                    for key in doomed {
                        data.remove(&key);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn txn(&self, ctx: &OpContext, txn: Txn) -> MetadataResult<TxnResponse> {
        ctx.check()?;

        let mut data = self.data.write();
        let succeeded = txn.compares.iter().all(|c| c.holds(&data));
        let ops = if succeeded { txn.success } else { txn.failure };

        let mut results = Vec::new();
        for op in ops {
            Self::apply(&mut data, op, &mut results);
        }

        Ok(TxnResponse { succeeded, results })
    }
}

/// Join `parts` under `prefix` with `/`
pub fn make_key<I, S>(prefix: &str, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = prefix.trim_end_matches('/').to_string();
    for part in parts {
        key.push('/');
        key.push_str(part.as_ref().trim_matches('/'));
    }
    key
}

/// Persist a blockset under `key`.
///
/// The encoded blockset is written to `<key>/blockset` and its layer spec to
/// `<key>/layers` in one transaction, guarded on the blockset key still being
/// at `expected_version` (0: the key must not exist yet). Returns the new
/// version; on [`MetadataError::Conflict`] the caller re-reads and retries.
pub async fn save_blockset(
    ctx: &OpContext,
    metadata: &dyn MetadataStore,
    key: &str,
    blockset: &Blockset,
    expected_version: u64,
) -> MetadataResult<u64> {
    let data_key = make_key(key, [BLOCKSET_KEY]);
    let layers_key = make_key(key, [LAYERS_KEY]);

    let encoded = blockset.marshal_to_wire().await?;
    let spec = blockset.spec().to_string();

    let txn = Txn::new()
        .when([Compare::version(data_key.as_str(), expected_version)])
        .and_then([
            TxnOp::put(data_key.as_str(), encoded),
            TxnOp::put(layers_key.as_str(), spec.clone()),
            TxnOp::get(data_key.as_str()),
        ]);

    let response = ctx.run(metadata.txn(ctx, txn)).await??;
    if !response.succeeded {
        warn!(
            "Blockset save under '{}' lost a race at version {}",
            key, expected_version
        );
        return Err(MetadataError::Conflict {
            key: data_key,
            expected_version,
        });
    }

    let version = response
        .get(&data_key)
        .map(|kv| kv.version)
        .ok_or_else(|| MetadataError::NotFound {
            key: data_key.clone(),
        })?;
    info!("Saved blockset '{}' under '{}' at version {}", spec, key, version);
    Ok(version)
}

/// Load the blockset stored under `key`, bound to `store`.
///
/// Returns the blockset and the version to pass to the next
/// [`save_blockset`].
pub async fn load_blockset(
    ctx: &OpContext,
    metadata: &dyn MetadataStore,
    key: &str,
    store: Arc<dyn BlockStore>,
) -> MetadataResult<(Blockset, u64)> {
    let data_key = make_key(key, [BLOCKSET_KEY]);
    let layers_key = make_key(key, [LAYERS_KEY]);

    let txn = Txn::new().and_then([TxnOp::get(data_key.as_str()), TxnOp::get(layers_key.as_str())]);
    let response = ctx.run(metadata.txn(ctx, txn)).await??;

    let data = response.get(&data_key).ok_or_else(|| MetadataError::NotFound {
        key: data_key.clone(),
    })?;
    let layers = response
        .get(&layers_key)
        .ok_or_else(|| MetadataError::NotFound {
            key: layers_key.clone(),
        })?;

    // Stored spec is parsed before the bytes are decoded
    let stored = std::str::from_utf8(&layers.value).map_err(|_| MetadataError::InvalidValue {
        key: layers_key.clone(),
    })?;
    let spec = BlockLayerSpec::parse(stored)?;

    let blockset = Blockset::unmarshal_from_wire(&data.value, store)?;
    if blockset.spec() != spec {
        return Err(MetadataError::SpecMismatch {
            stored: spec.to_string(),
            decoded: blockset.spec().to_string(),
        });
    }

    debug!(
        "Loaded blockset '{}' from '{}' at version {}",
        spec, key, data.version
    );
    Ok((blockset, data.version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key() {
        assert_eq!(make_key("/layerfs", ["inodes", "42"]), "/layerfs/inodes/42");
        assert_eq!(make_key("/layerfs/", ["/inodes/"]), "/layerfs/inodes");
        assert_eq!(make_key("", ["a"]), "/a");
    }

    #[tokio::test]
    async fn test_versions_increment() {
        let store = MemoryMetadataStore::new();
        let ctx = OpContext::background();

        for expected in 1..=3u64 {
            let response = store
                .txn(&ctx, Txn::new().and_then([TxnOp::put("k", "v"), TxnOp::get("k")]))
                .await
                .unwrap();
            assert_eq!(response.get("k").unwrap().version, expected);
        }
    }

    #[tokio::test]
    async fn test_guards() {
        let store = MemoryMetadataStore::new();
        let ctx = OpContext::background();

        let create = Txn::new()
            .when([Compare::KeyNotExists("a".to_string())])
            .and_then([TxnOp::put("a", "1")]);
        assert!(store.txn(&ctx, create.clone()).await.unwrap().succeeded);
        assert!(!store.txn(&ctx, create).await.unwrap().succeeded);

        let check = |c: Compare| Txn::new().when([c]);
        assert!(store.txn(&ctx, check(Compare::KeyExists("a".into()))).await.unwrap().succeeded);
        assert!(store
            .txn(&ctx, check(Compare::ValueEquals("a".into(), b"1".to_vec())))
            .await
            .unwrap()
            .succeeded);
        assert!(!store
            .txn(&ctx, check(Compare::ValueEquals("a".into(), b"2".to_vec())))
            .await
            .unwrap()
            .succeeded);
        assert!(store.txn(&ctx, check(Compare::version("a", 1))).await.unwrap().succeeded);
        assert!(store.txn(&ctx, check(Compare::version("b", 0))).await.unwrap().succeeded);
    }

    #[tokio::test]
    async fn test_or_else_branch_and_ranges() {
        let store = MemoryMetadataStore::new();
        let ctx = OpContext::background();
        store
            .txn(
                &ctx,
                Txn::new().and_then([
                    TxnOp::put("/p/a", "1"),
                    TxnOp::put("/p/b", "2"),
                    TxnOp::put("/q", "3"),
                ]),
            )
            .await
            .unwrap();

        let response = store
            .txn(
                &ctx,
                Txn::new()
                    .when([Compare::KeyExists("/missing".into())])
                    .and_then([TxnOp::delete_range("/", "0")])
                    .or_else([TxnOp::get_prefix("/p/")]),
            )
            .await
            .unwrap();
        assert!(!response.succeeded);
        assert_eq!(response.results.len(), 2);
        assert_eq!(store.len(), 3);

        store
            .txn(&ctx, Txn::new().and_then([TxnOp::delete("/p/a")]))
            .await
            .unwrap();
        let keys: Vec<String> = store.snapshot().into_iter().map(|kv| kv.key).collect();
        assert_eq!(keys, vec!["/p/b", "/q"]);
    }

    #[tokio::test]
    async fn test_json_snapshot() {
        let store = MemoryMetadataStore::new();
        let ctx = OpContext::background();
        store
            .txn(&ctx, Txn::new().and_then([TxnOp::put("k", vec![0u8, 255])]))
            .await
            .unwrap();

        let restored = MemoryMetadataStore::from_json(&store.to_json().unwrap()).unwrap();
        assert_eq!(restored.snapshot(), store.snapshot());
    }

    #[tokio::test]
    async fn test_cancelled_txn() {
        let store = MemoryMetadataStore::new();
        let ctx = OpContext::background();
        ctx.cancel();
        assert!(matches!(
            store.txn(&ctx, Txn::new()).await,
            Err(MetadataError::Interrupted(Interrupted::Cancelled))
        ));
    }
}
