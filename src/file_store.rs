//! File-backed block store.
//!
//! Each block is written to its own file under `root`, using a two-level
//! directory fan-out derived from the sha256 of the block identifier:
//!
//! ```text
//! <root>/<h0h1>/<h2h3>/<block_id>.blk
//! ```
//!
//! Files carry a [`crate::block_format`] header so that a block damaged on disk
//! is reported as corrupted rather than returned.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::block_format::{read_block, write_block, BlockFormatError};
use crate::block_store::{BlockId, BlockStore, StoreError, StoreResult};
use crate::context::OpContext;

/// File extension of block files
pub const BLOCK_FILE_EXTENSION: &str = "blk";

/// Block store persisting one file per block
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    root: PathBuf,
}

impl FileBlockStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn new<P: Into<PathBuf>>(root: P) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!("Opened file block store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path of the file holding `id`
    pub fn block_path(&self, id: &BlockId) -> PathBuf {
        block_path_for(&self.root, id)
    }

    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StoreResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: format!("block I/O task failed: {}", e),
            })?
    }
}

/// Compute the path of a block file under `root`.
///
/// - hash = sha256(block id bytes) hex
/// - first 4 hex chars give two fan-out directories: h0h1 / h2h3
pub fn block_path_for(root: &Path, id: &BlockId) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(2).map(|b| format!("{:02x}", b)).collect();

    root.join(&hex[0..2])
        .join(&hex[2..4])
        .join(format!("{}.{}", id, BLOCK_FILE_EXTENSION))
}

fn write_block_file(path: &Path, id: BlockId, data: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_block(&mut writer, id, data).map_err(|e| match e {
        BlockFormatError::Io(err) => StoreError::Io(err),
        other => StoreError::Corrupted {
            id,
            reason: other.to_string(),
        },
    })?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn read_block_file(path: &Path, id: BlockId) -> StoreResult<Vec<u8>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound { id }),
        Err(e) => return Err(e.into()),
    };

    let (header, data) = read_block(&mut BufReader::new(file)).map_err(|e| match e {
        BlockFormatError::Io(err) if err.kind() != io::ErrorKind::UnexpectedEof => {
            StoreError::Io(err)
        }
        other => StoreError::Corrupted {
            id,
            reason: other.to_string(),
        },
    })?;

    if header.block_id != id {
        return Err(StoreError::Corrupted {
            id,
            reason: format!("file holds block {}", header.block_id),
        });
    }

    Ok(data)
}

#[async_trait]
impl BlockStore for FileBlockStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn put(&self, ctx: &OpContext, data: &[u8]) -> StoreResult<BlockId> {
        ctx.check()?;
        let id = BlockId::generate();
        let path = self.block_path(&id);
        let payload = data.to_vec();

        self.blocking(move || write_block_file(&path, id, &payload))
            .await?;

        debug!("Stored block {} ({} bytes)", id, data.len());
        Ok(id)
    }

    async fn get(&self, ctx: &OpContext, id: &BlockId) -> StoreResult<Vec<u8>> {
        ctx.check()?;
        let id = *id;
        let path = self.block_path(&id);

        let result = self.blocking(move || read_block_file(&path, id)).await;
        if let Err(StoreError::Corrupted { reason, .. }) = &result {
            warn!("Block {} failed verification: {}", id, reason);
        }
        result
    }

    async fn delete(&self, ctx: &OpContext, id: &BlockId) -> StoreResult<()> {
        ctx.check()?;
        let id = *id;
        let path = self.block_path(&id);

        self.blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound { id }),
            Err(e) => Err(e.into()),
        })
        .await
    }
}
