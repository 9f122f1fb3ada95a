//! Scrub Module
//!
//! Reads every live index of a blockset and reports the ones that cannot be
//! read back intact. Reading through the stack exercises the same checks as a
//! normal read: integrity layers verify checksums, and replication layers fall
//! back to healthy placements and read-repair the others as a side effect.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::block_store::StoreError;
use crate::blockset::{Blockset, BlocksetError};
use crate::context::OpContext;
use crate::inode::BlockIndex;

/// Severity levels for scrub issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueSeverity {
    /// Data is currently unreadable but may come back
    Major,
    /// Data is lost or corrupted
    Critical,
}

/// Kinds of problems a scrub can find
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueType {
    /// Stored bytes do not match their checksum
    CorruptedBlock,
    /// Data exists but no checksum was recorded for it
    MissingChecksum,
    /// A mapped block is gone from the block store
    MissingBlock,
    /// The block store could not serve the block
    UnavailableBlock,
}

/// One problem found during a scrub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubIssue {
    pub index: BlockIndex,
    pub severity: IssueSeverity,
    pub issue_type: IssueType,
    /// Human-readable description of the issue
    pub description: String,
    pub detected_at: SystemTime,
}

impl ScrubIssue {
    /// Classify a failed read, `None` for errors that end the scrub
    pub fn from_error(index: BlockIndex, err: &BlocksetError) -> Option<Self> {
        let (severity, issue_type) = classify(err)?;
        Some(Self {
            index,
            severity,
            issue_type,
            description: err.to_string(),
            detected_at: SystemTime::now(),
        })
    }
}

fn classify(err: &BlocksetError) -> Option<(IssueSeverity, IssueType)> {
    match err {
        BlocksetError::Integrity { .. } => Some((IssueSeverity::Critical, IssueType::CorruptedBlock)),
        BlocksetError::MissingChecksum { .. } => {
            Some((IssueSeverity::Major, IssueType::MissingChecksum))
        }
        BlocksetError::NotFound { .. } => Some((IssueSeverity::Critical, IssueType::MissingBlock)),
        BlocksetError::Io { source, .. } => match source {
            StoreError::NotFound { .. } => Some((IssueSeverity::Critical, IssueType::MissingBlock)),
            StoreError::Corrupted { .. } => {
                Some((IssueSeverity::Critical, IssueType::CorruptedBlock))
            }
            _ => Some((IssueSeverity::Major, IssueType::UnavailableBlock)),
        },
        BlocksetError::AllReplicasFailed { last, .. } => match classify(last) {
            Some((_, IssueType::UnavailableBlock)) | None => {
                Some((IssueSeverity::Major, IssueType::UnavailableBlock))
            }
            Some((_, issue_type)) => Some((IssueSeverity::Critical, issue_type)),
        },
        BlocksetError::Cancelled { .. } | BlocksetError::Timeout { .. } => None,
        _ => Some((IssueSeverity::Major, IssueType::UnavailableBlock)),
    }
}

/// Statistics about a scrub run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubStats {
    pub started_at: SystemTime,
    pub duration: Option<Duration>,
    pub indices_checked: u64,
    pub bytes_checked: u64,
    pub issues_by_severity: HashMap<IssueSeverity, u64>,
    /// Whether the scrub was cancelled or timed out
    pub cancelled: bool,
}

impl ScrubStats {
    pub fn new() -> Self {
        Self {
            started_at: SystemTime::now(),
            duration: None,
            indices_checked: 0,
            bytes_checked: 0,
            issues_by_severity: HashMap::new(),
            cancelled: false,
        }
    }

    /// Mark the scrub as completed
    pub fn complete(&mut self) {
        self.duration = SystemTime::now().duration_since(self.started_at).ok();
    }

    pub fn record_issue(&mut self, severity: IssueSeverity) {
        *self.issues_by_severity.entry(severity).or_insert(0) += 1;
    }

    pub fn total_issues(&self) -> u64 {
        self.issues_by_severity.values().sum()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues_by_severity
            .get(&IssueSeverity::Critical)
            .is_some_and(|count| *count > 0)
    }
}

impl Default for ScrubStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a scrub run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubConfig {
    /// Maximum number of issues to collect before stopping
    pub max_issues: Option<usize>,
    /// Whether to continue after finding a critical issue
    pub continue_after_critical: bool,
}

impl ScrubConfig {
    /// Check every index and collect every issue
    pub fn full() -> Self {
        Self {
            max_issues: None,
            continue_after_critical: true,
        }
    }

    /// Stop at the first critical issue or after 100 issues
    pub fn quick() -> Self {
        Self {
            max_issues: Some(100),
            continue_after_critical: false,
        }
    }
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self::full()
    }
}

/// Outcome of a scrub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubReport {
    pub stats: ScrubStats,
    pub issues: Vec<ScrubIssue>,
    pub config: ScrubConfig,
}

impl ScrubReport {
    pub fn new(config: ScrubConfig) -> Self {
        Self {
            stats: ScrubStats::new(),
            issues: Vec::new(),
            config,
        }
    }

    pub fn add_issue(&mut self, issue: ScrubIssue) {
        self.stats.record_issue(issue.severity);
        self.issues.push(issue);
    }

    /// True when the configuration says to stop early
    pub fn should_stop(&self) -> bool {
        if let Some(max_issues) = self.config.max_issues {
            if self.issues.len() >= max_issues {
                return true;
            }
        }

        !self.config.continue_after_critical && self.stats.has_critical_issues()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && !self.stats.cancelled
    }

    /// Indices with at least one issue
    pub fn affected_indices(&self) -> Vec<BlockIndex> {
        let mut indices: Vec<BlockIndex> = self.issues.iter().map(|i| i.index).collect();
        indices.dedup();
        indices
    }
}

/// Reads every live index of a blockset and reports failures
#[derive(Debug, Default)]
pub struct BlocksetScrubber;

impl BlocksetScrubber {
    pub fn new() -> Self {
        Self
    }

    /// Scrub `blockset` in index order
    pub async fn scrub(&self, ctx: &OpContext, blockset: &Blockset, config: ScrubConfig) -> ScrubReport {
        let mut report = ScrubReport::new(config);
        let indices = blockset.indices();
        info!("Scrubbing {} blocks of '{}'", indices.len(), blockset.spec());

        for index in indices {
            if report.should_stop() {
                break;
            }

            report.stats.indices_checked += 1;
            match blockset.get_block(ctx, index).await {
                Ok(data) => report.stats.bytes_checked += data.len() as u64,
                Err(err) => match ScrubIssue::from_error(index, &err) {
                    Some(issue) => {
                        warn!("Scrub found {:?} at block {}: {}", issue.issue_type, index, err);
                        report.add_issue(issue);
                    }
                    None => {
                        warn!("Scrub stopped at block {}: {}", index, err);
                        report.stats.cancelled = true;
                        break;
                    }
                },
            }
        }

        report.stats.complete();
        info!(
            "Scrub finished: {} blocks, {} bytes, {} issues",
            report.stats.indices_checked,
            report.stats.bytes_checked,
            report.stats.total_issues()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::{BlockStore, MemoryBlockStore};
    use crate::inode::InodeRef;
    use crate::layer_spec::LayerKind;
    use std::sync::Arc;

    async fn populated(spec: &str, count: u64) -> (Blockset, MemoryBlockStore) {
        let store = MemoryBlockStore::new();
        let blockset = Blockset::build_from_str(spec, Arc::new(store.clone()) as Arc<dyn BlockStore>).unwrap();
        let ctx = OpContext::background();
        for index in 0..count {
            blockset
                .put_block(&ctx, InodeRef::new(1, 1), index, format!("block {}", index).as_bytes())
                .await
                .unwrap();
        }
        (blockset, store)
    }

    #[tokio::test]
    async fn test_clean_scrub() {
        let (blockset, _store) = populated("crc,base", 4).await;
        let report = BlocksetScrubber::new()
            .scrub(&OpContext::background(), &blockset, ScrubConfig::full())
            .await;

        assert!(report.is_clean());
        assert_eq!(report.stats.indices_checked, 4);
        assert_eq!(report.stats.bytes_checked, 4 * 7);
        assert!(report.stats.duration.is_some());
    }

    #[tokio::test]
    async fn test_reports_corruption() {
        let (blockset, store) = populated("crc,base", 3).await;
        let ids = blockset.block_ids();
        store.overwrite(&ids[1], b"rotten!".to_vec());

        let report = BlocksetScrubber::new()
            .scrub(&OpContext::background(), &blockset, ScrubConfig::full())
            .await;

        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].index, 1);
        assert_eq!(report.issues[0].issue_type, IssueType::CorruptedBlock);
        assert!(report.stats.has_critical_issues());
        assert_eq!(report.stats.indices_checked, 3);
    }

    #[tokio::test]
    async fn test_quick_stops_at_critical() {
        let (blockset, store) = populated("crc,base", 3).await;
        for id in blockset.block_ids() {
            store.overwrite(&id, Vec::new());
        }

        let report = BlocksetScrubber::new()
            .scrub(&OpContext::background(), &blockset, ScrubConfig::quick())
            .await;
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.stats.indices_checked, 1);
    }

    #[tokio::test]
    async fn test_missing_block() {
        let (blockset, store) = populated("base", 2).await;
        let ctx = OpContext::background();
        store.delete(&ctx, &blockset.block_ids()[0]).await.unwrap();

        let report = BlocksetScrubber::new()
            .scrub(&ctx, &blockset, ScrubConfig::full())
            .await;
        assert_eq!(report.affected_indices(), vec![0]);
        assert_eq!(report.issues[0].issue_type, IssueType::MissingBlock);
    }

    #[test]
    fn test_issue_classification() {
        let unavailable = BlocksetError::store(
            4,
            LayerKind::Base,
            StoreError::Unavailable {
                reason: "offline".to_string(),
            },
        );
        let issue = ScrubIssue::from_error(4, &unavailable).unwrap();
        assert_eq!(issue.severity, IssueSeverity::Major);
        assert_eq!(issue.issue_type, IssueType::UnavailableBlock);

        let missing = BlocksetError::MissingChecksum {
            index: 4,
            layer: LayerKind::Crc,
        };
        let issue = ScrubIssue::from_error(4, &missing).unwrap();
        assert_eq!(issue.severity, IssueSeverity::Major);
        assert_eq!(issue.issue_type, IssueType::MissingChecksum);

        let corrupt_replica = BlocksetError::AllReplicasFailed {
            index: 4,
            attempted: 2,
            last: Box::new(BlocksetError::Integrity {
                index: 9,
                layer: LayerKind::Crc,
                expected: 1,
                calculated: 2,
            }),
        };
        let issue = ScrubIssue::from_error(4, &corrupt_replica).unwrap();
        assert_eq!(issue.severity, IssueSeverity::Critical);
        assert_eq!(issue.issue_type, IssueType::CorruptedBlock);

        let cancelled = BlocksetError::Cancelled {
            index: 4,
            layer: LayerKind::Base,
        };
        assert!(ScrubIssue::from_error(4, &cancelled).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_scrub() {
        let (blockset, _store) = populated("base", 2).await;
        let ctx = OpContext::background();
        ctx.cancel();

        let report = BlocksetScrubber::new()
            .scrub(&ctx, &blockset, ScrubConfig::full())
            .await;
        assert!(report.stats.cancelled);
        assert!(!report.is_clean());
    }
}
