//! Checkpointing: a versioned plain-data record of the engine configuration
//! and the last committed micro-batch.
//!
//! Lifecycle: `Fresh -> Running -> (Checkpointed)* -> Stopped`, and on restart
//! `Recovering -> Running`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::CheckpointError;

pub const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Running totals across all committed batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointTotals {
    pub batches: u64,
    pub lines_received: u64,
    pub lines_dropped: u64,
    pub records_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub config: EngineConfig,
    pub last_committed_batch: Option<u64>,
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub totals: CheckpointTotals,
}

impl Checkpoint {
    fn new(config: EngineConfig) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            config,
            last_committed_batch: None,
            committed_at: None,
            totals: CheckpointTotals::default(),
        }
    }
}

/// Per-batch numbers folded into the checkpoint totals on commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub lines_received: u64,
    pub lines_dropped: u64,
    pub records_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Fresh,
    Recovering,
    Running,
    Checkpointed,
    Stopped,
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointState::Fresh => "fresh",
            CheckpointState::Recovering => "recovering",
            CheckpointState::Running => "running",
            CheckpointState::Checkpointed => "checkpointed",
            CheckpointState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct CheckpointManager {
    dir: PathBuf,
    state: CheckpointState,
    checkpoint: Checkpoint,
}

impl CheckpointManager {
    /// Open the checkpoint directory. An existing checkpoint puts the manager
    /// in `Recovering` and its recorded configuration replaces `launch_config`.
    pub fn open(dir: impl Into<PathBuf>, launch_config: EngineConfig) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        let path = dir.join(CHECKPOINT_FILE);

        if !path.exists() {
            info!(dir = ?dir, "No checkpoint found, starting fresh");
            return Ok(Self {
                dir,
                state: CheckpointState::Fresh,
                checkpoint: Checkpoint::new(launch_config),
            });
        }

        let checkpoint: Checkpoint = serde_json::from_slice(&std::fs::read(&path)?)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }

        if checkpoint.config != launch_config {
            warn!(
                recorded = ?checkpoint.config,
                launched = ?launch_config,
                "Launch configuration differs from checkpoint, using checkpoint"
            );
        }

        info!(
            dir = ?dir,
            last_committed_batch = ?checkpoint.last_committed_batch,
            batches = checkpoint.totals.batches,
            "Recovering from checkpoint"
        );

        Ok(Self {
            dir,
            state: CheckpointState::Recovering,
            checkpoint,
        })
    }

    /// Delete any checkpoint in `dir`. Used before a deliberate fresh start.
    pub fn reset(dir: &Path) -> Result<(), CheckpointError> {
        let path = dir.join(CHECKPOINT_FILE);
        if path.exists() {
            std::fs::remove_file(&path)?;
            info!(path = ?path, "Checkpoint removed");
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.checkpoint.config
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn last_committed_batch(&self) -> Option<u64> {
        self.checkpoint.last_committed_batch
    }

    /// Id the next admitted micro-batch should carry
    pub fn next_batch_id(&self) -> u64 {
        self.checkpoint
            .last_committed_batch
            .map(|id| id + 1)
            .unwrap_or(0)
    }

    /// Whether `batch_id`'s side effects are already durable
    pub fn is_committed(&self, batch_id: u64) -> bool {
        self.checkpoint
            .last_committed_batch
            .is_some_and(|last| batch_id <= last)
    }

    pub fn mark_running(&mut self) {
        if matches!(self.state, CheckpointState::Fresh | CheckpointState::Recovering) {
            info!(from = %self.state, "Checkpoint manager running");
            self.state = CheckpointState::Running;
        }
    }

    /// Durably record `batch_id` as committed. Must be called in batch order.
    pub fn commit(&mut self, batch_id: u64, stats: BatchStats) -> Result<(), CheckpointError> {
        if self.is_committed(batch_id) {
            warn!(batch_id, "Batch already committed, ignoring");
            return Ok(());
        }

        let mut next = self.checkpoint.clone();
        next.last_committed_batch = Some(batch_id);
        next.committed_at = Some(Utc::now());
        next.totals.batches += 1;
        next.totals.lines_received += stats.lines_received;
        next.totals.lines_dropped += stats.lines_dropped;
        next.totals.records_written += stats.records_written;

        self.write(&next)?;
        self.checkpoint = next;
        self.state = CheckpointState::Checkpointed;
        Ok(())
    }

    pub fn mark_stopped(&mut self) {
        info!(
            last_committed_batch = ?self.checkpoint.last_committed_batch,
            "Checkpoint manager stopped"
        );
        self.state = CheckpointState::Stopped;
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(CHECKPOINT_FILE);
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> EngineConfig {
        EngineConfig {
            checkpoint_dir: tmp.path().join("checkpoint"),
            output_dir: tmp.path().join("out"),
            ..Default::default()
        }
    }

    fn stats(records: u64) -> BatchStats {
        BatchStats {
            lines_received: records + 1,
            lines_dropped: 1,
            records_written: records,
        }
    }

    #[test]
    fn test_fresh_start() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let mut manager = CheckpointManager::open(&cfg.checkpoint_dir, cfg.clone()).unwrap();

        assert_eq!(manager.state(), CheckpointState::Fresh);
        assert_eq!(manager.next_batch_id(), 0);
        assert!(!manager.is_committed(0));

        manager.mark_running();
        assert_eq!(manager.state(), CheckpointState::Running);
        // Nothing is written until the first commit
        assert!(!cfg.checkpoint_dir.join(CHECKPOINT_FILE).exists());
    }

    #[test]
    fn test_commit_then_recover() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let mut manager = CheckpointManager::open(&cfg.checkpoint_dir, cfg.clone()).unwrap();
        manager.mark_running();
        manager.commit(0, stats(2)).unwrap();
        manager.commit(1, stats(3)).unwrap();
        assert_eq!(manager.state(), CheckpointState::Checkpointed);
        assert!(!cfg.checkpoint_dir.join("checkpoint.json.tmp").exists());
        drop(manager);

        let recovered = CheckpointManager::open(&cfg.checkpoint_dir, EngineConfig::default()).unwrap();
        assert_eq!(recovered.state(), CheckpointState::Recovering);
        assert_eq!(recovered.config(), &cfg);
        assert_eq!(recovered.last_committed_batch(), Some(1));
        assert_eq!(recovered.next_batch_id(), 2);
        assert!(recovered.is_committed(1));
        assert!(!recovered.is_committed(2));

        let totals = recovered.checkpoint().totals;
        assert_eq!(totals.batches, 2);
        assert_eq!(totals.records_written, 5);
        assert_eq!(totals.lines_dropped, 2);
    }

    #[test]
    fn test_duplicate_commit_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let mut manager = CheckpointManager::open(&cfg.checkpoint_dir, cfg.clone()).unwrap();
        manager.commit(0, stats(2)).unwrap();
        manager.commit(0, stats(2)).unwrap();
        assert_eq!(manager.checkpoint().totals.batches, 1);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let mut checkpoint = Checkpoint::new(cfg.clone());
        checkpoint.version = 99;
        std::fs::create_dir_all(&cfg.checkpoint_dir).unwrap();
        std::fs::write(
            cfg.checkpoint_dir.join(CHECKPOINT_FILE),
            serde_json::to_vec(&checkpoint).unwrap(),
        )
        .unwrap();

        let result = CheckpointManager::open(&cfg.checkpoint_dir.clone(), cfg);
        assert!(matches!(
            result,
            Err(CheckpointError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_reset_returns_to_fresh() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let mut manager = CheckpointManager::open(&cfg.checkpoint_dir, cfg.clone()).unwrap();
        manager.commit(0, stats(1)).unwrap();
        manager.mark_stopped();
        assert_eq!(manager.state(), CheckpointState::Stopped);

        CheckpointManager::reset(&cfg.checkpoint_dir).unwrap();
        let manager = CheckpointManager::open(&cfg.checkpoint_dir.clone(), cfg).unwrap();
        assert_eq!(manager.state(), CheckpointState::Fresh);
        assert_eq!(manager.next_batch_id(), 0);
    }
}
