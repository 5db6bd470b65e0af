//! Crash-recoverable progress markers for batch scans.
//!
//! A checkpoint is an explicit, versioned state object persisted after
//! every chunk. The version implements an optimistic single-writer
//! discipline: each save names the version it expects, and a mismatch
//! means another worker advanced or reclaimed the batch. Stalled
//! batches (`RUNNING` with an old `updated_at`) are reclaimed by a
//! supervisor, never raced for by workers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a batch: `PENDING -> RUNNING -> {COMPLETED | FAILED}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Whether the batch has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

/// What a batch iterates over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Rule-driven scan: every active rule against all subjects.
    DailyScan,
    /// Subject-driven scan: every subject against all active rules.
    FullRescan,
    /// Regenerate stale subject vectors in chunks.
    VectorRefresh,
}

/// Persisted progress of one batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub batch_id: String,
    pub kind: ScanKind,
    /// Id of the last fully processed item; iteration resumes strictly
    /// after it. `None` means nothing processed yet.
    #[serde(default)]
    pub cursor: Option<String>,
    pub processed: u64,
    pub total: u64,
    pub status: BatchStatus,
    /// Bumped by the store on every successful save.
    pub version: u64,
    /// Worker currently entitled to advance this checkpoint.
    pub owner: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        batch_id: impl Into<String>,
        kind: ScanKind,
        owner: impl Into<String>,
        total: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            kind,
            cursor: None,
            processed: 0,
            total,
            status: BatchStatus::Pending,
            version: 0,
            owner: owner.into(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Record a completed chunk. The cursor only ever moves forward;
    /// a regression is ignored so replays cannot rewind progress.
    pub fn advance(&mut self, cursor: impl Into<String>, processed_delta: u64, now: DateTime<Utc>) {
        let cursor = cursor.into();
        let moves_forward = match &self.cursor {
            Some(current) => cursor.as_str() > current.as_str(),
            None => true,
        };
        if moves_forward {
            self.cursor = Some(cursor);
            self.processed += processed_delta;
        }
        self.updated_at = now;
    }

    pub fn start(&mut self, owner: impl Into<String>, now: DateTime<Utc>) {
        self.status = BatchStatus::Running;
        self.owner = owner.into();
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = BatchStatus::Completed;
        self.updated_at = now;
    }

    pub fn fail(&mut self, now: DateTime<Utc>) {
        self.status = BatchStatus::Failed;
        self.updated_at = now;
    }

    /// A `RUNNING` batch whose checkpoint has not moved within
    /// `stall_timeout` is abandoned and eligible for reclaim.
    pub fn is_stalled(&self, now: DateTime<Utc>, stall_timeout: Duration) -> bool {
        if self.status != BatchStatus::Running {
            return false;
        }
        let idle = now.signed_duration_since(self.updated_at);
        match chrono::Duration::from_std(stall_timeout) {
            Ok(timeout) => idle > timeout,
            Err(_) => false,
        }
    }

    /// Seconds since the last checkpoint update, saturating at zero.
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.updated_at)
            .num_seconds()
            .max(0) as u64
    }
}
