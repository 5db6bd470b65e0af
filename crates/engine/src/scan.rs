//! Batch scans with crash-recoverable checkpoints.
//!
//! `daily_scan` walks rules, `full_rescan` walks subjects; both
//! process fixed-size chunks in stable id order and persist a
//! [`Checkpoint`] after each chunk, so a restart resumes strictly
//! after the last completed chunk instead of from zero. Before every
//! chunk the worker re-reads its checkpoint to honor external
//! cancellation and to detect that another worker reclaimed the batch.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{BatchStatus, Checkpoint, ScanKind};
use crate::engine::{MatchEngine, PassHealth};
use crate::error::{EngineError, StoreError};
use crate::metrics::metrics_recorder;

/// Outcome of one batch scan invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub batch_id: String,
    pub kind: ScanKind,
    /// Items processed by this invocation; resumed work is excluded.
    pub processed_now: u64,
    /// Cumulative items processed across all invocations of the batch.
    pub processed_total: u64,
    /// Match results written by this invocation.
    pub results_upserted: u64,
    pub status: BatchStatus,
    /// True when any item degraded to structured-only matching.
    pub degraded: bool,
}

impl ScanSummary {
    fn from_checkpoint(
        checkpoint: &Checkpoint,
        processed_now: u64,
        results_upserted: u64,
        degraded: bool,
    ) -> Self {
        Self {
            batch_id: checkpoint.batch_id.clone(),
            kind: checkpoint.kind,
            processed_now,
            processed_total: checkpoint.processed,
            results_upserted,
            status: checkpoint.status,
            degraded,
        }
    }
}

impl MatchEngine {
    /// Match every active rule against all subjects, in chunks.
    ///
    /// Re-running a completed batch id is a no-op. A batch interrupted
    /// mid-way resumes after its last checkpointed rule.
    pub async fn daily_scan(&self, batch_id: &str) -> Result<ScanSummary, EngineError> {
        let now = Utc::now();
        let rules = self.load_active_rules(now).await?;
        let total = rules.len() as u64;

        let mut checkpoint = self
            .acquire_checkpoint(batch_id, ScanKind::DailyScan, total, now)
            .await?;
        if checkpoint.status == BatchStatus::Completed {
            tracing::info!(batch_id, "batch already completed, nothing to do");
            return Ok(ScanSummary::from_checkpoint(&checkpoint, 0, 0, false));
        }

        let pending: Vec<_> = rules
            .iter()
            .filter(|rule| match checkpoint.cursor.as_deref() {
                Some(cursor) => rule.id.as_str() > cursor,
                None => true,
            })
            .collect();

        let mut processed_now = 0u64;
        let mut upserted = 0u64;
        let mut health = PassHealth::default();

        for chunk in pending.chunks(self.config().scan_chunk_size) {
            if !self.guard_chunk_start(&mut checkpoint).await? {
                return Ok(ScanSummary::from_checkpoint(
                    &checkpoint,
                    processed_now,
                    upserted,
                    health.degraded(),
                ));
            }
            for rule in chunk {
                match self.match_rule_inner(rule, Utc::now()).await {
                    Ok((results, rule_health)) => {
                        health.merge(rule_health);
                        upserted += results.len() as u64;
                    }
                    Err(err) if is_pair_local(&err) => {
                        tracing::warn!(rule_id = %rule.id, error = %err, "skipping rule");
                    }
                    Err(err) => return Err(err),
                }
                processed_now += 1;
                if health.embedding_unavailable && health.index_unavailable {
                    // Nothing semantic can be computed anywhere. Fail
                    // the batch with the cursor at the last committed
                    // chunk; any worker may take it over right away.
                    self.abort_batch(&mut checkpoint).await;
                    return Err(EngineError::SystemicOutage(
                        "embedding provider and vector index both unavailable".into(),
                    ));
                }
            }
            if let Some(last) = chunk.last() {
                checkpoint.advance(last.id.clone(), chunk.len() as u64, Utc::now());
                if !self.commit_chunk(&mut checkpoint).await? {
                    return Ok(ScanSummary::from_checkpoint(
                        &checkpoint,
                        processed_now,
                        upserted,
                        health.degraded(),
                    ));
                }
                if let Some(recorder) = metrics_recorder() {
                    recorder.record_scan_chunk(batch_id, chunk.len() as u64, checkpoint.processed);
                }
            }
        }

        checkpoint.complete(Utc::now());
        if !self.commit_chunk(&mut checkpoint).await? {
            return Ok(ScanSummary::from_checkpoint(
                &checkpoint,
                processed_now,
                upserted,
                health.degraded(),
            ));
        }
        tracing::info!(
            batch_id,
            processed = checkpoint.processed,
            upserted,
            "daily scan completed"
        );
        Ok(ScanSummary::from_checkpoint(
            &checkpoint,
            processed_now,
            upserted,
            health.degraded(),
        ))
    }

    /// Recompute matches for every subject against all active rules.
    ///
    /// Subject-driven counterpart of [`Self::daily_scan`], typically
    /// run after bulk attribute imports.
    pub async fn full_rescan(&self, batch_id: &str) -> Result<ScanSummary, EngineError> {
        let now = Utc::now();
        let total = self.subjects().count().await?;

        let mut checkpoint = self
            .acquire_checkpoint(batch_id, ScanKind::FullRescan, total, now)
            .await?;
        if checkpoint.status == BatchStatus::Completed {
            tracing::info!(batch_id, "batch already completed, nothing to do");
            return Ok(ScanSummary::from_checkpoint(&checkpoint, 0, 0, false));
        }

        let mut processed_now = 0u64;
        let mut upserted = 0u64;
        let mut health = PassHealth::default();

        loop {
            if !self.guard_chunk_start(&mut checkpoint).await? {
                return Ok(ScanSummary::from_checkpoint(
                    &checkpoint,
                    processed_now,
                    upserted,
                    health.degraded(),
                ));
            }
            let page = self
                .subjects()
                .page(checkpoint.cursor.as_deref(), self.config().scan_chunk_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let done = page.len() < self.config().scan_chunk_size;

            for subject in &page {
                match self.match_subject_inner(subject, Utc::now()).await {
                    Ok((results, subject_health)) => {
                        health.merge(subject_health);
                        upserted += results.len() as u64;
                    }
                    Err(err) if is_pair_local(&err) => {
                        tracing::warn!(subject_id = %subject.id, error = %err, "skipping subject");
                    }
                    Err(err) => return Err(err),
                }
                processed_now += 1;
            }

            if let Some(last) = page.last() {
                checkpoint.advance(last.id.clone(), page.len() as u64, Utc::now());
                if !self.commit_chunk(&mut checkpoint).await? {
                    return Ok(ScanSummary::from_checkpoint(
                        &checkpoint,
                        processed_now,
                        upserted,
                        health.degraded(),
                    ));
                }
                if let Some(recorder) = metrics_recorder() {
                    recorder.record_scan_chunk(batch_id, page.len() as u64, checkpoint.processed);
                }
            }
            if done {
                break;
            }
        }

        checkpoint.complete(Utc::now());
        if !self.commit_chunk(&mut checkpoint).await? {
            return Ok(ScanSummary::from_checkpoint(
                &checkpoint,
                processed_now,
                upserted,
                health.degraded(),
            ));
        }
        tracing::info!(
            batch_id,
            processed = checkpoint.processed,
            upserted,
            "full rescan completed"
        );
        Ok(ScanSummary::from_checkpoint(
            &checkpoint,
            processed_now,
            upserted,
            health.degraded(),
        ))
    }

    /// Mark a batch `FAILED` so its worker stops at the next chunk
    /// boundary, leaving the checkpoint at its last valid chunk.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<(), EngineError> {
        let Some(mut checkpoint) = self.checkpoints().get(batch_id).await? else {
            return Err(EngineError::Store(StoreError::Backend(format!(
                "checkpoint {batch_id} not found"
            ))));
        };
        if checkpoint.status.is_terminal() {
            return Ok(());
        }
        checkpoint.fail(Utc::now());
        self.save_checkpoint(&mut checkpoint).await
    }

    /// Batches whose checkpoints have gone quiet past the configured
    /// stall timeout. Supervisors poll this and restart what it
    /// returns; workers never race for a stalled batch themselves.
    pub async fn stalled_batches(&self) -> Result<Vec<Checkpoint>, EngineError> {
        let now = Utc::now();
        let checkpoints = self.checkpoints().list().await?;
        Ok(checkpoints
            .into_iter()
            .filter(|cp| cp.is_stalled(now, self.config().stall_timeout))
            .collect())
    }

    /// Load or create the checkpoint for `batch_id` and take ownership
    /// of it. Running batches owned by a live worker are refused;
    /// stalled ones are taken over.
    pub(crate) async fn acquire_checkpoint(
        &self,
        batch_id: &str,
        kind: ScanKind,
        total: u64,
        now: chrono::DateTime<Utc>,
    ) -> Result<Checkpoint, EngineError> {
        let worker_id = self.config().worker_id.clone();
        match self.checkpoints().get(batch_id).await? {
            None => {
                let mut checkpoint = Checkpoint::new(batch_id, kind, &worker_id, total, now);
                self.save_checkpoint(&mut checkpoint).await?;
                checkpoint.start(&worker_id, now);
                self.save_checkpoint(&mut checkpoint).await?;
                Ok(checkpoint)
            }
            Some(checkpoint) if checkpoint.kind != kind => Err(EngineError::InvalidConfig(
                format!("batch {batch_id} already exists with a different scan kind"),
            )),
            Some(checkpoint) if checkpoint.status == BatchStatus::Completed => Ok(checkpoint),
            Some(mut checkpoint) => {
                if checkpoint.status == BatchStatus::Running
                    && checkpoint.owner != worker_id
                    && !checkpoint.is_stalled(now, self.config().stall_timeout)
                {
                    return Err(EngineError::BatchOwned {
                        batch_id: batch_id.to_string(),
                        owner: checkpoint.owner,
                    });
                }
                if checkpoint.owner != worker_id {
                    tracing::warn!(
                        batch_id,
                        previous_owner = %checkpoint.owner,
                        "taking over abandoned batch"
                    );
                }
                checkpoint.total = total;
                checkpoint.start(&worker_id, now);
                self.save_checkpoint(&mut checkpoint).await?;
                Ok(checkpoint)
            }
        }
    }

    /// Mark the checkpoint `FAILED` when a scan aborts. Save failures
    /// are logged, not returned; the abort cause is the error the
    /// caller reports.
    async fn abort_batch(&self, checkpoint: &mut Checkpoint) {
        checkpoint.fail(Utc::now());
        if let Err(err) = self.save_checkpoint(checkpoint).await {
            tracing::warn!(
                batch_id = %checkpoint.batch_id,
                error = %err,
                "could not persist failed checkpoint"
            );
        }
    }

    /// Re-read the checkpoint before a chunk. Returns `false` when the
    /// batch was cancelled externally; errors when another worker owns
    /// the batch or this worker itself went quiet past the stall
    /// timeout.
    pub(crate) async fn guard_chunk_start(
        &self,
        checkpoint: &mut Checkpoint,
    ) -> Result<bool, EngineError> {
        let now = Utc::now();
        let Some(stored) = self.checkpoints().get(&checkpoint.batch_id).await? else {
            return Err(EngineError::Store(StoreError::Backend(format!(
                "checkpoint {} disappeared mid-batch",
                checkpoint.batch_id
            ))));
        };
        // Cancellation wins over everything else, including the version
        // bump the cancel itself caused.
        if stored.status == BatchStatus::Failed {
            tracing::info!(
                batch_id = %checkpoint.batch_id,
                "batch cancelled, stopping at chunk boundary"
            );
            checkpoint.status = BatchStatus::Failed;
            return Ok(false);
        }
        if stored.version != checkpoint.version {
            return Err(EngineError::CheckpointConflict {
                batch_id: checkpoint.batch_id.clone(),
                expected: checkpoint.version,
                found: stored.version,
            });
        }
        if stored.is_stalled(now, self.config().stall_timeout) {
            return Err(EngineError::BatchStalled {
                batch_id: checkpoint.batch_id.clone(),
                idle_secs: stored.idle_seconds(now),
            });
        }
        Ok(true)
    }

    /// Persist an advanced chunk. Returns `false` when the save lost to
    /// an external cancellation, which ends the batch cleanly; any
    /// other writer winning the race is a real conflict.
    pub(crate) async fn commit_chunk(
        &self,
        checkpoint: &mut Checkpoint,
    ) -> Result<bool, EngineError> {
        match self.save_checkpoint(checkpoint).await {
            Ok(()) => Ok(true),
            Err(conflict @ EngineError::CheckpointConflict { .. }) => {
                let stored = self.checkpoints().get(&checkpoint.batch_id).await?;
                if stored.map(|cp| cp.status) == Some(BatchStatus::Failed) {
                    tracing::info!(
                        batch_id = %checkpoint.batch_id,
                        "batch cancelled, stopping at chunk boundary"
                    );
                    checkpoint.status = BatchStatus::Failed;
                    return Ok(false);
                }
                Err(conflict)
            }
            Err(err) => Err(err),
        }
    }

    /// CAS save that keeps the local version in step with the store.
    pub(crate) async fn save_checkpoint(
        &self,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), EngineError> {
        let expected = match checkpoint.version {
            0 => None,
            version => Some(version),
        };
        match self.checkpoints().save(checkpoint, expected).await {
            Ok(version) => {
                checkpoint.version = version;
                Ok(())
            }
            Err(StoreError::VersionConflict { expected, found }) => {
                Err(EngineError::CheckpointConflict {
                    batch_id: checkpoint.batch_id.clone(),
                    expected,
                    found,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn is_pair_local(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Rule(_) | EngineError::MatchComputation { .. }
    )
}
