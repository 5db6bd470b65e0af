//! Chunked regeneration of stale subject vectors.
//!
//! Attribute edits flag a subject's vector stale rather than
//! recomputing it inline; this module drains that backlog. Subjects
//! are walked in stable id order, embedded in fixed-size chunks, and
//! the batch checkpoint is committed after each chunk so a crash loses
//! at most the chunk in flight. A subject whose provider call fails
//! keeps its previous vector and stays flagged, so matching continues
//! on slightly outdated data instead of blocking.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{BatchStatus, ScanKind};
use crate::engine::MatchEngine;
use crate::error::EngineError;
use crate::metrics::metrics_recorder;
use crate::types::Subject;

/// What happened to one subject during a refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// A new vector was generated and stored. If the index refused the
    /// upsert the subject stays flagged stale so a later pass retries.
    Refreshed,
    /// The provider was unavailable; the previous vector stays in use
    /// and remains flagged stale for the next pass.
    StaleFallback,
    /// The vector was already fresh, nothing to do.
    SkippedFresh,
    /// The provider was unavailable and the subject has no previous
    /// vector to fall back on.
    Unavailable,
}

/// Outcome of one refresh batch invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub batch_id: String,
    /// Subjects examined by this invocation.
    pub processed: u64,
    pub refreshed: u64,
    pub stale_fallbacks: u64,
    pub skipped_fresh: u64,
    pub unavailable: u64,
    pub status: BatchStatus,
}

impl RefreshSummary {
    fn new(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            processed: 0,
            refreshed: 0,
            stale_fallbacks: 0,
            skipped_fresh: 0,
            unavailable: 0,
            status: BatchStatus::Running,
        }
    }

    fn record(&mut self, outcome: RefreshOutcome) {
        self.processed += 1;
        match outcome {
            RefreshOutcome::Refreshed => self.refreshed += 1,
            RefreshOutcome::StaleFallback => self.stale_fallbacks += 1,
            RefreshOutcome::SkippedFresh => self.skipped_fresh += 1,
            RefreshOutcome::Unavailable => self.unavailable += 1,
        }
    }
}

impl MatchEngine {
    /// Regenerate vectors for stale subjects, committing the batch
    /// checkpoint after every chunk.
    ///
    /// Re-running a completed batch id is a no-op; an interrupted
    /// batch resumes after its last checkpointed subject.
    pub async fn refresh_vectors(&self, batch_id: &str) -> Result<RefreshSummary, EngineError> {
        let now = Utc::now();
        let total = self.subjects().count().await?;

        let mut checkpoint = self
            .acquire_checkpoint(batch_id, ScanKind::VectorRefresh, total, now)
            .await?;
        let mut summary = RefreshSummary::new(batch_id);
        if checkpoint.status == BatchStatus::Completed {
            tracing::info!(batch_id, "batch already completed, nothing to do");
            summary.status = BatchStatus::Completed;
            return Ok(summary);
        }

        loop {
            if !self.guard_chunk_start(&mut checkpoint).await? {
                summary.status = BatchStatus::Failed;
                return Ok(summary);
            }
            let page = self
                .subjects()
                .page(checkpoint.cursor.as_deref(), self.config().refresh_chunk_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let done = page.len() < self.config().refresh_chunk_size;

            for subject in &page {
                let outcome = self.refresh_subject_vector(subject).await?;
                summary.record(outcome);
                if let Some(recorder) = metrics_recorder() {
                    recorder.record_refresh(&subject.id, outcome);
                }
            }

            if let Some(last) = page.last() {
                checkpoint.advance(last.id.clone(), page.len() as u64, Utc::now());
                if !self.commit_chunk(&mut checkpoint).await? {
                    summary.status = BatchStatus::Failed;
                    return Ok(summary);
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
            summary.status = BatchStatus::Failed;
            return Ok(summary);
        }
        summary.status = BatchStatus::Completed;
        tracing::info!(
            batch_id,
            refreshed = summary.refreshed,
            stale_fallbacks = summary.stale_fallbacks,
            "vector refresh completed"
        );
        Ok(summary)
    }

    /// Refresh a single subject's vector if it is stale or missing.
    pub(crate) async fn refresh_subject_vector(
        &self,
        subject: &Subject,
    ) -> Result<RefreshOutcome, EngineError> {
        if !subject.vector_stale && subject.vector.is_some() {
            return Ok(RefreshOutcome::SkippedFresh);
        }
        match self
            .embed_with_timeout(&subject.id, &subject.profile_text())
            .await
        {
            Ok(vector) => {
                self.subjects()
                    .save_vector(&subject.id, &vector, Utc::now())
                    .await?;
                if let Err(err) = self.index().upsert(&subject.id, &vector).await {
                    tracing::warn!(
                        subject_id = %subject.id,
                        error = %err,
                        "vector stored but index upsert failed, re-flagging stale"
                    );
                    self.subjects().mark_stale(&subject.id).await?;
                }
                Ok(RefreshOutcome::Refreshed)
            }
            Err(err) if err.is_unavailability() => {
                if subject.vector.is_some() {
                    tracing::warn!(
                        subject_id = %subject.id,
                        error = %err,
                        "embedding unavailable, keeping previous vector"
                    );
                    Ok(RefreshOutcome::StaleFallback)
                } else {
                    tracing::warn!(
                        subject_id = %subject.id,
                        error = %err,
                        "embedding unavailable and no previous vector"
                    );
                    Ok(RefreshOutcome::Unavailable)
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}
