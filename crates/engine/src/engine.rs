use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use criteria::{evaluate_detailed, validate, Evaluation};
use embedding::{EmbeddingError, TextEmbedder};
use index::{IndexError, Neighbor, VectorIndex};
use lru::LruCache;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::metrics_recorder;
use crate::store::{CheckpointStore, MatchResultStore, RuleStore, SubjectStore};
use crate::types::{MatchKind, MatchResult, Rule, Subject};

#[cfg(test)]
mod tests;

/// Availability of the semantic machinery during one matching pass.
///
/// Either flag set means the pass degraded to structured-only for at
/// least part of its work. Batch scans combine these across rules to
/// detect a systemic outage.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PassHealth {
    pub embedding_unavailable: bool,
    pub index_unavailable: bool,
}

impl PassHealth {
    pub fn degraded(self) -> bool {
        self.embedding_unavailable || self.index_unavailable
    }

    pub fn merge(&mut self, other: PassHealth) {
        self.embedding_unavailable |= other.embedding_unavailable;
        self.index_unavailable |= other.index_unavailable;
    }
}

struct CachedRuleVector {
    fingerprint: u64,
    vector: Vec<f32>,
}

/// Hybrid criteria/semantic matching orchestrator.
///
/// Composes the criteria evaluator, the embedding provider, and the
/// vector index over narrow store interfaces. Both entry points
/// produce the same kind of ranked, deduplicated, idempotently
/// persisted [`MatchResult`] sets.
pub struct MatchEngine {
    config: EngineConfig,
    subjects: Arc<dyn SubjectStore>,
    rules: Arc<dyn RuleStore>,
    results: Arc<dyn MatchResultStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    embedder: Arc<dyn TextEmbedder>,
    index: Arc<dyn VectorIndex>,
    rule_vectors: Mutex<LruCache<String, CachedRuleVector>>,
}

impl std::fmt::Debug for MatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        subjects: Arc<dyn SubjectStore>,
        rules: Arc<dyn RuleStore>,
        results: Arc<dyn MatchResultStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        embedder: Arc<dyn TextEmbedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cache_size = NonZeroUsize::new(config.rule_vector_cache_size).ok_or_else(|| {
            EngineError::InvalidConfig("rule_vector_cache_size must be greater than zero".into())
        })?;
        Ok(Self {
            config,
            subjects,
            rules,
            results,
            checkpoints,
            embedder,
            index,
            rule_vectors: Mutex::new(LruCache::new(cache_size)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn subjects(&self) -> &Arc<dyn SubjectStore> {
        &self.subjects
    }

    pub(crate) fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub(crate) fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Match one rule against every stored subject.
    ///
    /// Runs the structured pass first, then refines with a semantic
    /// pass using the rule's cached descriptive vector. Results are
    /// ranked, deduplicated, and upserted; re-running against the same
    /// data is idempotent.
    pub async fn match_rule_against_all_subjects(
        &self,
        rule: &Rule,
    ) -> Result<Vec<MatchResult>, EngineError> {
        let (results, _) = self.match_rule_inner(rule, Utc::now()).await?;
        Ok(results)
    }

    /// Symmetric traversal used when a subject's attributes change and
    /// its matches must be recomputed against every active rule.
    pub async fn match_subject_against_all_rules(
        &self,
        subject: &Subject,
    ) -> Result<Vec<MatchResult>, EngineError> {
        let (results, _) = self.match_subject_inner(subject, Utc::now()).await?;
        Ok(results)
    }

    pub(crate) async fn match_rule_inner(
        &self,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MatchResult>, PassHealth), EngineError> {
        let start = Instant::now();
        let mut health = PassHealth::default();

        // A rule outside its validity window yields nothing, with no
        // error and no store writes.
        if !rule.is_active_at(now) {
            tracing::debug!(rule_id = %rule.id, "rule outside validity window");
            return Ok((Vec::new(), health));
        }
        validate(&rule.condition)?;

        // Structured pass over every subject, paged in stable id order.
        let mut structured: BTreeMap<String, Evaluation> = BTreeMap::new();
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        let mut stale_flags: BTreeMap<String, bool> = BTreeMap::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .subjects
                .page(cursor.as_deref(), self.config.scan_chunk_size)
                .await?;
            let done = page.len() < self.config.scan_chunk_size;
            cursor = page.last().map(|subject| subject.id.clone());
            for subject in page {
                let evaluation = evaluate_detailed(&rule.condition, &subject.attributes);
                // A match established purely by absent fields is not
                // structural evidence; the subject falls through to
                // the semantic pass like any non-match.
                if evaluation.matched && !evaluation.all_fields_missing() {
                    labels.insert(subject.id.clone(), subject.display_name.clone());
                    stale_flags.insert(subject.id.clone(), subject.vector_stale);
                    structured.insert(subject.id.clone(), evaluation);
                }
            }
            if done {
                break;
            }
        }

        // Semantic pass. Unavailability of the embedding provider or
        // the index degrades to structured-only instead of failing.
        let mut semantic_hits: Vec<Neighbor> = Vec::new();
        match self.rule_vector(rule).await {
            Ok(vector) => match self.query_index(&vector).await {
                Ok(hits) => semantic_hits = hits,
                Err(err) => {
                    health.index_unavailable = true;
                    tracing::warn!(
                        rule_id = %rule.id,
                        error = %err,
                        "index unavailable, continuing structured-only"
                    );
                }
            },
            Err(err) if err.is_unavailability() => {
                health.embedding_unavailable = true;
                tracing::warn!(
                    rule_id = %rule.id,
                    error = %err,
                    "rule vector unavailable, continuing structured-only"
                );
            }
            Err(err) => return Err(err.into()),
        }

        let mut merged: BTreeMap<String, MatchResult> = BTreeMap::new();
        for (subject_id, evaluation) in &structured {
            merged.insert(
                subject_id.clone(),
                MatchResult {
                    subject_id: subject_id.clone(),
                    rule_id: rule.id.clone(),
                    score: self.structured_score(evaluation),
                    kind: MatchKind::Structured,
                    matched_attributes: evaluation.matched_fields.iter().cloned().collect(),
                    stale_vector: false,
                    computed_at: now,
                },
            );
        }

        for hit in semantic_hits {
            if !hit.similarity.is_finite() {
                tracing::warn!(
                    subject_id = %hit.subject_id,
                    rule_id = %rule.id,
                    "non-finite similarity, skipping pair"
                );
                continue;
            }
            if hit.similarity < self.config.min_similarity {
                continue;
            }
            let semantic_score = self.semantic_score(hit.similarity);
            if let Some(existing) = merged.get_mut(&hit.subject_id) {
                // Matched both ways: one HYBRID row, higher score,
                // union of evidence. The semantic cap keeps the
                // structured score on top.
                existing.kind = MatchKind::Hybrid;
                existing.score = existing.score.max(semantic_score);
                existing.stale_vector = stale_flags.get(&hit.subject_id).copied().unwrap_or(false);
                continue;
            }
            // Index entries can outlive their subject.
            let Some(subject) = self.subjects.get(&hit.subject_id).await? else {
                tracing::debug!(
                    subject_id = %hit.subject_id,
                    "semantic hit without a stored subject, skipping"
                );
                continue;
            };
            labels.insert(subject.id.clone(), subject.display_name.clone());
            merged.insert(
                hit.subject_id.clone(),
                MatchResult {
                    subject_id: hit.subject_id.clone(),
                    rule_id: rule.id.clone(),
                    score: semantic_score,
                    kind: MatchKind::Semantic,
                    matched_attributes: Vec::new(),
                    stale_vector: subject.vector_stale,
                    computed_at: now,
                },
            );
        }

        let results = rank_results(merged.into_values().collect(), |result| {
            (
                rule.priority,
                labels.get(&result.subject_id).cloned().unwrap_or_default(),
            )
        });

        self.persist_rule_results(&rule.id, &results).await?;

        if let Some(recorder) = metrics_recorder() {
            recorder.record_rule_match(&rule.id, start.elapsed(), results.len(), health.degraded());
        }
        Ok((results, health))
    }

    pub(crate) async fn match_subject_inner(
        &self,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MatchResult>, PassHealth), EngineError> {
        let start = Instant::now();
        let mut health = PassHealth::default();
        let rules = self.load_active_rules(now).await?;

        let mut merged: BTreeMap<String, MatchResult> = BTreeMap::new();
        let mut rule_keys: BTreeMap<String, (i32, String)> = BTreeMap::new();

        for rule in &rules {
            rule_keys.insert(rule.id.clone(), (rule.priority, rule.name.clone()));

            let evaluation = evaluate_detailed(&rule.condition, &subject.attributes);
            let mut result = if evaluation.matched && !evaluation.all_fields_missing() {
                Some(MatchResult {
                    subject_id: subject.id.clone(),
                    rule_id: rule.id.clone(),
                    score: self.structured_score(&evaluation),
                    kind: MatchKind::Structured,
                    matched_attributes: evaluation.matched_fields.iter().cloned().collect(),
                    stale_vector: false,
                    computed_at: now,
                })
            } else {
                None
            };

            // Semantic refinement compares the subject's own vector to
            // the rule's descriptive vector; no index round-trip is
            // needed for a single subject. After the first provider
            // failure the remaining rules skip the semantic step.
            if let Some(vector) = subject.vector.as_ref() {
                if !health.embedding_unavailable {
                    match self.rule_vector(rule).await {
                        Ok(rule_vector) => {
                            // A stored vector that predates the current
                            // embedding dimension cannot be scored;
                            // the previous result set stays untouched
                            // until the vector is regenerated.
                            if vector.len() != rule_vector.len() {
                                return Err(EngineError::MatchComputation {
                                    subject_id: subject.id.clone(),
                                    rule_id: rule.id.clone(),
                                    reason: format!(
                                        "subject vector dimension {} does not match rule vector dimension {}",
                                        vector.len(),
                                        rule_vector.len()
                                    ),
                                });
                            }
                            let similarity = cosine_similarity(vector, &rule_vector);
                            if similarity >= self.config.min_similarity {
                                let semantic_score = self.semantic_score(similarity);
                                match result.as_mut() {
                                    Some(existing) => {
                                        existing.kind = MatchKind::Hybrid;
                                        existing.score = existing.score.max(semantic_score);
                                        existing.stale_vector = subject.vector_stale;
                                    }
                                    None => {
                                        result = Some(MatchResult {
                                            subject_id: subject.id.clone(),
                                            rule_id: rule.id.clone(),
                                            score: semantic_score,
                                            kind: MatchKind::Semantic,
                                            matched_attributes: Vec::new(),
                                            stale_vector: subject.vector_stale,
                                            computed_at: now,
                                        });
                                    }
                                }
                            }
                        }
                        Err(err) if err.is_unavailability() => {
                            health.embedding_unavailable = true;
                            tracing::warn!(
                                subject_id = %subject.id,
                                rule_id = %rule.id,
                                error = %err,
                                "rule vector unavailable, continuing structured-only"
                            );
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }

            if let Some(result) = result {
                merged.insert(rule.id.clone(), result);
            }
        }

        let results = rank_results(merged.into_values().collect(), |result| {
            rule_keys
                .get(&result.rule_id)
                .cloned()
                .unwrap_or((i32::MAX, String::new()))
        });

        let kept: BTreeSet<String> = results.iter().map(|r| r.rule_id.clone()).collect();
        for result in &results {
            self.results.upsert(result).await?;
        }
        let removed = self.results.remove_for_subject(&subject.id, &kept).await?;
        if removed > 0 {
            tracing::debug!(
                subject_id = %subject.id,
                removed,
                "removed results that no longer hold"
            );
        }

        if let Some(recorder) = metrics_recorder() {
            recorder.record_subject_match(
                &subject.id,
                start.elapsed(),
                results.len(),
                health.degraded(),
            );
        }
        Ok((results, health))
    }

    /// Rules that pass load-time validation and sit inside their
    /// validity window, in stable id order. A malformed condition tree
    /// rejects its rule here, before any evaluation, so it can never
    /// silently match nothing during a live pass.
    pub(crate) async fn load_active_rules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Rule>, EngineError> {
        let mut rules = self.rules.active_rules().await?;
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        let mut active = Vec::with_capacity(rules.len());
        for rule in rules {
            if !rule.is_active_at(now) {
                continue;
            }
            match validate(&rule.condition) {
                Ok(()) => active.push(rule),
                Err(err) => {
                    tracing::warn!(rule_id = %rule.id, error = %err, "rejecting malformed rule");
                }
            }
        }
        Ok(active)
    }

    async fn persist_rule_results(
        &self,
        rule_id: &str,
        results: &[MatchResult],
    ) -> Result<(), EngineError> {
        let mut kept: BTreeSet<String> = BTreeSet::new();
        for result in results {
            kept.insert(result.subject_id.clone());
            self.results.upsert(result).await?;
        }
        let removed = self.results.remove_for_rule(rule_id, &kept).await?;
        if removed > 0 {
            tracing::debug!(rule_id, removed, "removed results that no longer hold");
        }
        Ok(())
    }

    /// Descriptive vector for a rule, embedded once and cached until
    /// the rule's wording changes.
    pub(crate) async fn rule_vector(&self, rule: &Rule) -> Result<Vec<f32>, EmbeddingError> {
        let fingerprint = rule.descriptive_fingerprint();
        if let Ok(mut cache) = self.rule_vectors.lock() {
            if let Some(cached) = cache.get(&rule.id) {
                if cached.fingerprint == fingerprint {
                    return Ok(cached.vector.clone());
                }
            }
        }

        let vector = self
            .embed_with_timeout(&rule.id, &rule.descriptive_text())
            .await?;
        if let Ok(mut cache) = self.rule_vectors.lock() {
            cache.put(
                rule.id.clone(),
                CachedRuleVector {
                    fingerprint,
                    vector: vector.clone(),
                },
            );
        }
        Ok(vector)
    }

    /// Embedding call under the configured hard timeout. An elapsed
    /// timeout counts as provider unavailability.
    pub(crate) async fn embed_with_timeout(
        &self,
        id: &str,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        match tokio::time::timeout(self.config.embed_timeout, self.embedder.embed(id, text)).await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::Unavailable {
                attempts: 1,
                last_error: format!(
                    "embedding call exceeded {}ms",
                    self.config.embed_timeout.as_millis()
                ),
            }),
        }
    }

    /// Index query under the configured hard timeout. An elapsed
    /// timeout counts as index unavailability.
    async fn query_index(&self, vector: &[f32]) -> Result<Vec<Neighbor>, IndexError> {
        match tokio::time::timeout(
            self.config.index_timeout,
            self.index.query(vector, self.config.top_k),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(IndexError::Unavailable(format!(
                "query exceeded {}ms",
                self.config.index_timeout.as_millis()
            ))),
        }
    }

    fn structured_score(&self, evaluation: &Evaluation) -> f32 {
        let decay = self.config.missing_attribute_decay * evaluation.missing_fields.len() as f32;
        (1.0 - decay).max(self.config.structured_floor).min(1.0)
    }

    fn semantic_score(&self, similarity: f32) -> f32 {
        similarity.clamp(0.0, self.config.semantic_cap)
    }
}

/// Total order for ranked output: score descending, then the caller's
/// `(priority, label)` key, then ids. Never insertion or hash order,
/// so equal inputs rank identically across runs.
fn rank_results(
    results: Vec<MatchResult>,
    mut key: impl FnMut(&MatchResult) -> (i32, String),
) -> Vec<MatchResult> {
    let mut keyed: Vec<((i32, String), MatchResult)> =
        results.into_iter().map(|r| (key(&r), r)).collect();
    keyed.sort_by(|(ka, a), (kb, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| ka.0.cmp(&kb.0))
            .then_with(|| ka.1.cmp(&kb.1))
            .then_with(|| a.subject_id.cmp(&b.subject_id))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
    keyed.into_iter().map(|(_, result)| result).collect()
}

/// Cosine similarity clamped to `[0, 1]`, mirroring how the index
/// reports neighbor similarity under its cosine metric.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}
