use super::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use criteria::{CompareOp, ConditionNode};
use serde_json::json;

use crate::metrics::{set_engine_metrics, EngineMetrics};
use crate::refresh::RefreshOutcome;
use crate::store::{
    InMemoryCheckpointStore, InMemoryMatchResultStore, InMemoryRuleStore, InMemorySubjectStore,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 14, 8, 0, 0).unwrap()
}

/// Embedder returning prescribed vectors keyed by id, counting calls.
struct FixedEmbedder {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

impl FixedEmbedder {
    fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_vector(mut self, id: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(id.to_string(), vector);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, subject_id: &str, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        match self.vectors.get(subject_id) {
            Some(vector) => Ok(vector.clone()),
            None => Ok(vec![0.5; self.dimension]),
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

struct FailingEmbedder;

#[async_trait]
impl TextEmbedder for FailingEmbedder {
    async fn embed(&self, _subject_id: &str, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable {
            attempts: 3,
            last_error: "connection refused".into(),
        })
    }

    fn dimension(&self) -> usize {
        4
    }
}

struct SlowEmbedder;

#[async_trait]
impl TextEmbedder for SlowEmbedder {
    async fn embed(&self, _subject_id: &str, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok(vec![1.0, 0.0])
    }

    fn dimension(&self) -> usize {
        2
    }
}

/// Index stub returning canned neighbors regardless of the query.
#[derive(Default)]
struct FakeIndex {
    hits: Vec<Neighbor>,
    fail_queries: bool,
}

impl FakeIndex {
    fn with_hits(hits: Vec<(&str, f32)>) -> Self {
        Self {
            hits: hits
                .into_iter()
                .map(|(subject_id, similarity)| Neighbor {
                    subject_id: subject_id.to_string(),
                    similarity,
                })
                .collect(),
            fail_queries: false,
        }
    }

    fn failing() -> Self {
        Self {
            hits: Vec::new(),
            fail_queries: true,
        }
    }
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn upsert(&self, _subject_id: &str, _vector: &[f32]) -> Result<(), IndexError> {
        Ok(())
    }

    async fn query(&self, _vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if self.fail_queries {
            return Err(IndexError::Unavailable("index offline".into()));
        }
        Ok(self.hits.iter().take(top_k).cloned().collect())
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(self.hits.len())
    }
}

struct Fixture {
    engine: MatchEngine,
    subjects: Arc<InMemorySubjectStore>,
    rules: Arc<InMemoryRuleStore>,
    results: Arc<InMemoryMatchResultStore>,
}

fn fixture(embedder: Arc<dyn TextEmbedder>, index: Arc<dyn VectorIndex>) -> Fixture {
    fixture_with_config(EngineConfig::default(), embedder, index)
}

fn fixture_with_config(
    config: EngineConfig,
    embedder: Arc<dyn TextEmbedder>,
    index: Arc<dyn VectorIndex>,
) -> Fixture {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let rules = Arc::new(InMemoryRuleStore::new());
    let results = Arc::new(InMemoryMatchResultStore::new());
    let engine = MatchEngine::new(
        config,
        subjects.clone(),
        rules.clone(),
        results.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        embedder,
        index,
    )
    .expect("engine init");
    Fixture {
        engine,
        subjects,
        rules,
        results,
    }
}

fn forfettario_rule() -> Rule {
    Rule::new(
        "rule-forfettario",
        "Forfettario regime",
        ConditionNode::comparison("regime", CompareOp::Eq, json!("FORFETTARIO")),
    )
}

fn seed_forfettario_subjects(subjects: &InMemorySubjectStore) {
    subjects.insert(
        Subject::new("subj-a", "Alfa Consulting")
            .with_attribute("regime", json!("FORFETTARIO"))
            .with_attribute("employees", json!(4)),
    );
    subjects.insert(
        Subject::new("subj-b", "Bravo Logistics")
            .with_attribute("regime", json!("ORDINARIO"))
            .with_attribute("employees", json!(40)),
    );
    subjects.insert(
        Subject::new("subj-c", "Carani Studio")
            .with_attribute("regime", json!(null))
            .with_attribute("employees", json!(null)),
    );
}

#[tokio::test]
async fn structured_and_semantic_passes_compose() -> Result<(), EngineError> {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-c", 0.81), ("subj-b", 0.40)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    seed_forfettario_subjects(&fx.subjects);

    let rule = forfettario_rule();
    let results = fx.engine.match_rule_against_all_subjects(&rule).await?;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].subject_id, "subj-a");
    assert_eq!(results[0].kind, MatchKind::Structured);
    assert_eq!(results[0].score, 1.0);
    assert_eq!(results[0].matched_attributes, vec!["regime".to_string()]);

    // Carani has only null attributes; the semantic pass caught it.
    assert_eq!(results[1].subject_id, "subj-c");
    assert_eq!(results[1].kind, MatchKind::Semantic);
    assert!((results[1].score - 0.81).abs() < 1e-6);
    assert!(results[1].matched_attributes.is_empty());

    // Bravo's 0.40 sits below the similarity threshold.
    let bravo = fx.results.get("subj-b", "rule-forfettario").await?;
    assert!(bravo.is_none());
    Ok(())
}

#[tokio::test]
async fn overlapping_passes_collapse_to_hybrid() -> Result<(), EngineError> {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-a", 0.95)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    seed_forfettario_subjects(&fx.subjects);

    let results = fx
        .engine
        .match_rule_against_all_subjects(&forfettario_rule())
        .await?;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].subject_id, "subj-a");
    assert_eq!(results[0].kind, MatchKind::Hybrid);
    // The structured score wins the max.
    assert_eq!(results[0].score, 1.0);
    assert_eq!(results[0].matched_attributes, vec!["regime".to_string()]);
    assert_eq!(fx.results.len(), 1);
    Ok(())
}

#[tokio::test]
async fn semantic_scores_stay_below_structured_ones() {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-c", 0.99)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    seed_forfettario_subjects(&fx.subjects);

    let results = fx
        .engine
        .match_rule_against_all_subjects(&forfettario_rule())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].kind, MatchKind::Structured);
    assert_eq!(results[1].kind, MatchKind::Semantic);
    assert_eq!(results[1].score, 0.89);
    assert!(results[1].score < results[0].score);
}

#[tokio::test]
async fn missing_attributes_decay_the_structured_score() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));
    fx.subjects.insert(
        Subject::new("subj-a", "Alfa Consulting").with_attribute("regime", json!("FORFETTARIO")),
    );
    let rule = Rule::new(
        "rule-small-forfettario",
        "Forfettario with a small team",
        ConditionNode::And {
            children: vec![
                ConditionNode::comparison("regime", CompareOp::Eq, json!("FORFETTARIO")),
                ConditionNode::Not {
                    child: Box::new(ConditionNode::comparison(
                        "employees",
                        CompareOp::Gt,
                        json!(15),
                    )),
                },
            ],
        },
    );

    let results = fx
        .engine
        .match_rule_against_all_subjects(&rule)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, MatchKind::Structured);
    // One referenced field absent: 1.0 - 0.02.
    assert!((results[0].score - 0.98).abs() < 1e-6);
    assert_eq!(results[0].matched_attributes, vec!["regime".to_string()]);
}

#[tokio::test]
async fn structured_score_never_drops_below_the_floor() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));
    fx.subjects.insert(
        Subject::new("subj-a", "Alfa Consulting").with_attribute("regime", json!("FORFETTARIO")),
    );

    // Six absent fields would cut 0.12, past the 0.90 floor.
    let mut children = vec![ConditionNode::comparison(
        "regime",
        CompareOp::Eq,
        json!("FORFETTARIO"),
    )];
    for field in ["f1", "f2", "f3", "f4", "f5", "f6"] {
        children.push(ConditionNode::Not {
            child: Box::new(ConditionNode::comparison(field, CompareOp::Gt, json!(1))),
        });
    }
    let rule = Rule::new(
        "rule-many-absences",
        "Forfettario without disqualifiers",
        ConditionNode::And { children },
    );

    let results = fx
        .engine
        .match_rule_against_all_subjects(&rule)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].score, 0.90);
}

#[tokio::test]
async fn absence_only_matches_fall_through_to_semantic() {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-c", 0.80)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    fx.subjects
        .insert(Subject::new("subj-c", "Carani Studio").with_attribute("employees", json!(null)));
    fx.subjects
        .insert(Subject::new("subj-d", "Delta Design").with_attribute("employees", json!(3)));

    let rule = Rule::new(
        "rule-no-large-teams",
        "No large teams",
        ConditionNode::Not {
            child: Box::new(ConditionNode::comparison(
                "employees",
                CompareOp::Gt,
                json!(15),
            )),
        },
    );

    let results = fx
        .engine
        .match_rule_against_all_subjects(&rule)
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    // Delta's present value satisfied the negation structurally.
    assert_eq!(results[0].subject_id, "subj-d");
    assert_eq!(results[0].kind, MatchKind::Structured);
    assert_eq!(
        results[0].matched_attributes,
        vec!["employees".to_string()]
    );
    // Carani matched only by absence, so it rides the semantic pass.
    assert_eq!(results[1].subject_id, "subj-c");
    assert_eq!(results[1].kind, MatchKind::Semantic);
}

#[tokio::test]
async fn rule_outside_validity_window_matches_nothing() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));
    seed_forfettario_subjects(&fx.subjects);

    let expired = forfettario_rule().with_window(
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
    );

    let (results, health) = fx.engine.match_rule_inner(&expired, now()).await.unwrap();
    assert!(results.is_empty());
    assert!(!health.degraded());
    assert!(fx.results.is_empty());
}

#[tokio::test]
async fn malformed_condition_rejects_the_rule() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));
    seed_forfettario_subjects(&fx.subjects);

    let rule = Rule::new(
        "rule-empty-and",
        "Empty conjunction",
        ConditionNode::And { children: vec![] },
    );

    let err = fx
        .engine
        .match_rule_against_all_subjects(&rule)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rule(_)));
    assert!(fx.results.is_empty());
}

#[tokio::test]
async fn recompute_prunes_results_that_no_longer_hold() -> Result<(), EngineError> {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));
    seed_forfettario_subjects(&fx.subjects);

    let rule = forfettario_rule();
    let results = fx.engine.match_rule_against_all_subjects(&rule).await?;
    assert_eq!(results.len(), 1);
    assert!(fx.results.get("subj-a", "rule-forfettario").await?.is_some());

    // Alfa leaves the flat-rate regime; the old row must go.
    fx.subjects.insert(
        Subject::new("subj-a", "Alfa Consulting")
            .with_attribute("regime", json!("ORDINARIO"))
            .with_attribute("employees", json!(4)),
    );
    let results = fx.engine.match_rule_against_all_subjects(&rule).await?;
    assert!(results.is_empty());
    assert!(fx.results.get("subj-a", "rule-forfettario").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn rerun_with_same_inputs_is_idempotent() -> Result<(), EngineError> {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-c", 0.81)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    seed_forfettario_subjects(&fx.subjects);

    let rule = forfettario_rule();
    let (first, _) = fx.engine.match_rule_inner(&rule, now()).await?;
    let (second, _) = fx.engine.match_rule_inner(&rule, now()).await?;

    assert_eq!(first, second);
    assert_eq!(fx.results.len(), first.len());
    Ok(())
}

#[tokio::test]
async fn index_outage_degrades_to_structured_only() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::failing()));
    seed_forfettario_subjects(&fx.subjects);

    let (results, health) = fx
        .engine
        .match_rule_inner(&forfettario_rule(), now())
        .await
        .unwrap();

    assert!(health.index_unavailable);
    assert!(!health.embedding_unavailable);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].subject_id, "subj-a");
    assert_eq!(results[0].kind, MatchKind::Structured);
}

#[tokio::test]
async fn embedding_outage_degrades_to_structured_only() {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-c", 0.90)]));
    let fx = fixture(Arc::new(FailingEmbedder), index);
    seed_forfettario_subjects(&fx.subjects);

    let (results, health) = fx
        .engine
        .match_rule_inner(&forfettario_rule(), now())
        .await
        .unwrap();

    assert!(health.embedding_unavailable);
    assert!(!health.index_unavailable);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, MatchKind::Structured);
}

#[tokio::test(start_paused = true)]
async fn slow_embedding_counts_as_unavailability() {
    let fx = fixture(Arc::new(SlowEmbedder), Arc::new(FakeIndex::default()));

    let err = fx
        .engine
        .embed_with_timeout("rule-1", "some text")
        .await
        .unwrap_err();
    assert!(err.is_unavailability());
    assert!(matches!(err, EmbeddingError::Unavailable { .. }));
}

#[tokio::test]
async fn rule_vector_is_cached_until_wording_changes() {
    let embedder = Arc::new(FixedEmbedder::new(4));
    let fx = fixture(embedder.clone(), Arc::new(FakeIndex::default()));

    let rule = forfettario_rule();
    fx.engine.rule_vector(&rule).await.unwrap();
    fx.engine.rule_vector(&rule).await.unwrap();
    assert_eq!(embedder.call_count(), 1);

    let reworded = rule.with_description("Applies to flat-rate regimes");
    fx.engine.rule_vector(&reworded).await.unwrap();
    assert_eq!(embedder.call_count(), 2);
}

#[tokio::test]
async fn subject_entry_merges_structured_and_semantic_rules() -> Result<(), EngineError> {
    let embedder = FixedEmbedder::new(4)
        .with_vector("rule-forfettario", vec![1.0, 0.0, 0.0, 0.0])
        .with_vector("rule-startup", vec![0.8, 0.6, 0.0, 0.0])
        .with_vector("rule-retail", vec![0.0, 1.0, 0.0, 0.0]);
    let fx = fixture(Arc::new(embedder), Arc::new(FakeIndex::default()));

    let subject = Subject::new("subj-a", "Alfa Consulting")
        .with_attribute("regime", json!("FORFETTARIO"))
        .with_vector(vec![1.0, 0.0, 0.0, 0.0], now());
    fx.subjects.insert(subject.clone());
    fx.rules.insert(forfettario_rule());
    fx.rules.insert(Rule::new(
        "rule-startup",
        "Early-stage companies",
        ConditionNode::comparison("stage", CompareOp::Eq, json!("startup")),
    ));
    fx.rules.insert(Rule::new(
        "rule-retail",
        "Retail sector",
        ConditionNode::comparison("sector", CompareOp::Eq, json!("retail")),
    ));

    let results = fx.engine.match_subject_against_all_rules(&subject).await?;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].rule_id, "rule-forfettario");
    assert_eq!(results[0].kind, MatchKind::Hybrid);
    assert_eq!(results[0].score, 1.0);
    assert_eq!(results[1].rule_id, "rule-startup");
    assert_eq!(results[1].kind, MatchKind::Semantic);
    assert!((results[1].score - 0.8).abs() < 1e-6);
    Ok(())
}

#[tokio::test]
async fn subject_without_vector_skips_the_semantic_step() {
    let embedder = Arc::new(FixedEmbedder::new(4));
    let fx = fixture(embedder.clone(), Arc::new(FakeIndex::default()));

    let subject =
        Subject::new("subj-a", "Alfa Consulting").with_attribute("regime", json!("FORFETTARIO"));
    fx.subjects.insert(subject.clone());
    fx.rules.insert(forfettario_rule());

    let results = fx
        .engine
        .match_subject_against_all_rules(&subject)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, MatchKind::Structured);
    assert_eq!(embedder.call_count(), 0);
}

#[tokio::test]
async fn mismatched_vector_dimension_fails_the_pair() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));

    // A two-component vector left over from an older embedding setup.
    let subject = Subject::new("subj-a", "Alfa Consulting")
        .with_attribute("regime", json!("FORFETTARIO"))
        .with_vector(vec![1.0, 0.0], now());
    fx.subjects.insert(subject.clone());
    fx.rules.insert(forfettario_rule());

    let err = fx
        .engine
        .match_subject_against_all_rules(&subject)
        .await
        .unwrap_err();
    match err {
        EngineError::MatchComputation {
            subject_id,
            rule_id,
            ..
        } => {
            assert_eq!(subject_id, "subj-a");
            assert_eq!(rule_id, "rule-forfettario");
        }
        other => panic!("expected MatchComputation, got {other:?}"),
    }
    // The previous result set is untouched: nothing was persisted.
    assert!(fx.results.is_empty());
}

#[tokio::test]
async fn equal_scores_rank_by_priority_then_name() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));

    let subject = Subject::new("subj-a", "Alfa Consulting")
        .with_attribute("regime", json!("FORFETTARIO"))
        .with_attribute("vat", json!("IT123"));
    fx.subjects.insert(subject.clone());
    fx.rules.insert(
        Rule::new(
            "rule-z",
            "Zeta check",
            ConditionNode::comparison("vat", CompareOp::Eq, json!("IT123")),
        )
        .with_priority(1),
    );
    fx.rules.insert(
        Rule::new(
            "rule-m",
            "Alpha check",
            ConditionNode::comparison("regime", CompareOp::Eq, json!("FORFETTARIO")),
        )
        .with_priority(5),
    );
    fx.rules.insert(
        Rule::new(
            "rule-a",
            "Beta check",
            ConditionNode::comparison("vat", CompareOp::Eq, json!("IT123")),
        )
        .with_priority(5),
    );

    let results = fx
        .engine
        .match_subject_against_all_rules(&subject)
        .await
        .unwrap();

    let order: Vec<_> = results.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(order, vec!["rule-z", "rule-m", "rule-a"]);
}

#[tokio::test]
async fn equal_scores_rank_by_display_name_before_id() {
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), Arc::new(FakeIndex::default()));
    fx.subjects
        .insert(Subject::new("subj-9", "Alpha Ltd").with_attribute("regime", json!("FORFETTARIO")));
    fx.subjects
        .insert(Subject::new("subj-1", "Zulu Ltd").with_attribute("regime", json!("FORFETTARIO")));

    let results = fx
        .engine
        .match_rule_against_all_subjects(&forfettario_rule())
        .await
        .unwrap();

    let order: Vec<_> = results.iter().map(|r| r.subject_id.as_str()).collect();
    assert_eq!(order, vec!["subj-9", "subj-1"]);
}

#[tokio::test]
async fn semantic_hit_for_deleted_subject_is_skipped() {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-ghost", 0.90)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    seed_forfettario_subjects(&fx.subjects);

    let results = fx
        .engine
        .match_rule_against_all_subjects(&forfettario_rule())
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].subject_id, "subj-a");
}

#[tokio::test]
async fn stale_vectors_are_flagged_on_semantic_results() {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-c", 0.81)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    seed_forfettario_subjects(&fx.subjects);
    fx.subjects.mark_stale("subj-c").await.unwrap();

    let results = fx
        .engine
        .match_rule_against_all_subjects(&forfettario_rule())
        .await
        .unwrap();

    let carani = results.iter().find(|r| r.subject_id == "subj-c").unwrap();
    assert!(carani.stale_vector);
    let alfa = results.iter().find(|r| r.subject_id == "subj-a").unwrap();
    assert!(!alfa.stale_vector);
}

#[derive(Default)]
struct RecordingMetrics {
    events: RwLock<Vec<String>>,
}

impl RecordingMetrics {
    fn snapshot(&self) -> Vec<String> {
        self.events.read().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.write().unwrap().push(event);
    }
}

impl EngineMetrics for RecordingMetrics {
    fn record_rule_match(&self, rule_id: &str, _latency: Duration, results: usize, degraded: bool) {
        self.push(format!("rule:{rule_id}:{results}:{degraded}"));
    }

    fn record_subject_match(
        &self,
        subject_id: &str,
        _latency: Duration,
        results: usize,
        degraded: bool,
    ) {
        self.push(format!("subject:{subject_id}:{results}:{degraded}"));
    }

    fn record_scan_chunk(&self, batch_id: &str, chunk_items: u64, total_processed: u64) {
        self.push(format!("chunk:{batch_id}:{chunk_items}:{total_processed}"));
    }

    fn record_refresh(&self, subject_id: &str, outcome: RefreshOutcome) {
        self.push(format!("refresh:{subject_id}:{outcome:?}"));
    }
}

#[tokio::test]
async fn metrics_recorder_observes_match_calls() {
    let index = Arc::new(FakeIndex::with_hits(vec![("subj-c", 0.81)]));
    let fx = fixture(Arc::new(FixedEmbedder::new(4)), index);
    seed_forfettario_subjects(&fx.subjects);

    let metrics = Arc::new(RecordingMetrics::default());
    set_engine_metrics(Some(metrics.clone()));

    fx.engine
        .match_rule_against_all_subjects(&forfettario_rule())
        .await
        .unwrap();

    let events = metrics.snapshot();
    assert!(events
        .iter()
        .any(|event| event.starts_with("rule:rule-forfettario:2")));

    set_engine_metrics(None);
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let err = MatchEngine::new(
        EngineConfig::default().with_min_similarity(0.0),
        Arc::new(InMemorySubjectStore::new()),
        Arc::new(InMemoryRuleStore::new()),
        Arc::new(InMemoryMatchResultStore::new()),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(FixedEmbedder::new(4)),
        Arc::new(FakeIndex::default()),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}

#[test]
fn cosine_similarity_guards_degenerate_inputs() {
    assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    assert!((cosine_similarity(&[1.0, 0.0], &[0.8, 0.6]) - 0.8).abs() < 1e-6);
}
