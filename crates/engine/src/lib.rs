//! # RuleScope Engine (`engine`)
//!
//! ## Purpose
//!
//! `engine` sits on top of the condition layer (`criteria`), the
//! embedding client (`embedding`), and the vector index (`index`). It
//! is responsible for pairing subjects with the rules that apply to
//! them: a deterministic structured pass over each rule's condition
//! tree, a semantic pass over profile-text vectors for subjects the
//! structured pass could not classify, and the merge of both into one
//! deduplicated, deterministically ranked result set.
//!
//! In a typical deployment you will:
//! - Implement the storage traits ([`SubjectStore`], [`RuleStore`],
//!   [`MatchResultStore`], [`CheckpointStore`]) against your database,
//!   or use the in-memory variants for tests.
//! - Run [`MatchEngine::refresh_vectors`] after attribute imports to
//!   regenerate stale profile vectors, then [`MatchEngine::daily_scan`]
//!   to recompute matches for every active rule.
//! - Serve interactive lookups with
//!   [`MatchEngine::match_subject_against_all_rules`] and
//!   [`MatchEngine::match_rule_against_all_subjects`].
//!
//! ## Core Types
//!
//! - [`Subject`]: an entity with a sparse attribute map and an optional
//!   profile vector that may be flagged stale.
//! - [`Rule`]: a named condition tree plus priority, category, and an
//!   optional validity window.
//! - [`MatchResult`]: one subject/rule pairing with its score, its
//!   [`MatchKind`] (`STRUCTURED`, `SEMANTIC`, or `HYBRID`), and the
//!   attributes that drove it.
//! - [`Checkpoint`]: resumable progress of a batch, advanced one chunk
//!   at a time under compare-and-swap version control.
//! - [`MatchEngine`]: wires stores, embedder, and index together.
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use criteria::{CompareOp, ConditionNode};
//! use embedding::StubEmbedder;
//! use index::{HnswIndex, IndexConfig};
//! use engine::{
//!     EngineConfig, InMemoryCheckpointStore, InMemoryMatchResultStore,
//!     InMemoryRuleStore, InMemorySubjectStore, MatchEngine, Rule, Subject,
//! };
//! use serde_json::json;
//!
//! let subjects = Arc::new(InMemorySubjectStore::new());
//! subjects.insert(
//!     Subject::new("s-001", "Rossi SRL")
//!         .with_attribute("regime", json!("FORFETTARIO"))
//!         .with_attribute("employees", json!(4)),
//! );
//!
//! let rules = Arc::new(InMemoryRuleStore::new());
//! rules.insert(Rule::new(
//!     "r-001",
//!     "Forfettario regime",
//!     ConditionNode::comparison("regime", CompareOp::Eq, json!("FORFETTARIO")),
//! ));
//!
//! let engine = MatchEngine::new(
//!     EngineConfig::default(),
//!     subjects,
//!     rules,
//!     Arc::new(InMemoryMatchResultStore::new()),
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     Arc::new(StubEmbedder::new(16, true)),
//!     Arc::new(HnswIndex::new(IndexConfig::new(16)).expect("index init")),
//! )
//! .expect("engine init");
//!
//! let runtime = tokio::runtime::Runtime::new().expect("runtime");
//! runtime.block_on(async {
//!     engine.refresh_vectors("refresh-2026-02-14").await.expect("refresh");
//!     let summary = engine.daily_scan("scan-2026-02-14").await.expect("scan");
//!     println!(
//!         "scanned {} rules, wrote {} results",
//!         summary.processed_now, summary.results_upserted
//!     );
//! });
//! ```
//!
//! ## Observability
//!
//! Install an [`EngineMetrics`] implementation via
//! [`set_engine_metrics`] to record per-call latency, result counts,
//! degraded-mode flags, and batch progress. This is typically done once
//! during service startup so all calls through [`MatchEngine`] share
//! the same metrics backend.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod refresh;
pub mod scan;
pub mod store;
pub mod types;

mod serde_millis;

pub use crate::checkpoint::{BatchStatus, Checkpoint, ScanKind};
pub use crate::config::EngineConfig;
pub use crate::engine::MatchEngine;
pub use crate::error::{EngineError, StoreError};
pub use crate::metrics::{set_engine_metrics, EngineMetrics};
pub use crate::refresh::{RefreshOutcome, RefreshSummary};
pub use crate::scan::ScanSummary;
pub use crate::store::{
    CheckpointStore, InMemoryCheckpointStore, InMemoryMatchResultStore, InMemoryRuleStore,
    InMemorySubjectStore, MatchResultStore, RuleStore, SubjectStore,
};
pub use crate::types::{MatchKind, MatchResult, Rule, Subject};
