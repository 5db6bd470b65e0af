//! Metrics hooks for the matching engine.
//!
//! Callers install a global `EngineMetrics` implementation via
//! [`set_engine_metrics`]; the engine then reports per-operation
//! latency and result counts without coupling to any specific metrics
//! backend.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::refresh::RefreshOutcome;

/// Metrics observer for matching and batch operations.
pub trait EngineMetrics: Send + Sync {
    /// One `match_rule_against_all_subjects` call finished.
    ///
    /// `degraded` is true when the semantic pass was skipped because
    /// the index or the embedding provider was unavailable.
    fn record_rule_match(&self, rule_id: &str, latency: Duration, results: usize, degraded: bool);

    /// One `match_subject_against_all_rules` call finished.
    fn record_subject_match(
        &self,
        subject_id: &str,
        latency: Duration,
        results: usize,
        degraded: bool,
    );

    /// A batch chunk was processed and its checkpoint persisted.
    fn record_scan_chunk(&self, batch_id: &str, chunk_items: u64, total_processed: u64);

    /// A subject went through the vector refresh pass.
    fn record_refresh(&self, subject_id: &str, outcome: RefreshOutcome);
}

fn metrics_lock() -> &'static RwLock<Option<Arc<dyn EngineMetrics>>> {
    static METRICS: OnceCell<RwLock<Option<Arc<dyn EngineMetrics>>>> = OnceCell::new();
    METRICS.get_or_init(|| RwLock::new(None))
}

pub(crate) fn metrics_recorder() -> Option<Arc<dyn EngineMetrics>> {
    let guard = metrics_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.clone()
}

/// Install or clear the global engine metrics recorder.
///
/// Typically called once during service startup so every engine
/// instance shares the same metrics backend.
pub fn set_engine_metrics(recorder: Option<Arc<dyn EngineMetrics>>) {
    let lock = metrics_lock();
    let mut guard = lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = recorder;
}
