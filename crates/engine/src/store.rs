//! Narrow interfaces to the external stores the engine depends on.
//!
//! Subjects and rules are owned by the surrounding application; the
//! engine only needs a handful of read operations plus vector
//! write-back, so each collaborator is a small trait rather than a
//! shared data layer. The in-memory implementations back the test
//! suite and small deployments.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;
use crate::types::{MatchResult, Rule, Subject};

/// Read access to subjects plus vector write-back after (re)embedding.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Subject>, StoreError>;

    /// Page of subjects ordered by id ascending, strictly after
    /// `after`. The stable order is what makes scan cursors resumable.
    async fn page(&self, after: Option<&str>, limit: usize) -> Result<Vec<Subject>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Store a freshly generated vector and clear the staleness flag.
    async fn save_vector(
        &self,
        id: &str,
        vector: &[f32],
        generated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flag the subject's vector as no longer reflecting its
    /// attributes. Called by the owning application on attribute
    /// change; exposed here so tests can drive the same transitions.
    async fn mark_stale(&self, id: &str) -> Result<(), StoreError>;
}

/// Read-only view of the rule catalog.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules currently enabled, ordered by id ascending. Validity
    /// windows are evaluated by the engine, not the store.
    async fn active_rules(&self) -> Result<Vec<Rule>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Rule>, StoreError>;
}

/// Persistence for computed matches, unique per `(subject_id, rule_id)`.
#[async_trait]
pub trait MatchResultStore: Send + Sync {
    /// Insert or overwrite the result for its `(subject_id, rule_id)`
    /// key. Last write wins; concurrent writers computing from the
    /// same inputs write the same value.
    async fn upsert(&self, result: &MatchResult) -> Result<(), StoreError>;

    async fn get(&self, subject_id: &str, rule_id: &str)
        -> Result<Option<MatchResult>, StoreError>;

    async fn for_rule(&self, rule_id: &str) -> Result<Vec<MatchResult>, StoreError>;

    async fn for_subject(&self, subject_id: &str) -> Result<Vec<MatchResult>, StoreError>;

    /// Drop results for `rule_id` except the named subjects. Used
    /// after a recompute so subjects that stopped matching do not keep
    /// stale rows. Returns how many were removed.
    async fn remove_for_rule(
        &self,
        rule_id: &str,
        except_subjects: &BTreeSet<String>,
    ) -> Result<u64, StoreError>;

    /// Counterpart for subject-driven recomputes.
    async fn remove_for_subject(
        &self,
        subject_id: &str,
        except_rules: &BTreeSet<String>,
    ) -> Result<u64, StoreError>;
}

/// Persistence for batch progress markers.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, batch_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Compare-and-set save. `expected_version` of `None` creates the
    /// checkpoint and fails if one already exists; `Some(v)` requires
    /// the stored version to equal `v`. On success the store bumps the
    /// version and returns the new value.
    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Every known checkpoint, for supervisors scanning for stalls.
    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError>;
}

/// In-memory subject store over a sorted map.
#[derive(Default)]
pub struct InMemorySubjectStore {
    subjects: RwLock<BTreeMap<String, Subject>>,
}

impl InMemorySubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject: Subject) {
        if let Ok(mut map) = self.subjects.write() {
            map.insert(subject.id.clone(), subject);
        }
    }
}

#[async_trait]
impl SubjectStore for InMemorySubjectStore {
    async fn get(&self, id: &str) -> Result<Option<Subject>, StoreError> {
        let map = self.subjects.read().map_err(|_| StoreError::poisoned())?;
        Ok(map.get(id).cloned())
    }

    async fn page(&self, after: Option<&str>, limit: usize) -> Result<Vec<Subject>, StoreError> {
        let map = self.subjects.read().map_err(|_| StoreError::poisoned())?;
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(map
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, subject)| subject.clone())
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let map = self.subjects.read().map_err(|_| StoreError::poisoned())?;
        Ok(map.len() as u64)
    }

    async fn save_vector(
        &self,
        id: &str,
        vector: &[f32],
        generated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut map = self.subjects.write().map_err(|_| StoreError::poisoned())?;
        match map.get_mut(id) {
            Some(subject) => {
                subject.vector = Some(vector.to_vec());
                subject.vector_generated_at = Some(generated_at);
                subject.vector_stale = false;
                Ok(())
            }
            None => Err(StoreError::Backend(format!("subject {id} not found"))),
        }
    }

    async fn mark_stale(&self, id: &str) -> Result<(), StoreError> {
        let mut map = self.subjects.write().map_err(|_| StoreError::poisoned())?;
        match map.get_mut(id) {
            Some(subject) => {
                subject.vector_stale = true;
                Ok(())
            }
            None => Err(StoreError::Backend(format!("subject {id} not found"))),
        }
    }
}

/// In-memory rule store over a sorted map.
#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<BTreeMap<String, Rule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rule: Rule) {
        if let Ok(mut map) = self.rules.write() {
            map.insert(rule.id.clone(), rule);
        }
    }

    pub fn remove(&self, id: &str) {
        if let Ok(mut map) = self.rules.write() {
            map.remove(id);
        }
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn active_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let map = self.rules.read().map_err(|_| StoreError::poisoned())?;
        Ok(map.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Rule>, StoreError> {
        let map = self.rules.read().map_err(|_| StoreError::poisoned())?;
        Ok(map.get(id).cloned())
    }
}

/// In-memory match-result store keyed by `(subject_id, rule_id)`.
#[derive(Default)]
pub struct InMemoryMatchResultStore {
    results: RwLock<BTreeMap<(String, String), MatchResult>>,
}

impl InMemoryMatchResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MatchResultStore for InMemoryMatchResultStore {
    async fn upsert(&self, result: &MatchResult) -> Result<(), StoreError> {
        let mut map = self.results.write().map_err(|_| StoreError::poisoned())?;
        map.insert(
            (result.subject_id.clone(), result.rule_id.clone()),
            result.clone(),
        );
        Ok(())
    }

    async fn get(
        &self,
        subject_id: &str,
        rule_id: &str,
    ) -> Result<Option<MatchResult>, StoreError> {
        let map = self.results.read().map_err(|_| StoreError::poisoned())?;
        Ok(map
            .get(&(subject_id.to_string(), rule_id.to_string()))
            .cloned())
    }

    async fn for_rule(&self, rule_id: &str) -> Result<Vec<MatchResult>, StoreError> {
        let map = self.results.read().map_err(|_| StoreError::poisoned())?;
        Ok(map
            .values()
            .filter(|result| result.rule_id == rule_id)
            .cloned()
            .collect())
    }

    async fn for_subject(&self, subject_id: &str) -> Result<Vec<MatchResult>, StoreError> {
        let map = self.results.read().map_err(|_| StoreError::poisoned())?;
        Ok(map
            .values()
            .filter(|result| result.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn remove_for_rule(
        &self,
        rule_id: &str,
        except_subjects: &BTreeSet<String>,
    ) -> Result<u64, StoreError> {
        let mut map = self.results.write().map_err(|_| StoreError::poisoned())?;
        let before = map.len();
        map.retain(|(subject_id, result_rule_id), _| {
            result_rule_id != rule_id || except_subjects.contains(subject_id)
        });
        Ok((before - map.len()) as u64)
    }

    async fn remove_for_subject(
        &self,
        subject_id: &str,
        except_rules: &BTreeSet<String>,
    ) -> Result<u64, StoreError> {
        let mut map = self.results.write().map_err(|_| StoreError::poisoned())?;
        let before = map.len();
        map.retain(|(result_subject_id, rule_id), _| {
            result_subject_id != subject_id || except_rules.contains(rule_id)
        });
        Ok((before - map.len()) as u64)
    }
}

/// In-memory checkpoint store with the CAS semantics of the trait.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<BTreeMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, batch_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let map = self
            .checkpoints
            .read()
            .map_err(|_| StoreError::poisoned())?;
        Ok(map.get(batch_id).cloned())
    }

    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut map = self
            .checkpoints
            .write()
            .map_err(|_| StoreError::poisoned())?;
        let current = map.get(&checkpoint.batch_id).map(|cp| cp.version);
        match (expected_version, current) {
            (None, Some(found)) => Err(StoreError::VersionConflict { expected: 0, found }),
            (Some(expected), None) => Err(StoreError::VersionConflict { expected, found: 0 }),
            (Some(expected), Some(found)) if expected != found => {
                Err(StoreError::VersionConflict { expected, found })
            }
            _ => {
                let mut stored = checkpoint.clone();
                stored.version = expected_version.unwrap_or(0) + 1;
                let version = stored.version;
                map.insert(checkpoint.batch_id.clone(), stored);
                Ok(version)
            }
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let map = self
            .checkpoints
            .read()
            .map_err(|_| StoreError::poisoned())?;
        Ok(map.values().cloned().collect())
    }
}
