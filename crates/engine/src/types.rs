use chrono::{DateTime, Utc};
use criteria::{AttributeMap, ConditionNode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// An entity being matched against rules, typically a client profile.
///
/// Attributes are owned and mutated by the surrounding application;
/// this engine only reads them. The vector fields are the exception:
/// the engine writes them back after (re)embedding the profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    /// Stable identifier, also the key for vector-index entries.
    pub id: String,
    /// Human-readable label used for reproducible tie-breaking.
    pub display_name: String,
    /// Named attributes the criteria pass evaluates against.
    #[serde(default)]
    pub attributes: AttributeMap,
    /// Profile embedding, if one has been generated.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    /// When the current vector was generated.
    #[serde(default)]
    pub vector_generated_at: Option<DateTime<Utc>>,
    /// Set when attributes changed after the vector was generated.
    /// A stale vector is still usable but every match built from it
    /// carries the flag.
    #[serde(default)]
    pub vector_stale: bool,
}

impl Subject {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            attributes: AttributeMap::new(),
            vector: None,
            vector_generated_at: None,
            vector_stale: false,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>, generated_at: DateTime<Utc>) -> Self {
        self.vector = Some(vector);
        self.vector_generated_at = Some(generated_at);
        self.vector_stale = false;
        self
    }

    /// Textual profile fed to the embedding provider.
    ///
    /// Attribute order follows the map's sorted keys, so the same
    /// attributes always produce the same text and therefore the same
    /// vector. Null attributes carry no signal and are skipped.
    pub fn profile_text(&self) -> String {
        let mut text = self.display_name.clone();
        for (name, value) in &self.attributes {
            if value.is_null() {
                continue;
            }
            text.push('\n');
            text.push_str(name);
            text.push_str(": ");
            match value {
                JsonValue::String(s) => text.push_str(s),
                other => text.push_str(&other.to_string()),
            }
        }
        text
    }
}

/// A prioritized, time-bounded condition describing who it applies to.
///
/// Rules are immutable during a matching pass; they are created and
/// edited by an external collaborator and read here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: String,
    /// Short display name, also part of the descriptive text that gets
    /// embedded for the semantic pass.
    pub name: String,
    /// Free-text explanation of what the rule covers.
    #[serde(default)]
    pub description: String,
    /// Boolean tree evaluated by the criteria pass.
    pub condition: ConditionNode,
    /// Lower value ranks first on score ties.
    #[serde(default)]
    pub priority: i32,
    /// Start of the validity window, inclusive. `None` means open.
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window, exclusive. `None` means open.
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category: Option<String>,
}

impl Rule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, condition: ConditionNode) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            condition,
            priority: 0,
            valid_from: None,
            valid_until: None,
            category: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_window(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_until = valid_until;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Whether `at` falls inside the rule's `[valid_from, valid_until)`
    /// window. Open bounds never exclude.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        if let Some(from) = self.valid_from {
            if at < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if at >= until {
                return false;
            }
        }
        true
    }

    /// Text embedded once per rule for the semantic pass: the name,
    /// category, and description plus a rendering of the condition, so
    /// rules with an empty description still produce a usable vector.
    pub fn descriptive_text(&self) -> String {
        let mut text = self.name.clone();
        if let Some(category) = self.category.as_deref() {
            if !category.trim().is_empty() {
                text.push('\n');
                text.push_str(category.trim());
            }
        }
        if !self.description.trim().is_empty() {
            text.push('\n');
            text.push_str(self.description.trim());
        }
        text.push('\n');
        text.push_str(&condition_text(&self.condition));
        text
    }

    /// Hash of the descriptive text, used to invalidate cached rule
    /// vectors when the rule's wording or condition changes.
    pub fn descriptive_fingerprint(&self) -> u64 {
        fxhash::hash64(self.descriptive_text().as_bytes())
    }
}

fn condition_text(node: &ConditionNode) -> String {
    match node {
        ConditionNode::Comparison { field, op, value } => {
            let rendered = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{field} {} {rendered}", op.symbol())
        }
        ConditionNode::And { children } => join_children(children, " and "),
        ConditionNode::Or { children } => join_children(children, " or "),
        ConditionNode::Not { child } => format!("not ({})", condition_text(child)),
    }
}

fn join_children(children: &[ConditionNode], separator: &str) -> String {
    let parts: Vec<String> = children.iter().map(condition_text).collect();
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(separator))
    }
}

/// How a match was established.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchKind {
    /// Condition tree satisfied by the subject's attributes.
    Structured,
    /// Vector similarity above threshold, no structured evidence.
    Semantic,
    /// Both; keeps the structured score and the union of evidence.
    Hybrid,
}

/// One persisted match decision, unique per `(subject_id, rule_id)`.
///
/// Written only by this engine and consumed read-only downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub subject_id: String,
    pub rule_id: String,
    /// Final score in `[0, 1]`.
    pub score: f32,
    pub kind: MatchKind,
    /// Attribute names that satisfied the rule, sorted; empty for pure
    /// semantic matches.
    #[serde(default)]
    pub matched_attributes: Vec<String>,
    /// True when the semantic evidence came from a vector that was
    /// flagged stale at compute time.
    #[serde(default)]
    pub stale_vector: bool,
    pub computed_at: DateTime<Utc>,
}
