//! Shared types and helpers for the memory subsystem.
//!
//! Everything in this module is backend-agnostic — used by the collection
//! adapter, the fusion engine, and the dual-collection manager alike.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MemoryError, Result};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The closed set of memory types the store accepts.
///
/// Each variant carries its own required-content contract; payloads are
/// validated against it at store time instead of being matched on free-form
/// type strings downstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Conversation,
    Fact,
    Document,
    Entity,
    Reflection,
    Code,
}

impl MemoryKind {
    /// All memory kinds, in stable order.
    pub const ALL: [MemoryKind; 6] = [
        MemoryKind::Conversation,
        MemoryKind::Fact,
        MemoryKind::Document,
        MemoryKind::Entity,
        MemoryKind::Reflection,
        MemoryKind::Code,
    ];

    /// Content fields that must be present and non-null for this kind.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            MemoryKind::Conversation => &["role", "message"],
            MemoryKind::Fact => &["statement"],
            MemoryKind::Document => &["title", "text"],
            MemoryKind::Entity => &["name", "description"],
            MemoryKind::Reflection => &["observation", "insight"],
            MemoryKind::Code => &["language", "code"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Conversation => "conversation",
            MemoryKind::Fact => "fact",
            MemoryKind::Document => "document",
            MemoryKind::Entity => "entity",
            MemoryKind::Reflection => "reflection",
            MemoryKind::Code => "code",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage tier of a memory record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    #[default]
    ShortTerm,
    LongTerm,
    Archived,
}

impl MemoryTier {
    /// All tiers, in stable order.
    pub const ALL: [MemoryTier; 3] =
        [MemoryTier::ShortTerm, MemoryTier::LongTerm, MemoryTier::Archived];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::LongTerm => "long_term",
            MemoryTier::Archived => "archived",
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Serde defaults (referenced by MemoryRecord field attributes)
// ---------------------------------------------------------------------------

fn default_importance() -> f32 {
    0.5
}

// ---------------------------------------------------------------------------
// Core structs
// ---------------------------------------------------------------------------

/// A single memory record.
///
/// The record's vector lives on the collection point, not on the struct: the
/// same logical record may exist in two collections with two different
/// vectors during a migration, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    /// Type-specific structured payload, validated per [`MemoryKind`].
    pub content: Map<String, Value>,
    /// Free-form metadata (provenance tags, source hints).
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub tier: MemoryTier,
    /// Importance score for prioritization (0.0–1.0).
    #[serde(default = "default_importance")]
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Create a new record with a generated id and current timestamps.
    pub fn new(kind: MemoryKind, content: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content,
            metadata: Map::new(),
            tier: MemoryTier::default(),
            importance: default_importance(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tier(mut self, tier: MemoryTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate the content payload against the kind's required-field
    /// contract.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Record`] naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(MemoryError::Record("record id is empty".to_owned()));
        }
        for field in self.kind.required_fields() {
            match self.content.get(*field) {
                Some(Value::Null) | None => {
                    return Err(MemoryError::Record(format!(
                        "{} memory is missing required content field '{field}'",
                        self.kind
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Text used for embedding generation: the string values of the content
    /// payload, in key order, joined by newlines.
    pub fn embedding_text(&self) -> String {
        content_text(&self.content)
    }

    /// The JSON payload stored on the collection point.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Reconstruct a record from a collection point payload.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Record`] if the payload does not describe a
    /// valid record.
    pub fn from_payload(payload: Value) -> Result<Self> {
        serde_json::from_value(payload)
            .map_err(|e| MemoryError::Record(format!("malformed record payload: {e}")))
    }
}

/// Extract embeddable text from a content payload: string values in key
/// order, joined by newlines. Non-string values are skipped.
pub(crate) fn content_text(content: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for value in content.values() {
        if let Value::String(s) = value {
            if !s.trim().is_empty() {
                parts.push(s.trim());
            }
        }
    }
    parts.join("\n")
}

/// Extract embeddable text from a full point payload (the serialized record).
pub(crate) fn payload_text(payload: &Value) -> String {
    match payload.get("content").and_then(Value::as_object) {
        Some(content) => content_text(content),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Search types
// ---------------------------------------------------------------------------

/// Metadata filter applied to a similarity search or count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Restrict to these memory kinds (`None` = all).
    pub kinds: Option<Vec<MemoryKind>>,
    /// Restrict to a single tier (`None` = all).
    pub tier: Option<MemoryTier>,
    /// Minimum similarity for a hit to be returned.
    pub min_similarity: Option<f32>,
}

impl SearchFilter {
    /// Returns `true` if the given point payload passes the kind/tier parts
    /// of the filter (similarity is checked by the caller).
    pub fn matches_payload(&self, payload: &Value) -> bool {
        if let Some(kinds) = &self.kinds {
            let kind = payload.get("kind").and_then(Value::as_str);
            if !kind.is_some_and(|k| kinds.iter().any(|want| want.as_str() == k)) {
                return false;
            }
        }
        if let Some(tier) = self.tier {
            let got = payload.get("tier").and_then(Value::as_str);
            if got != Some(tier.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A search hit returned by the dual-collection manager.
#[derive(Debug, Clone)]
pub struct MemorySearchHit {
    pub record: MemoryRecord,
    pub similarity: f32,
}

/// Aggregate statistics for the primary collection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub total: usize,
    /// Counts keyed by tier name.
    pub by_tier: std::collections::BTreeMap<String, usize>,
    /// Counts keyed by kind name.
    pub by_kind: std::collections::BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
