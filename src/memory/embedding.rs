//! Embedding generation seam for semantic memory retrieval.
//!
//! The store never runs model inference itself: embedding generation is an
//! external capability behind the [`Embedder`] trait, which may be backed by
//! a local model or a remote service. What the core requires is `embed`,
//! `embed_batch`, and a declared dimensionality per model.
//!
//! [`HashedEmbedder`] is the built-in offline implementation: deterministic
//! token feature hashing into an L2-normalized vector. It has no semantic
//! quality but gives tests and air-gapped deployments a real, stable vector
//! space per model identifier.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{MemoryError, Result};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Sentence embedding generator for one fixed model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable model identifier (e.g. `all-minilm-l6-v2`).
    fn model_id(&self) -> &str;

    /// Output vector dimensionality.
    fn dimension(&self) -> usize;

    /// Embed a single text into a `dimension()`-length f32 vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts. The default forwards to [`embed`](Self::embed)
    /// one text at a time; batching backends should override.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for dyn Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model_id", &self.model_id())
            .field("dimension", &self.dimension())
            .finish()
    }
}

/// Resolves a model identifier to an [`Embedder`] handle.
///
/// An unknown model or a dimensionality that contradicts the model's declared
/// one is a permanent configuration error — surfaced before a migration ever
/// writes a vector.
pub trait EmbedderProvider: Send + Sync {
    /// Resolve `model` and check it produces `dimension`-length vectors.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Config`] for an unknown model or a
    /// dimensionality mismatch.
    fn embedder_for(&self, model: &str, dimension: usize) -> Result<Arc<dyn Embedder>>;
}

/// In-process registry of named embedders.
#[derive(Default)]
pub struct EmbedderRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an embedder under its own `model_id`, replacing any previous
    /// registration for that id.
    pub fn register(&self, embedder: Arc<dyn Embedder>) {
        let id = embedder.model_id().to_owned();
        if let Ok(mut map) = self.inner.write() {
            map.insert(id, embedder);
        }
    }

    /// Registered model identifiers, sorted.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.inner.read() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }
}

impl EmbedderProvider for EmbedderRegistry {
    fn embedder_for(&self, model: &str, dimension: usize) -> Result<Arc<dyn Embedder>> {
        let map = self
            .inner
            .read()
            .map_err(|_| MemoryError::Embedding("embedder registry lock poisoned".to_owned()))?;
        let embedder = map
            .get(model)
            .cloned()
            .ok_or_else(|| MemoryError::Config(format!("unknown embedding model: {model}")))?;
        if embedder.dimension() != dimension {
            return Err(MemoryError::Config(format!(
                "embedding model {model} produces {}-dim vectors, expected {dimension}",
                embedder.dimension()
            )));
        }
        Ok(embedder)
    }
}

impl std::fmt::Debug for EmbedderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedderRegistry")
            .field("models", &self.model_ids())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Hashed embedder
// ---------------------------------------------------------------------------

/// Deterministic token-feature-hashing embedder.
///
/// Each token is hashed (salted with the model id, so two models with
/// different ids produce incomparable vector spaces) into a bucket with a
/// sign; the accumulated vector is L2-normalized. Identical text always
/// yields the identical vector.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    model_id: String,
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension: dimension.max(1),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            self.model_id.hash(&mut hasher);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&vector)
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '\'' || ch == '-' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

// ---------------------------------------------------------------------------
// Vector math helpers
// ---------------------------------------------------------------------------

/// L2-normalize a vector. A (near-)zero vector is returned unchanged.
pub fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < 1e-12 {
        return vec.to_vec();
    }
    vec.iter().map(|x| x / norm).collect()
}

/// Compute cosine similarity between two vectors, in `[-1.0, 1.0]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have equal length");
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom < 1e-12 {
        return 0.0;
    }
    dot / denom
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
