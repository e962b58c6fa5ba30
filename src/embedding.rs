//! Embedding provider interface and the deterministic lexical embedder.
//!
//! The engine only consumes [`EmbeddingProvider`]; network-backed providers live
//! outside the crate. [`LexicalEmbedder`] is deterministic, offline, and
//! dependency-free beyond `blake3`. It is *not* a neural embedding model: it uses
//! feature hashing over tokens, which is enough for near-duplicate detection in
//! merges and diffs and as a default provider in embedded mode.

use std::sync::Arc;
use std::time::Duration;

use blake3::Hasher;
use thiserror::Error;

use crate::engine::runtime::call_with_timeout;

/// Default embedding dimensionality for lexical embeddings.
pub const DEFAULT_EMBEDDING_DIM: usize = 64;

/// Failures reported by an embedding provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// Provider is unreachable or not configured.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// Provider did not answer in time.
    #[error("embedding request timed out after {duration_ms}ms")]
    Timeout {
        /// Configured timeout.
        duration_ms: u64,
    },

    /// Provider answered with something unusable.
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    /// Any other provider failure.
    #[error("embedding failed: {0}")]
    Failed(String),
}

impl EmbeddingError {
    /// Returns true for failures that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Narrow interface to an external embedding model.
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds `text` into a dense vector.
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError` when the provider fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Short provider name for logs.
    fn name(&self) -> &str {
        "embedding-provider"
    }
}

pub(crate) fn tokenize(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
}

/// Create a deterministic lexical embedding for a piece of text.
#[must_use]
pub fn lexical_embedding(text: &str) -> Vec<f32> {
    lexical_embedding_with_dim(text, DEFAULT_EMBEDDING_DIM)
}

/// Create a deterministic lexical embedding with a custom dimension.
#[must_use]
pub fn lexical_embedding_with_dim(text: &str, dim: usize) -> Vec<f32> {
    if dim == 0 {
        return Vec::new();
    }

    let mut vec = vec![0.0f32; dim];
    let mut count = 0u32;

    for token in tokenize(&text.to_ascii_lowercase()) {
        let mut h = Hasher::new();
        h.update(token.as_bytes());
        let hash = h.finalize();

        let bytes = hash.as_bytes();
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&bytes[..8]);
        let bucket = u64::from_le_bytes(bucket_bytes);

        #[allow(clippy::cast_possible_truncation)]
        let idx = (bucket % dim as u64) as usize;
        let sign = if (bytes[8] & 1) == 0 { 1.0f32 } else { -1.0f32 };
        vec[idx] += sign;
        count = count.saturating_add(1);
    }

    if count == 0 {
        return vec;
    }

    // L2-normalize.
    let norm2: f64 = vec.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
    if norm2 > 0.0 {
        #[allow(clippy::cast_possible_truncation)]
        let invf = norm2.sqrt().recip() as f32;
        for x in &mut vec {
            *x *= invf;
        }
    }

    vec
}

/// Cosine similarity in [-1, 1]; 0.0 for empty, zero-norm or mismatched inputs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let xf = f64::from(x);
        let yf = f64::from(y);
        dot += xf * yf;
        norm_a += xf * xf;
        norm_b += yf * yf;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        #[allow(clippy::cast_possible_truncation)]
        let sim = sim.clamp(-1.0, 1.0) as f32;
        sim
    } else {
        0.0
    }
}

/// Feature-hashing embedder backed by [`lexical_embedding_with_dim`].
#[derive(Debug, Clone, Copy)]
pub struct LexicalEmbedder {
    dim: usize,
}

impl LexicalEmbedder {
    /// Creates an embedder with the given dimension.
    #[must_use]
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Embedding dimension.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl EmbeddingProvider for LexicalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.dim == 0 {
            return Err(EmbeddingError::Unavailable("lexical embedder has zero dimension".to_string()));
        }
        Ok(lexical_embedding_with_dim(text, self.dim))
    }

    fn name(&self) -> &str {
        "lexical"
    }
}

/// Wraps a provider so every call is bounded by a timeout.
///
/// The call runs on a helper thread; a late answer is discarded.
#[derive(Clone)]
pub struct TimedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
}

impl TimedEmbedder {
    /// Wraps `inner` with `timeout`.
    #[must_use]
    pub fn new(inner: Arc<dyn EmbeddingProvider>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl EmbeddingProvider for TimedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        call_with_timeout(self.timeout, move || inner.embed(&text)).unwrap_or_else(|_| {
            Err(EmbeddingError::Timeout {
                duration_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
