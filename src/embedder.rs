//! The embedder boundary.
//!
//! A real deployment plugs in an ML model as an external collaborator (the
//! donor's own `ort`/`tokenizers`/E5 stack is exactly that shape, just
//! in-process). This crate defines the trait contract such a collaborator
//! must satisfy and ships one concrete, dependency-free implementation: a
//! deterministic hash-based embedding that is stable across runs and
//! similar for token-overlapping inputs, standing in for the real model so
//! the rest of the pipeline (cache, ANN, search) can be built and tested
//! without one.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, thiserror::Error)]
#[error("embedder failed at item {index}: {message}")]
pub struct EmbedderError {
    pub index: usize,
    pub message: String,
}

pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;

    /// Embed a batch of texts. Returns one vector per input in order, or an
    /// error pinpointing the failing item; the caller (the indexer) is
    /// responsible for isolating a single bad item rather than failing the
    /// whole batch (see the batching rules in the indexer design).
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError>;
}

/// Deterministic local stand-in. Tokenizes on word boundaries, hashes each
/// token into a fixed-size accumulator, and L2-normalizes the result so
/// cosine similarity behaves sensibly. Two inputs that share many tokens
/// land close together; this is intentionally crude — it exists to give the
/// rest of the system a real `Embedder` to run against, not to produce
/// useful search results on its own.
pub struct HashEmbedder {
    model_name: String,
    dimension: usize,
    max_length: usize,
}

impl HashEmbedder {
    pub fn new(model_name: impl Into<String>, dimension: usize, max_length: usize) -> Self {
        HashEmbedder {
            model_name: model_name.into(),
            dimension,
            max_length,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0f32; self.dimension];
        let tokens = tokenize(text, self.max_length);
        for token in &tokens {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let slot = (h as usize) % self.dimension;
            // Second hash bit picks a sign so unrelated tokens don't all
            // push the same dimension positive (a cheap random-projection
            // flavor, matching the "stand-in" note above).
            let sign = if (h >> 1) & 1 == 0 { 1.0 } else { -1.0 };
            acc[slot] += sign;
        }
        let norm = acc.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut acc {
                *v /= norm;
            }
        }
        acc
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn tokenize(text: &str, max_length: usize) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        for word in split_camel_case(raw) {
            tokens.push(word.to_lowercase());
            if tokens.len() >= max_length {
                return tokens;
            }
        }
    }
    tokens
}

fn split_camel_case(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in word.chars() {
        if c.is_uppercase() && prev_lower {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
        }
        prev_lower = c.is_lowercase();
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
