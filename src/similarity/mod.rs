//! Tiered text similarity with a guaranteed local fallback.
//!
//! Tiers are tried in order. Any error, timeout, or non-finite score from a
//! tier falls through to the next one; token-set Jaccard always answers.

pub mod embedding;
pub mod external;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Result;
use crate::store::Pattern;

pub use embedding::{EmbeddingCache, EmbeddingTier};
pub use external::ExternalScorer;

/// Weight of the name overlap in the fallback score; description gets the rest.
pub const NAME_WEIGHT: f64 = 0.6;
pub const DESCRIPTION_WEIGHT: f64 = 0.4;

/// The text of a pattern as the similarity tiers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternText {
    pub name: String,
    pub description: String,
}

impl PatternText {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn of(pattern: &Pattern) -> Self {
        Self::new(pattern.name.clone(), pattern.description.clone())
    }

    /// Single string form used by the semantic tiers.
    pub fn combined(&self) -> String {
        match (self.name.trim(), self.description.trim()) {
            (name, "") => name.to_string(),
            ("", desc) => desc.to_string(),
            (name, desc) => format!("{name}. {desc}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    External,
    Embedding,
    Jaccard,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Embedding => "embedding",
            Self::Jaccard => "jaccard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub score: f64,
    pub method: Method,
}

/// One optional scorer in the chain.
#[async_trait]
pub trait SimilarityTier: Send + Sync {
    fn method(&self) -> Method;

    async fn score(&self, a: &PatternText, b: &PatternText) -> Result<f64>;
}

pub struct SimilarityEngine {
    tiers: Vec<Box<dyn SimilarityTier>>,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::jaccard_only()
    }
}

impl SimilarityEngine {
    pub fn jaccard_only() -> Self {
        Self { tiers: Vec::new() }
    }

    /// Semantic tiers tried in order before the Jaccard fallback.
    pub fn with_tiers(tiers: Vec<Box<dyn SimilarityTier>>) -> Self {
        Self { tiers }
    }

    /// External scorer first, then embeddings, as configured.
    pub fn from_config(config: &Config) -> Self {
        let mut tiers: Vec<Box<dyn SimilarityTier>> = Vec::new();
        if let Some(ref command) = config.scorer {
            tiers.push(Box::new(ExternalScorer::new(
                command.clone(),
                config.timeouts.scorer,
            )));
        }
        if let Some(ref embedding) = config.embedding {
            let cache = match EmbeddingCache::open(&config.paths.embedding_cache) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    tracing::warn!("similarity: embedding cache unavailable, continuing uncached: {e}");
                    None
                }
            };
            match EmbeddingTier::new(embedding.clone(), config.timeouts.embedding, cache) {
                Ok(tier) => tiers.push(Box::new(tier)),
                Err(e) => tracing::warn!("similarity: embedding tier disabled: {e}"),
            }
        }
        Self { tiers }
    }

    pub fn tier_methods(&self) -> Vec<Method> {
        self.tiers.iter().map(|t| t.method()).collect()
    }

    /// Similarity in [0, 1] with the label of the tier that produced it. Never fails.
    pub async fn similarity(&self, a: &PatternText, b: &PatternText) -> Similarity {
        for tier in &self.tiers {
            match tier.score(a, b).await {
                Ok(score) if score.is_finite() => {
                    return Similarity {
                        score: score.clamp(0.0, 1.0),
                        method: tier.method(),
                    };
                }
                Ok(score) => {
                    tracing::debug!(method = tier.method().as_str(), score, "similarity: non-finite score, falling through");
                }
                Err(e) => {
                    tracing::debug!(method = tier.method().as_str(), "similarity: tier failed, falling through: {e}");
                }
            }
        }
        Similarity {
            score: fallback_score(a, b),
            method: Method::Jaccard,
        }
    }
}

/// Weighted Jaccard of name and description tokens.
pub fn fallback_score(a: &PatternText, b: &PatternText) -> f64 {
    let score = NAME_WEIGHT * jaccard(&a.name, &b.name)
        + DESCRIPTION_WEIGHT * jaccard(&a.description, &b.description);
    score.clamp(0.0, 1.0)
}

/// Token-set Jaccard over lower-cased whitespace tokens; 0 if either side is empty.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

fn tokens(s: &str) -> HashSet<String> {
    s.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Cosine similarity of two vectors mapped into [0, 1] (negative → 0).
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
    cos.is_finite().then(|| cos.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlaybookError;

    struct Failing;

    #[async_trait]
    impl SimilarityTier for Failing {
        fn method(&self) -> Method {
            Method::External
        }
        async fn score(&self, _: &PatternText, _: &PatternText) -> Result<f64> {
            Err(PlaybookError::Timeout(10))
        }
    }

    struct Fixed(f64, Method);

    #[async_trait]
    impl SimilarityTier for Fixed {
        fn method(&self) -> Method {
            self.1
        }
        async fn score(&self, _: &PatternText, _: &PatternText) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[test]
    fn jaccard_basics() {
        assert_eq!(jaccard("use typed dict", "USE Typed dict"), 1.0);
        assert_eq!(jaccard("a b", "c d"), 0.0);
        assert!((jaccard("a b c", "a b d") - 0.5).abs() < 1e-9);
        assert_eq!(jaccard("", ""), 0.0);
        assert_eq!(jaccard("a", "   "), 0.0);
    }

    #[test]
    fn fallback_weights_name_over_description() {
        let a = PatternText::new("typed dict", "alpha");
        let b = PatternText::new("typed dict", "beta");
        assert!((fallback_score(&a, &b) - 0.6).abs() < 1e-9);
        let c = PatternText::new("other", "alpha");
        assert!((fallback_score(&a, &c) - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failing_tiers_fall_through_to_jaccard() {
        let engine = SimilarityEngine::with_tiers(vec![
            Box::new(Failing),
            Box::new(Fixed(f64::NAN, Method::Embedding)),
        ]);
        let a = PatternText::new("use dataclasses", "prefer dataclasses");
        let sim = engine.similarity(&a, &a).await;
        assert_eq!(sim.method, Method::Jaccard);
        assert_eq!(sim.score, 1.0);
    }

    #[tokio::test]
    async fn first_healthy_tier_wins_and_is_clamped() {
        let engine = SimilarityEngine::with_tiers(vec![
            Box::new(Failing),
            Box::new(Fixed(1.7, Method::Embedding)),
        ]);
        let sim = engine
            .similarity(&PatternText::new("a", ""), &PatternText::new("b", ""))
            .await;
        assert_eq!(sim.method, Method::Embedding);
        assert_eq!(sim.score, 1.0);
    }

    #[tokio::test]
    async fn empty_text_scores_zero() {
        let engine = SimilarityEngine::jaccard_only();
        let empty = PatternText::new("", "");
        let sim = engine.similarity(&empty, &empty).await;
        assert_eq!(sim.score, 0.0);
        assert!(sim.score.is_finite());
    }

    #[test]
    fn cosine_maps_into_unit_range() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine(&[1.0, 0.0], &[-1.0, 0.0]), Some(0.0));
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn combined_text_joins_parts() {
        assert_eq!(PatternText::new("a", "b").combined(), "a. b");
        assert_eq!(PatternText::new("a", " ").combined(), "a");
    }
}
