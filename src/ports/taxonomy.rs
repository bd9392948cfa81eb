use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::store::{Pattern, PatternType};
use crate::time::iso_now;

/// Told when the pattern population crosses a refresh boundary.
#[async_trait]
pub trait TaxonomyRefresh: Send + Sync {
    async fn refresh(&self, patterns: &[Pattern]) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct NoopTaxonomy;

#[async_trait]
impl TaxonomyRefresh for NoopTaxonomy {
    async fn refresh(&self, _: &[Pattern]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DomainSummary {
    pub count: usize,
    pub avg_confidence: f64,
    pub helpful: usize,
    pub harmful: usize,
    pub neutral: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Taxonomy {
    pub generated_at: String,
    pub total_patterns: usize,
    pub domains: BTreeMap<String, DomainSummary>,
}

impl Taxonomy {
    pub fn summarize(patterns: &[Pattern]) -> Self {
        let mut domains: BTreeMap<String, DomainSummary> = BTreeMap::new();
        for p in patterns {
            let entry = domains.entry(p.domain.clone()).or_default();
            entry.count += 1;
            entry.avg_confidence += p.confidence;
            match p.pattern_type {
                PatternType::Helpful => entry.helpful += 1,
                PatternType::Harmful => entry.harmful += 1,
                PatternType::Neutral => entry.neutral += 1,
            }
        }
        for summary in domains.values_mut() {
            summary.avg_confidence /= summary.count as f64;
        }
        Self {
            generated_at: iso_now(),
            total_patterns: patterns.len(),
            domains,
        }
    }
}

/// Writes a per-domain summary as JSON.
pub struct FileTaxonomy {
    path: PathBuf,
}

impl FileTaxonomy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaxonomyRefresh for FileTaxonomy {
    async fn refresh(&self, patterns: &[Pattern]) -> Result<()> {
        let taxonomy = Taxonomy::summarize(patterns);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&taxonomy)?).await?;
        tracing::info!(
            domains = taxonomy.domains.len(),
            patterns = taxonomy.total_patterns,
            "taxonomy: refreshed {}",
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Counts;

    fn pattern(id: &str, domain: &str, pattern_type: PatternType, confidence: f64) -> Pattern {
        Pattern {
            id: id.into(),
            bullet_id: format!("{domain}-00001"),
            name: id.into(),
            domain: domain.into(),
            pattern_type,
            description: String::new(),
            language: String::new(),
            counts: Counts::default(),
            confidence,
            last_seen: 0,
            created_at: 0,
        }
    }

    #[test]
    fn summary_groups_by_domain() {
        let taxonomy = Taxonomy::summarize(&[
            pattern("a", "python", PatternType::Helpful, 0.8),
            pattern("b", "python", PatternType::Harmful, 0.4),
            pattern("c", "rust", PatternType::Neutral, 1.0),
        ]);
        assert_eq!(taxonomy.total_patterns, 3);
        let py = &taxonomy.domains["python"];
        assert_eq!(py.count, 2);
        assert!((py.avg_confidence - 0.6).abs() < 1e-9);
        assert_eq!((py.helpful, py.harmful), (1, 1));
    }

    #[tokio::test]
    async fn file_taxonomy_writes_json() {
        let dir = std::env::temp_dir().join(format!("playbook-taxonomy-{}", std::process::id()));
        let path = dir.join("taxonomy.json");
        FileTaxonomy::new(&path)
            .refresh(&[pattern("a", "go", PatternType::Helpful, 1.0)])
            .await
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["domains"]["go"]["count"], 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
