//! Read-only views over the store: listings, stats and relevance retrieval.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::config::Thresholds;
use crate::epoch::{EpochStatus, EpochTracker};
use crate::error::Result;
use crate::store::{Pattern, PatternStore};
use crate::time::iso_timestamp;

pub const HIGH_CONFIDENCE: f64 = 0.7;
pub const MEDIUM_CONFIDENCE: f64 = 0.3;

const RELEVANCE_CONFIDENCE: f64 = 0.5;
const RELEVANCE_HELPFUL: f64 = 0.3;
const RELEVANCE_SUCCESS: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    High,
    Medium,
    Low,
}

impl Band {
    pub fn of(confidence: f64) -> Self {
        if confidence >= HIGH_CONFIDENCE {
            Self::High
        } else if confidence >= MEDIUM_CONFIDENCE {
            Self::Medium
        } else {
            Self::Low
        }
    }

    fn heading(&self) -> &'static str {
        match self {
            Self::High => "High Confidence (>= 70%)",
            Self::Medium => "Medium Confidence (30-70%)",
            Self::Low => "Low Confidence (< 30%)",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    /// Case-insensitive substring of domain or language.
    pub domain: Option<String>,
    pub min_confidence: f64,
}

impl PatternFilter {
    pub fn matches(&self, p: &Pattern) -> bool {
        if p.confidence < self.min_confidence {
            return false;
        }
        match &self.domain {
            Some(needle) if !needle.trim().is_empty() => {
                let needle = needle.trim().to_lowercase();
                p.domain.to_lowercase().contains(&needle) || p.language.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }
}

pub fn list_patterns(store: &PatternStore, filter: &PatternFilter) -> Result<Vec<Pattern>> {
    Ok(store
        .list_all()?
        .into_iter()
        .filter(|p| filter.matches(p))
        .collect())
}

/// Markdown listing grouped into confidence bands.
pub fn render_listing(patterns: &[Pattern]) -> String {
    if patterns.is_empty() {
        return "No patterns match.\n".to_string();
    }
    let mut out = format!("# Learned Patterns ({})\n", patterns.len());
    for band in [Band::High, Band::Medium, Band::Low] {
        let members: Vec<&Pattern> = patterns.iter().filter(|p| Band::of(p.confidence) == band).collect();
        if members.is_empty() {
            continue;
        }
        let _ = write!(out, "\n## {}\n\n", band.heading());
        for p in members {
            let _ = writeln!(
                out,
                "- [{}] **{}** ({}, {}) {:.0}% over {} observations",
                p.bullet_id,
                p.name,
                p.domain,
                p.pattern_type.as_str(),
                p.confidence * 100.0,
                p.counts.observations
            );
            if !p.description.trim().is_empty() {
                let _ = writeln!(out, "  {}", p.description.trim());
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainStats {
    pub count: usize,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpochSummary {
    pub total: usize,
    pub completed: usize,
    pub running: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub total_patterns: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total_observations: u64,
    pub success_rate: f64,
    pub domains: BTreeMap<String, DomainStats>,
    /// `(bullet_id, name, confidence)` of the five most confident patterns.
    pub top: Vec<(String, String, f64)>,
    pub prunable: usize,
    pub last_updated: Option<String>,
    pub epochs: EpochSummary,
}

pub fn stats(store: &PatternStore, thresholds: &Thresholds) -> Result<Stats> {
    let patterns = store.list_all()?;
    let mut stats = Stats {
        total_patterns: patterns.len(),
        ..Stats::default()
    };

    let mut successes = 0u64;
    for p in &patterns {
        match Band::of(p.confidence) {
            Band::High => stats.high += 1,
            Band::Medium => stats.medium += 1,
            Band::Low => stats.low += 1,
        }
        stats.total_observations += p.counts.observations;
        successes += p.counts.successes;
        let domain = stats.domains.entry(p.domain.clone()).or_default();
        domain.count += 1;
        domain.avg_confidence += p.confidence;
        if p.counts.observations >= thresholds.min_observations_before_prune
            && p.confidence < thresholds.prune
        {
            stats.prunable += 1;
        }
    }
    for domain in stats.domains.values_mut() {
        domain.avg_confidence /= domain.count as f64;
    }
    if stats.total_observations > 0 {
        stats.success_rate = successes as f64 / stats.total_observations as f64;
    }
    stats.top = patterns
        .iter()
        .take(5)
        .map(|p| (p.bullet_id.clone(), p.name.clone(), p.confidence))
        .collect();
    stats.last_updated = patterns.iter().map(|p| p.last_seen).max().map(iso_timestamp);

    let epochs = EpochTracker::new(thresholds.max_epochs).list_epochs(store)?;
    stats.epochs = EpochSummary {
        total: epochs.len(),
        completed: epochs.iter().filter(|e| e.status == EpochStatus::Completed).count(),
        running: epochs
            .iter()
            .find(|e| e.status == EpochStatus::Running)
            .map(|e| e.number),
    };
    Ok(stats)
}

impl Stats {
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Pattern Statistics\n\n");
        let _ = writeln!(out, "- Total patterns: {}", self.total_patterns);
        let _ = writeln!(
            out,
            "- High / medium / low: {} / {} / {}",
            self.high, self.medium, self.low
        );
        let _ = writeln!(out, "- Total observations: {}", self.total_observations);
        let _ = writeln!(out, "- Success rate: {:.1}%", self.success_rate * 100.0);
        let _ = writeln!(out, "- Prunable: {}", self.prunable);
        if let Some(ts) = &self.last_updated {
            let _ = writeln!(out, "- Last updated: {ts}");
        }
        let _ = writeln!(
            out,
            "- Epochs: {} ({} completed{})",
            self.epochs.total,
            self.epochs.completed,
            self.epochs
                .running
                .map(|n| format!(", epoch {n} running"))
                .unwrap_or_default()
        );
        if !self.domains.is_empty() {
            out.push_str("\n## Domains\n\n");
            for (name, d) in &self.domains {
                let _ = writeln!(
                    out,
                    "- {name}: {} patterns, avg confidence {:.0}%",
                    d.count,
                    d.avg_confidence * 100.0
                );
            }
        }
        if !self.top.is_empty() {
            out.push_str("\n## Top Patterns\n\n");
            for (bullet, name, confidence) in &self.top {
                let _ = writeln!(out, "- [{bullet}] {name} ({:.0}%)", confidence * 100.0);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranked {
    pub score: f64,
    pub pattern: Pattern,
}

/// `confidence * 0.5 + helpful_ratio * 0.3 + success_ratio * 0.2`
pub fn relevance(p: &Pattern) -> f64 {
    p.confidence * RELEVANCE_CONFIDENCE
        + p.helpful_ratio() * RELEVANCE_HELPFUL
        + p.success_ratio() * RELEVANCE_SUCCESS
}

/// Top `limit` patterns by relevance, optionally restricted to a domain.
pub fn retrieve(patterns: Vec<Pattern>, domain: Option<&str>, limit: usize) -> Vec<Ranked> {
    let filter = PatternFilter {
        domain: domain.map(str::to_string),
        min_confidence: 0.0,
    };
    let mut ranked: Vec<Ranked> = patterns
        .into_iter()
        .filter(|p| filter.matches(p))
        .map(|pattern| Ranked {
            score: relevance(&pattern),
            pattern,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.pattern.id.cmp(&b.pattern.id))
    });
    ranked.truncate(limit);
    ranked
}
