//! Per-pattern convergence: a pattern has converged once it has enough
//! observations and confidence snapshots, and its recent confidence has
//! stopped moving.

use std::fmt::Write as _;

use serde::Serialize;

use crate::config::Thresholds;
use crate::error::Result;
use crate::store::{Pattern, PatternStore};

/// Snapshots considered when measuring stability.
pub const STABILITY_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged { std_dev: f64 },
    Learning { std_dev: f64 },
    InsufficientData { reason: String },
}

impl ConvergenceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converged { .. } => "converged",
            Self::Learning { .. } => "learning",
            Self::InsufficientData { .. } => "insufficient_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternConvergence {
    pub id: String,
    pub bullet_id: String,
    pub name: String,
    pub observations: u64,
    pub snapshots: usize,
    pub confidence: f64,
    #[serde(flatten)]
    pub status: ConvergenceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub total: usize,
    pub converged: Vec<PatternConvergence>,
    pub learning: Vec<PatternConvergence>,
    pub insufficient: Vec<PatternConvergence>,
    pub convergence_rate: f64,
}

/// Population standard deviation. Zero for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

pub fn check_pattern(
    store: &PatternStore,
    pattern: &Pattern,
    thresholds: &Thresholds,
) -> Result<PatternConvergence> {
    let snapshots = store.snapshot_count(&pattern.id)?;
    let observations = pattern.counts.observations;

    let status = if observations < thresholds.min_observations_for_convergence {
        ConvergenceStatus::InsufficientData {
            reason: format!(
                "{observations}/{} observations",
                thresholds.min_observations_for_convergence
            ),
        }
    } else if snapshots < thresholds.min_snapshots_for_convergence {
        ConvergenceStatus::InsufficientData {
            reason: format!(
                "{snapshots}/{} confidence snapshots",
                thresholds.min_snapshots_for_convergence
            ),
        }
    } else {
        let recent = store.recent_confidences(&pattern.id, STABILITY_WINDOW)?;
        let spread = std_dev(&recent);
        if spread < thresholds.confidence_variance {
            ConvergenceStatus::Converged { std_dev: spread }
        } else {
            ConvergenceStatus::Learning { std_dev: spread }
        }
    };

    Ok(PatternConvergence {
        id: pattern.id.clone(),
        bullet_id: pattern.bullet_id.clone(),
        name: pattern.name.clone(),
        observations,
        snapshots,
        confidence: pattern.confidence,
        status,
    })
}

pub fn check_all(store: &PatternStore, thresholds: &Thresholds) -> Result<ConvergenceReport> {
    let mut report = ConvergenceReport::default();
    for pattern in store.list_all()? {
        let entry = check_pattern(store, &pattern, thresholds)?;
        match entry.status {
            ConvergenceStatus::Converged { .. } => report.converged.push(entry),
            ConvergenceStatus::Learning { .. } => report.learning.push(entry),
            ConvergenceStatus::InsufficientData { .. } => report.insufficient.push(entry),
        }
        report.total += 1;
    }
    if report.total > 0 {
        report.convergence_rate = report.converged.len() as f64 / report.total as f64;
    }
    Ok(report)
}

impl ConvergenceReport {
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Convergence Report\n\n");
        let _ = writeln!(
            out,
            "**{}/{} patterns converged** ({:.1}%)\n",
            self.converged.len(),
            self.total,
            self.convergence_rate * 100.0
        );
        for (title, entries) in [
            ("Converged", &self.converged),
            ("Learning", &self.learning),
            ("Insufficient Data", &self.insufficient),
        ] {
            if entries.is_empty() {
                continue;
            }
            let _ = writeln!(out, "## {title} ({})\n", entries.len());
            for e in entries {
                let detail = match &e.status {
                    ConvergenceStatus::Converged { std_dev } | ConvergenceStatus::Learning { std_dev } => {
                        format!("std dev {std_dev:.3}")
                    }
                    ConvergenceStatus::InsufficientData { reason } => reason.clone(),
                };
                let _ = writeln!(
                    out,
                    "- [{}] {} ({:.0}%, {} obs): {detail}",
                    e.bullet_id,
                    e.name,
                    e.confidence * 100.0,
                    e.observations
                );
            }
            out.push('\n');
        }
        out
    }
}
