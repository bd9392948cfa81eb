//! Portable JSON snapshots of the pattern store.

use std::collections::HashMap;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::curator::{Curator, Placement};
use crate::error::{PlaybookError, Result};
use crate::store::{Insight, Observation, Pattern, PatternStore};
use crate::time::iso_now;

pub const SNAPSHOT_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub patterns: usize,
    pub insights: usize,
    pub observations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub exported_at: String,
    #[serde(default)]
    pub project: String,
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub insights: Vec<Insight>,
    #[serde(default)]
    pub observations: Vec<Observation>,
    #[serde(default)]
    pub totals: Totals,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStrategy {
    /// Curator placement: same id accumulates, similar merges, else insert.
    #[default]
    Merge,
    /// Replace rows with the same id; insert the rest.
    Overwrite,
    /// Leave rows with the same id alone; insert the rest.
    #[serde(alias = "skip_existing")]
    SkipExisting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub merged: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub insights: usize,
    pub observations: usize,
}

pub fn export(store: &PatternStore, project: &str) -> Result<Snapshot> {
    let patterns = store.list_all()?;
    let insights = store.all_insights()?;
    let observations = store.all_observations()?;
    Ok(Snapshot {
        version: SNAPSHOT_VERSION.to_string(),
        exported_at: iso_now(),
        project: project.to_string(),
        totals: Totals {
            patterns: patterns.len(),
            insights: insights.len(),
            observations: observations.len(),
        },
        patterns,
        insights,
        observations,
    })
}

pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(snapshot)?).await?;
    Ok(())
}

/// Read and version-check a snapshot. Major versions 1 and 2 are accepted.
pub async fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let text = tokio::fs::read_to_string(path).await?;
    let snapshot: Snapshot = serde_json::from_str(&text)?;
    let major = snapshot.version.split('.').next().unwrap_or_default();
    if !matches!(major, "1" | "2") {
        return Err(PlaybookError::Other(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

/// Import `snapshot` into `store`. Children follow their pattern to
/// whichever id it resolved to; children of skipped patterns are dropped.
pub async fn import(
    store: &mut PatternStore,
    curator: &Curator<'_>,
    snapshot: &Snapshot,
    strategy: ImportStrategy,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut resolved: HashMap<&str, String> = HashMap::new();

    for pattern in &snapshot.patterns {
        let exists = store.get_by_id(&pattern.id)?.is_some();
        let target = match strategy {
            ImportStrategy::Merge => match curator.place(store, pattern).await? {
                Placement::Merged(id) => {
                    report.merged += 1;
                    Some(id)
                }
                Placement::Inserted(id) => {
                    report.inserted += 1;
                    Some(id)
                }
                Placement::Skipped => None,
            },
            ImportStrategy::Overwrite if exists => {
                report.replaced += 1;
                Some(store.replace_pattern(pattern)?.id)
            }
            ImportStrategy::SkipExisting if exists => None,
            ImportStrategy::Overwrite | ImportStrategy::SkipExisting => {
                report.inserted += 1;
                Some(store.insert_pattern(pattern)?.id)
            }
        };
        match target {
            Some(id) => {
                resolved.insert(pattern.id.as_str(), id);
            }
            None => report.skipped += 1,
        }
    }

    let mut insights: HashMap<&str, Vec<Insight>> = HashMap::new();
    for i in &snapshot.insights {
        if let Some(target) = resolved.get(i.pattern_id.as_str()) {
            insights.entry(target.as_str()).or_default().push(i.clone());
        }
    }
    let mut observations: HashMap<&str, Vec<Observation>> = HashMap::new();
    for o in &snapshot.observations {
        if let Some(target) = resolved.get(o.pattern_id.as_str()) {
            observations.entry(target.as_str()).or_default().push(o.clone());
        }
    }
    let mut targets: Vec<&str> = insights.keys().chain(observations.keys()).copied().collect();
    targets.sort_unstable();
    targets.dedup();
    for target in targets {
        let ins = insights.get(target).map(Vec::as_slice).unwrap_or_default();
        let obs = observations.get(target).map(Vec::as_slice).unwrap_or_default();
        store.import_children(target, ins, obs)?;
        report.insights += ins.len();
        report.observations += obs.len();
    }

    tracing::info!(
        strategy = ?strategy,
        inserted = report.inserted,
        merged = report.merged,
        replaced = report.replaced,
        skipped = report.skipped,
        "store: snapshot imported"
    );
    Ok(report)
}
