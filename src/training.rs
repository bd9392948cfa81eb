//! Offline multi-epoch training over a corpus directory.
//!
//! The first epoch sends every corpus file through discovery and caches it.
//! Later epochs replay cached files instead: each cached file re-observes the
//! patterns it produced, with the recorded test status as evidence. Offline
//! evidence is always `passed`.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Config;
use crate::curator::Curator;
use crate::cycle::{bounded, ingest};
use crate::document::DocumentSync;
use crate::epoch::{EpochTracker, TrainingCache, convergence};
use crate::error::{PlaybookError, Result};
use crate::lock::CycleLock;
use crate::ports::{Discovery, Evidence, EvidenceStatus, FileContext, PatternObservation};
use crate::similarity::SimilarityEngine;
use crate::store::PatternStore;

/// Extensions treated as source files when none are given.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "py", "rs", "js", "jsx", "ts", "tsx", "go", "java", "kt", "rb", "c", "h", "cpp", "hpp", "cs",
    "swift", "php", "sh",
];

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "venv", "dist", "build"];

#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub corpus: PathBuf,
    pub epochs: u32,
    /// Lower-case extensions without the dot; empty means [`DEFAULT_EXTENSIONS`].
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochSource {
    Corpus,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: u32,
    pub source: EpochSource,
    pub files: usize,
    pub candidates: usize,
    pub processed: u64,
    pub refined: u64,
    pub avg_confidence_before: f64,
    pub avg_confidence_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    /// The epoch cap stopped training early.
    pub capped: bool,
    pub patterns: u64,
    pub convergence_rate: f64,
    pub document: Option<String>,
}

/// Source files under `root`, sorted, skipping hidden and build directories.
pub fn collect_corpus(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let wanted: Vec<String> = if extensions.is_empty() {
        DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    } else {
        extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect()
    };
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if !SKIP_DIRS.contains(&name.as_ref()) {
                    pending.push(path);
                }
            } else if file_type.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| wanted.iter().any(|w| w.eq_ignore_ascii_case(e)))
            {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

pub struct Trainer<'a> {
    config: &'a Config,
    similarity: &'a SimilarityEngine,
    discovery: &'a dyn Discovery,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a Config, similarity: &'a SimilarityEngine, discovery: &'a dyn Discovery) -> Self {
        Self {
            config,
            similarity,
            discovery,
        }
    }

    /// Run up to `request.epochs` epochs. Holds the cycle lock throughout.
    pub async fn train(&self, request: &TrainingRequest) -> Result<TrainingReport> {
        let Some(_lock) = CycleLock::try_acquire(&self.config.paths.lock, self.config.timeouts.lock_stale)?
        else {
            return Err(PlaybookError::LockHeld);
        };

        let corpus = collect_corpus(&request.corpus, &request.extensions)?;
        tracing::info!(
            files = corpus.len(),
            epochs = request.epochs,
            "epoch: training over {}",
            request.corpus.display()
        );

        let mut store = PatternStore::open(&self.config.paths.store)?;
        let thresholds = &self.config.thresholds;
        let curator = Curator::new(self.similarity, thresholds);
        let tracker = EpochTracker::new(thresholds.max_epochs);

        let mut reports = Vec::new();
        let mut capped = false;
        let mut changed = false;
        for _ in 0..request.epochs {
            let last = tracker
                .list_epochs(&store)?
                .last()
                .map_or(0, |e| e.number);
            let epoch = tracker.start_epoch(&mut store)?;
            if epoch <= last {
                capped = true;
                break;
            }

            let cache_empty = TrainingCache::len(&store)? == 0;
            let (source, files, candidates) = if epoch == 1 || cache_empty {
                self.corpus_pass(&mut store, &curator, &tracker, epoch, &request.corpus, &corpus)
                    .await?
            } else {
                self.replay_pass(&mut store, &curator, &tracker, epoch).await?
            };
            changed |= candidates > 0;

            let stats = tracker.tally(&store, epoch)?;
            tracker.complete_epoch(&mut store, epoch, &stats)?;
            reports.push(EpochReport {
                epoch,
                source,
                files,
                candidates,
                processed: stats.processed,
                refined: stats.refined,
                avg_confidence_before: stats.avg_confidence_before,
                avg_confidence_after: stats.avg_confidence_after,
            });
        }

        let patterns = store.list_all()?;
        let document = if changed {
            Some(
                DocumentSync::from_paths(&self.config.paths)
                    .sync(&patterns)
                    .await?
                    .summary(),
            )
        } else {
            None
        };
        let convergence = convergence::check_all(&store, thresholds)?;

        Ok(TrainingReport {
            epochs: reports,
            capped,
            patterns: patterns.len() as u64,
            convergence_rate: convergence.convergence_rate,
            document,
        })
    }

    async fn corpus_pass(
        &self,
        store: &mut PatternStore,
        curator: &Curator<'_>,
        tracker: &EpochTracker,
        epoch: u32,
        root: &Path,
        files: &[PathBuf],
    ) -> Result<(EpochSource, usize, usize)> {
        let evidence = Evidence::with_status(EvidenceStatus::Passed);
        let mut candidates = 0;
        for path in files {
            let source = match tokio::fs::read_to_string(path).await {
                Ok(source) => source,
                Err(e) => {
                    tracing::debug!("epoch: skipping unreadable {}: {e}", path.display());
                    continue;
                }
            };
            let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy().into_owned();
            let file = FileContext {
                path: relative.clone(),
                language: path.extension().and_then(|e| e.to_str()).map(str::to_string),
            };
            let found = bounded(
                "discovery",
                self.config.timeouts.discovery,
                self.discovery.discover(&source, &evidence, &file),
            )
            .await
            .unwrap_or_default();
            candidates += found.len();

            ingest(store, curator, tracker, Some(epoch), &found, &evidence, &relative).await?;
            let detected: Vec<String> = found.iter().map(|o| o.id.clone()).collect();
            let id = TrainingCache::add(store, &relative, &source, &detected, evidence.status.as_str())?;
            TrainingCache::mark_consumed(store, id, epoch)?;
        }
        Ok((EpochSource::Corpus, files.len(), candidates))
    }

    async fn replay_pass(
        &self,
        store: &mut PatternStore,
        curator: &Curator<'_>,
        tracker: &EpochTracker,
        epoch: u32,
    ) -> Result<(EpochSource, usize, usize)> {
        let entries = TrainingCache::eligible_for(store, epoch)?;
        let mut candidates = 0;
        for entry in &entries {
            let mut observations = Vec::new();
            for id in &entry.detected_patterns {
                // Merged-away or pruned patterns have nothing left to re-observe.
                if let Some(pattern) = store.get_by_id(id)? {
                    observations.push(PatternObservation::replay(&pattern));
                }
            }
            candidates += observations.len();
            let evidence = Evidence::with_status(EvidenceStatus::parse(&entry.test_status));
            ingest(store, curator, tracker, Some(epoch), &observations, &evidence, &entry.file_path)
                .await?;
            TrainingCache::mark_consumed(store, entry.id, epoch)?;
        }
        Ok((EpochSource::Cache, entries.len(), candidates))
    }
}
