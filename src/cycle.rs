//! One learning cycle: evidence, discovery, curation, document sync.
//!
//! The cycle is advisory. It never blocks on a held lock, never propagates
//! an error, and always reports `continue = true`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::curator::{Curator, Decision};
use crate::document::DocumentSync;
use crate::epoch::{EpochTracker, TrainingCache};
use crate::error::Result;
use crate::lock::CycleLock;
use crate::ports::{
    CachedDiscovery, CommandDiscovery, CommandEvidence, Discovery, Evidence, EvidenceSource,
    EvidenceStatus, FileContext, FileTaxonomy, NoEvidence, NoopDiscovery, NoopTaxonomy,
    PatternObservation, TaxonomyRefresh,
};
use crate::similarity::SimilarityEngine;
use crate::store::{NewInsight, NewObservation, PatternStore};
use crate::time::now_ms;

/// The external collaborators a cycle talks to.
pub struct Collaborators {
    pub discovery: Box<dyn Discovery>,
    pub evidence: Box<dyn EvidenceSource>,
    pub taxonomy: Box<dyn TaxonomyRefresh>,
}

impl Collaborators {
    pub fn noop() -> Self {
        Self {
            discovery: Box::new(NoopDiscovery::default()),
            evidence: Box::new(NoEvidence),
            taxonomy: Box::new(NoopTaxonomy),
        }
    }

    /// Discovery is always cache-backed; a configured command fills misses.
    pub fn from_config(config: &Config) -> Self {
        let inner: Option<Box<dyn Discovery>> = config.discovery.clone().map(|cmd| {
            Box::new(CommandDiscovery::new(cmd, config.timeouts.discovery)) as Box<dyn Discovery>
        });
        let evidence: Box<dyn EvidenceSource> = match &config.evidence {
            Some(cmd) => Box::new(CommandEvidence::new(
                cmd.clone(),
                config.timeouts.evidence,
                config.root.clone(),
            )),
            None => Box::new(NoEvidence),
        };
        Self {
            discovery: Box::new(CachedDiscovery::new(config.paths.discovery_cache.clone(), inner)),
            evidence,
            taxonomy: Box::new(FileTaxonomy::new(config.paths.taxonomy.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// Another cycle holds the lock.
    Skipped,
    /// Something failed; the error is in `message`.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub candidate: String,
    pub decision: &'static str,
    /// Surviving pattern id; absent after a prune.
    pub pattern_id: Option<String>,
    pub bullet_id: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    #[serde(rename = "continue")]
    pub proceed: bool,
    pub status: CycleStatus,
    pub message: String,
    pub evidence: EvidenceStatus,
    pub decisions: Vec<DecisionRecord>,
    pub taxonomy_refreshed: bool,
    pub document: Option<String>,
    pub epoch: Option<u32>,
}

impl CycleOutcome {
    fn new(status: CycleStatus, message: impl Into<String>) -> Self {
        Self {
            proceed: true,
            status,
            message: message.into(),
            evidence: EvidenceStatus::None,
            decisions: Vec::new(),
            taxonomy_refreshed: false,
            document: None,
            epoch: None,
        }
    }
}

/// Input for one cycle. `source` is read from `file_path` when absent.
#[derive(Debug, Clone, Default)]
pub struct CycleRequest {
    pub file_path: String,
    pub source: Option<String>,
    pub language: Option<String>,
}

/// What ingesting a batch of observations did to the store.
#[derive(Debug, Default)]
pub struct Ingested {
    pub decisions: Vec<DecisionRecord>,
    pub refined: usize,
}

impl Ingested {
    pub fn changed(&self) -> bool {
        !self.decisions.is_empty()
    }
}

/// Curate each observation, then append its insight and observation rows
/// and, inside a running epoch, an evolution record.
pub async fn ingest(
    store: &mut PatternStore,
    curator: &Curator<'_>,
    tracker: &EpochTracker,
    epoch: Option<u32>,
    observations: &[PatternObservation],
    evidence: &Evidence,
    file_path: &str,
) -> Result<Ingested> {
    let mut ingested = Ingested::default();
    for obs in observations {
        let outcome = obs.resolved_outcome(evidence);
        let curated = curator.curate(store, &obs.to_delta(outcome, now_ms())).await?;

        let mut record = DecisionRecord {
            candidate: obs.id.clone(),
            decision: curated.decision.label(),
            pattern_id: None,
            bullet_id: None,
            confidence: None,
        };
        if let Some(pattern) = &curated.pattern {
            let insight = if obs.insight.trim().is_empty() {
                format!("{} observed in {file_path}", pattern.name)
            } else {
                obs.insight.clone()
            };
            store.add_insight(
                &pattern.id,
                &NewInsight {
                    insight,
                    recommendation: obs.recommendation.clone(),
                    confidence: pattern.confidence,
                    applied_correctly: obs.applied_correctly,
                },
            )?;
            store.add_observation(
                &pattern.id,
                &NewObservation {
                    outcome,
                    test_status: Some(evidence.status.as_str().to_string()),
                    error_logs: evidence.error_logs(),
                    file_path: Some(file_path.to_string()),
                },
            )?;
            if let Some(epoch) = epoch
                && tracker.record_evolution(
                    store,
                    epoch,
                    &pattern.id,
                    curated.confidence_before,
                    pattern.confidence,
                    1,
                )?
            {
                ingested.refined += 1;
            }
            record.pattern_id = Some(pattern.id.clone());
            record.bullet_id = Some(pattern.bullet_id.clone());
            record.confidence = Some(pattern.confidence);
        } else if let Decision::Prune { .. } = curated.decision {
            tracing::debug!(candidate = %obs.id, "cycle: candidate pruned");
        }
        ingested.decisions.push(record);
    }
    Ok(ingested)
}

/// True when the count moved across a multiple of `modulus`.
pub fn crosses_modulus(before: u64, after: u64, modulus: u64) -> bool {
    modulus > 0 && after > 0 && before / modulus != after / modulus
}

/// Run `fut` under `limit`; failures and timeouts become `None`.
pub async fn bounded<T, F>(what: &'static str, limit: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!("cycle: {what} failed: {e}");
            None
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                "cycle: {what} timed out"
            );
            None
        }
    }
}

pub struct CycleOrchestrator<'a> {
    config: &'a Config,
    similarity: &'a SimilarityEngine,
    collaborators: &'a Collaborators,
}

impl<'a> CycleOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        similarity: &'a SimilarityEngine,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self {
            config,
            similarity,
            collaborators,
        }
    }

    /// Run one cycle. Never fails; lock contention is a successful no-op.
    pub async fn run(&self, request: &CycleRequest) -> CycleOutcome {
        let lock = match CycleLock::try_acquire(&self.config.paths.lock, self.config.timeouts.lock_stale) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::info!("cycle: another cycle holds the lock, skipping");
                return CycleOutcome::new(CycleStatus::Skipped, "another cycle is running");
            }
            Err(e) => {
                tracing::warn!("cycle: could not take lock: {e}");
                return CycleOutcome::new(CycleStatus::Degraded, e.user_message());
            }
        };

        let outcome = match self.run_locked(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_recoverable() {
                    tracing::warn!("cycle: degraded: {e}");
                } else {
                    tracing::error!("cycle: failed: {e}");
                }
                CycleOutcome::new(CycleStatus::Degraded, e.user_message())
            }
        };
        drop(lock);
        outcome
    }

    fn resolve(&self, file_path: &str) -> PathBuf {
        let path = Path::new(file_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.root.join(path)
        }
    }

    async fn run_locked(&self, request: &CycleRequest) -> Result<CycleOutcome> {
        let source = match &request.source {
            Some(source) => source.clone(),
            None => tokio::fs::read_to_string(self.resolve(&request.file_path)).await?,
        };
        let file = FileContext {
            path: request.file_path.clone(),
            language: request.language.clone(),
        };

        let timeouts = &self.config.timeouts;
        let evidence = bounded("evidence", timeouts.evidence, self.collaborators.evidence.gather())
            .await
            .unwrap_or_else(Evidence::none);
        let candidates = bounded(
            "discovery",
            timeouts.discovery,
            self.collaborators.discovery.discover(&source, &evidence, &file),
        )
        .await
        .unwrap_or_default();
        tracing::info!(
            file = %file.path,
            evidence = evidence.status.as_str(),
            candidates = candidates.len(),
            "cycle: discovery finished"
        );

        let mut outcome = CycleOutcome::new(CycleStatus::Completed, "");
        outcome.evidence = evidence.status;

        let mut store = PatternStore::open(&self.config.paths.store)?;
        let thresholds = &self.config.thresholds;
        let curator = Curator::new(self.similarity, thresholds);
        let tracker = EpochTracker::new(thresholds.max_epochs);
        let epoch = tracker.running_epoch(&store)?;
        outcome.epoch = epoch;

        let before = store.count()?;
        let ingested = ingest(
            &mut store,
            &curator,
            &tracker,
            epoch,
            &candidates,
            &evidence,
            &file.path,
        )
        .await?;
        let after = store.count()?;

        let detected: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        TrainingCache::add(
            &mut store,
            &file.path,
            &source,
            &detected,
            evidence.status.as_str(),
        )?;

        if crosses_modulus(before, after, thresholds.taxonomy_modulus) {
            let patterns = store.list_all()?;
            outcome.taxonomy_refreshed = bounded(
                "taxonomy refresh",
                timeouts.taxonomy,
                self.collaborators.taxonomy.refresh(&patterns),
            )
            .await
            .is_some();
        }

        if ingested.changed() {
            let patterns = store.list_all()?;
            match DocumentSync::from_paths(&self.config.paths).sync(&patterns).await {
                Ok(sync) => outcome.document = Some(sync.summary()),
                Err(e) => {
                    tracing::warn!("cycle: document sync failed: {e}");
                    outcome.document = Some(e.user_message());
                }
            }
        }

        outcome.message = format!(
            "{} candidates, {} patterns stored",
            candidates.len(),
            after
        );
        outcome.decisions = ingested.decisions;
        Ok(outcome)
    }
}
