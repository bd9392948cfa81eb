//! Deterministic merge / create / prune decisions.
//!
//! A candidate is compared only against patterns of the same domain and
//! type. Its own stored row (same id) is not a merge candidate: a repeat
//! observation accumulates in place, and the prune floor is checked against
//! that accumulated aggregate.

use crate::config::Thresholds;
use crate::error::Result;
use crate::similarity::{Method, PatternText, SimilarityEngine};
use crate::store::{Counts, Pattern, PatternDelta, PatternStore};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Fold into an existing, sufficiently similar pattern.
    Merge {
        target_id: String,
        similarity: f64,
        method: Method,
    },
    /// Record under the candidate's own id (insert, or accumulate if present).
    Create,
    /// The aggregate met the observation floor with too little confidence.
    Prune { observations: u64, confidence: f64 },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Merge { .. } => "merge",
            Self::Create => "create",
            Self::Prune { .. } => "prune",
        }
    }
}

/// What a curation step did to the store.
#[derive(Debug, Clone)]
pub struct Curated {
    pub decision: Decision,
    /// Surviving pattern after the mutation; `None` after a prune.
    pub pattern: Option<Pattern>,
    /// Confidence of the surviving row before this step (0 for a new row).
    pub confidence_before: f64,
}

/// Result of placing a whole aggregate (import path).
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// Accumulated into or merged with this existing id.
    Merged(String),
    Inserted(String),
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConsolidationReport {
    /// `(source, target)` pairs merged away.
    pub merged: Vec<(String, String)>,
    pub pruned: Vec<String>,
}

impl ConsolidationReport {
    pub fn changed(&self) -> bool {
        !self.merged.is_empty() || !self.pruned.is_empty()
    }
}

pub struct Curator<'a> {
    similarity: &'a SimilarityEngine,
    thresholds: &'a Thresholds,
}

impl<'a> Curator<'a> {
    pub fn new(similarity: &'a SimilarityEngine, thresholds: &'a Thresholds) -> Self {
        Self {
            similarity,
            thresholds,
        }
    }

    /// Decide what to do with `delta` given the current pattern set.
    pub async fn decide(&self, delta: &PatternDelta, existing: &[Pattern]) -> Decision {
        let text = PatternText::new(delta.name.clone(), delta.description.clone());

        let mut best: Option<(&Pattern, f64, Method)> = None;
        for candidate in existing.iter().filter(|p| {
            p.id != delta.id && p.domain == delta.domain && p.pattern_type == delta.pattern_type
        }) {
            let sim = self
                .similarity
                .similarity(&text, &PatternText::of(candidate))
                .await;
            if best.is_none_or(|(_, score, _)| sim.score > score) {
                best = Some((candidate, sim.score, sim.method));
            }
        }

        if let Some((target, similarity, method)) = best
            && similarity >= self.thresholds.merge
        {
            return Decision::Merge {
                target_id: target.id.clone(),
                similarity,
                method,
            };
        }

        let own = existing.iter().find(|p| p.id == delta.id);
        let aggregate = delta.aggregate_with(own);
        if self.should_prune(&aggregate) {
            return Decision::Prune {
                observations: aggregate.observations,
                confidence: aggregate.confidence(),
            };
        }

        Decision::Create
    }

    pub fn should_prune(&self, counts: &Counts) -> bool {
        counts.observations >= self.thresholds.min_observations_before_prune
            && counts.confidence() < self.thresholds.prune
    }

    /// Decide against the store's current patterns and apply the decision.
    pub async fn curate(&self, store: &mut PatternStore, delta: &PatternDelta) -> Result<Curated> {
        let existing = store.list_all()?;
        let decision = self.decide(delta, &existing).await;
        let confidence_of = |id: &str| {
            existing
                .iter()
                .find(|p| p.id == id)
                .map_or(0.0, |p| p.confidence)
        };

        match decision {
            Decision::Merge {
                ref target_id,
                similarity,
                method,
            } => {
                let before = confidence_of(target_id);
                let pattern = store.merge_into(target_id, &delta.id, &delta.counts, delta.seen_at)?;
                tracing::info!(
                    source = %delta.id,
                    target = %target_id,
                    similarity,
                    method = method.as_str(),
                    "curator: merged"
                );
                Ok(Curated {
                    decision,
                    pattern: Some(pattern),
                    confidence_before: before,
                })
            }
            Decision::Create => {
                let before = confidence_of(&delta.id);
                let upserted = store.upsert(delta)?;
                if upserted.created {
                    tracing::info!(
                        id = %delta.id,
                        bullet = %upserted.pattern.bullet_id,
                        "curator: created"
                    );
                } else {
                    tracing::debug!(id = %delta.id, "curator: accumulated");
                }
                Ok(Curated {
                    decision,
                    pattern: Some(upserted.pattern),
                    confidence_before: before,
                })
            }
            Decision::Prune {
                observations,
                confidence,
            } => {
                let before = confidence_of(&delta.id);
                store.delete_cascade(&delta.id)?;
                tracing::info!(id = %delta.id, observations, confidence, "curator: pruned");
                Ok(Curated {
                    decision,
                    pattern: None,
                    confidence_before: before,
                })
            }
        }
    }

    /// Place a complete aggregate (with its own counts) into the store.
    ///
    /// An existing row with the same id accumulates; otherwise a similar
    /// pattern absorbs it; otherwise it is inserted unless it already meets
    /// the prune criteria.
    pub async fn place(&self, store: &mut PatternStore, incoming: &Pattern) -> Result<Placement> {
        if store.get_by_id(&incoming.id)?.is_some() {
            store.merge_into(&incoming.id, &incoming.id, &incoming.counts, incoming.last_seen)?;
            return Ok(Placement::Merged(incoming.id.clone()));
        }

        let delta = PatternDelta {
            id: incoming.id.clone(),
            name: incoming.name.clone(),
            domain: incoming.domain.clone(),
            pattern_type: incoming.pattern_type,
            description: incoming.description.clone(),
            language: incoming.language.clone(),
            counts: incoming.counts,
            seen_at: incoming.last_seen,
        };
        let existing = store.list_all()?;
        match self.decide(&delta, &existing).await {
            Decision::Merge { target_id, .. } => {
                store.merge_into(&target_id, &incoming.id, &incoming.counts, incoming.last_seen)?;
                Ok(Placement::Merged(target_id))
            }
            Decision::Prune { .. } => Ok(Placement::Skipped),
            Decision::Create => {
                let inserted = store.insert_pattern(incoming)?;
                Ok(Placement::Inserted(inserted.id))
            }
        }
    }

    /// Session-end pass over stored aggregates: pairwise dedup, then prune.
    ///
    /// Patterns are visited by observations (desc); a later pattern similar
    /// enough to an earlier one of the same domain and type merges into it.
    pub async fn consolidate(&self, store: &mut PatternStore) -> Result<ConsolidationReport> {
        let mut report = ConsolidationReport::default();
        let mut patterns = store.list_all()?;
        patterns.sort_by(|a, b| {
            b.counts
                .observations
                .cmp(&a.counts.observations)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut absorbed = vec![false; patterns.len()];
        for i in 0..patterns.len() {
            if absorbed[i] {
                continue;
            }
            let keeper = PatternText::of(&patterns[i]);
            for j in (i + 1)..patterns.len() {
                if absorbed[j]
                    || patterns[j].domain != patterns[i].domain
                    || patterns[j].pattern_type != patterns[i].pattern_type
                {
                    continue;
                }
                let sim = self
                    .similarity
                    .similarity(&keeper, &PatternText::of(&patterns[j]))
                    .await;
                if sim.score >= self.thresholds.merge {
                    store.merge_into(&patterns[i].id, &patterns[j].id, &Counts::default(), 0)?;
                    absorbed[j] = true;
                    report
                        .merged
                        .push((patterns[j].id.clone(), patterns[i].id.clone()));
                    tracing::info!(
                        source = %patterns[j].id,
                        target = %patterns[i].id,
                        similarity = sim.score,
                        "curator: consolidated duplicate"
                    );
                }
            }
        }

        for pattern in store.list_all()? {
            if self.should_prune(&pattern.counts) {
                store.delete_cascade(&pattern.id)?;
                tracing::info!(
                    id = %pattern.id,
                    observations = pattern.counts.observations,
                    confidence = pattern.confidence,
                    "curator: pruned low-confidence pattern"
                );
                report.pruned.push(pattern.id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Outcome, PatternType};
    use crate::time::now_ms;

    fn delta(id: &str, name: &str, outcome: Outcome) -> PatternDelta {
        PatternDelta {
            id: id.to_string(),
            name: name.to_string(),
            domain: "python".to_string(),
            pattern_type: PatternType::Helpful,
            description: "prefer typed dictionaries for structured payloads".to_string(),
            language: "python".to_string(),
            counts: Counts::single(outcome),
            seen_at: now_ms(),
        }
    }

    #[tokio::test]
    async fn create_on_empty_store() {
        let engine = SimilarityEngine::jaccard_only();
        let thresholds = Thresholds::default();
        let curator = Curator::new(&engine, &thresholds);
        let mut store = PatternStore::open_in_memory().unwrap();

        let out = curator
            .curate(&mut store, &delta("py-typed", "Use TypedDict", Outcome::Success))
            .await
            .unwrap();
        assert_eq!(out.decision, Decision::Create);
        assert_eq!(out.pattern.unwrap().confidence, 1.0);
    }

    #[tokio::test]
    async fn similar_candidate_merges() {
        let engine = SimilarityEngine::jaccard_only();
        let thresholds = Thresholds::default();
        let curator = Curator::new(&engine, &thresholds);
        let mut store = PatternStore::open_in_memory().unwrap();

        curator
            .curate(&mut store, &delta("py-typed", "Use TypedDict", Outcome::Success))
            .await
            .unwrap();
        let out = curator
            .curate(&mut store, &delta("py-typed-2", "use typeddict", Outcome::Success))
            .await
            .unwrap();
        assert!(matches!(out.decision, Decision::Merge { ref target_id, .. } if target_id == "py-typed"));
        assert_eq!(out.pattern.unwrap().counts.observations, 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn different_type_never_merges() {
        let engine = SimilarityEngine::jaccard_only();
        let thresholds = Thresholds::default();
        let curator = Curator::new(&engine, &thresholds);
        let mut store = PatternStore::open_in_memory().unwrap();

        curator
            .curate(&mut store, &delta("py-a", "Use TypedDict", Outcome::Success))
            .await
            .unwrap();
        let mut harmful = delta("py-b", "Use TypedDict", Outcome::Failure);
        harmful.pattern_type = PatternType::Harmful;
        let out = curator.curate(&mut store, &harmful).await.unwrap();
        assert_eq!(out.decision, Decision::Create);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn prune_waits_for_observation_floor() {
        let engine = SimilarityEngine::jaccard_only();
        let thresholds = Thresholds::default();
        let curator = Curator::new(&engine, &thresholds);
        let mut store = PatternStore::open_in_memory().unwrap();

        // Two successes then failures: confidence drops well below 0.30 early,
        // but the row must survive until the 10th observation.
        for outcome in [Outcome::Success, Outcome::Success] {
            curator
                .curate(&mut store, &delta("py-bad", "Bare except", outcome))
                .await
                .unwrap();
        }
        for n in 3..10 {
            let out = curator
                .curate(&mut store, &delta("py-bad", "Bare except", Outcome::Failure))
                .await
                .unwrap();
            assert_eq!(out.decision, Decision::Create, "pruned early at {n}");
        }
        let out = curator
            .curate(&mut store, &delta("py-bad", "Bare except", Outcome::Failure))
            .await
            .unwrap();
        assert!(matches!(out.decision, Decision::Prune { observations: 10, .. }));
        assert!(store.get_by_id("py-bad").unwrap().is_none());
        assert!(store.insights_for("py-bad").unwrap().is_empty());
    }

    #[tokio::test]
    async fn consolidate_merges_duplicates_and_prunes() {
        let engine = SimilarityEngine::jaccard_only();
        let thresholds = Thresholds::default();
        let curator = Curator::new(&engine, &thresholds);
        let mut store = PatternStore::open_in_memory().unwrap();

        store.upsert(&delta("py-a", "Use TypedDict", Outcome::Success)).unwrap();
        store.upsert(&delta("py-a", "Use TypedDict", Outcome::Success)).unwrap();
        store.upsert(&delta("py-b", "use typeddict", Outcome::Failure)).unwrap();
        let mut weak = delta("py-weak", "Globals everywhere", Outcome::Failure);
        weak.description = "module level mutable state".into();
        weak.counts = Counts {
            observations: 12,
            successes: 1,
            failures: 11,
            ..Counts::default()
        };
        store.upsert(&weak).unwrap();

        let report = curator.consolidate(&mut store).await.unwrap();
        assert_eq!(report.merged, vec![("py-b".to_string(), "py-a".to_string())]);
        assert_eq!(report.pruned, vec!["py-weak".to_string()]);
        let survivor = store.get_by_id("py-a").unwrap().unwrap();
        assert_eq!(survivor.counts.observations, 3);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn place_accumulates_existing_id() {
        let engine = SimilarityEngine::jaccard_only();
        let thresholds = Thresholds::default();
        let curator = Curator::new(&engine, &thresholds);
        let mut store = PatternStore::open_in_memory().unwrap();

        let created = store
            .upsert(&delta("py-a", "Use TypedDict", Outcome::Success))
            .unwrap()
            .pattern;
        let placement = curator.place(&mut store, &created).await.unwrap();
        assert_eq!(placement, Placement::Merged("py-a".into()));
        assert_eq!(
            store.get_by_id("py-a").unwrap().unwrap().counts.observations,
            2
        );
    }
}
