//! Full cycles with stub collaborators: discovery, curation, document sync,
//! lock contention and taxonomy refresh.

use std::path::PathBuf;
use std::time::Duration;

use playbook::config::Config;
use playbook::cycle::{Collaborators, CycleOrchestrator, CycleRequest, CycleStatus};
use playbook::epoch::{EpochTracker, TrainingCache};
use playbook::lock::CycleLock;
use playbook::ports::{FileTaxonomy, NoEvidence, NoopDiscovery, PatternObservation};
use playbook::similarity::SimilarityEngine;
use playbook::store::{Outcome, PatternStore, PatternType};

// ===========================================================================
// Helpers
// ===========================================================================

fn temp_root(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("playbook-test-cycle-{tag}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn observation(id: &str, name: &str, outcome: Outcome) -> PatternObservation {
    PatternObservation {
        id: id.into(),
        name: name.into(),
        domain: "python".into(),
        pattern_type: PatternType::Helpful,
        description: String::new(),
        language: "python".into(),
        confidence: Some(0.9),
        outcome: Some(outcome),
        insight: String::new(),
        recommendation: "keep doing it".into(),
        applied_correctly: true,
    }
}

fn collaborators(config: &Config, found: Vec<PatternObservation>) -> Collaborators {
    Collaborators {
        discovery: Box::new(NoopDiscovery::returning(found)),
        evidence: Box::new(NoEvidence),
        taxonomy: Box::new(FileTaxonomy::new(config.paths.taxonomy.clone())),
    }
}

fn request(path: &str) -> CycleRequest {
    CycleRequest {
        file_path: path.into(),
        source: Some("def f(x):\n    if not x:\n        return None\n".into()),
        language: Some("python".into()),
    }
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn cycle_curates_records_and_syncs() {
    let root = temp_root("happy");
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let parts = collaborators(&config, vec![observation("guards", "guard clauses", Outcome::Success)]);

    let outcome = CycleOrchestrator::new(&config, &similarity, &parts)
        .run(&request("app.py"))
        .await;

    assert!(outcome.proceed);
    assert_eq!(outcome.status, CycleStatus::Completed);
    assert_eq!(outcome.decisions.len(), 1);
    assert_eq!(outcome.decisions[0].decision, "create");
    assert_eq!(outcome.epoch, None);

    let doc = std::fs::read_to_string(&config.paths.document).unwrap();
    let bullet = outcome.decisions[0].bullet_id.clone().unwrap();
    assert!(doc.contains(&format!("[{bullet}]")));

    let store = PatternStore::open(&config.paths.store).unwrap();
    assert_eq!(store.insights_for("guards").unwrap().len(), 1);
    let observations = store.observations_for("guards").unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].file_path.as_deref(), Some("app.py"));
    assert_eq!(TrainingCache::len(&store).unwrap(), 1);

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["continue"], true);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn repeat_cycle_accumulates_and_updates_one_bullet() {
    let root = temp_root("repeat");
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let parts = collaborators(&config, vec![observation("guards", "guard clauses", Outcome::Failure)]);
    let orchestrator = CycleOrchestrator::new(&config, &similarity, &parts);

    orchestrator.run(&request("a.py")).await;
    let second = orchestrator.run(&request("b.py")).await;

    assert_eq!(second.status, CycleStatus::Completed);
    assert_eq!(second.decisions[0].decision, "create");
    let store = PatternStore::open(&config.paths.store).unwrap();
    let guards = store.get_by_id("guards").unwrap().unwrap();
    assert_eq!(guards.counts.observations, 2);
    assert_eq!(store.observations_for("guards").unwrap().len(), 2);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn nothing_discovered_leaves_document_alone() {
    let root = temp_root("empty");
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let parts = collaborators(&config, Vec::new());

    let outcome = CycleOrchestrator::new(&config, &similarity, &parts)
        .run(&request("a.py"))
        .await;

    assert_eq!(outcome.status, CycleStatus::Completed);
    assert!(outcome.decisions.is_empty());
    assert!(outcome.document.is_none());
    assert!(!config.paths.document.exists());
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn unreadable_file_degrades_but_continues() {
    let root = temp_root("missing");
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let parts = Collaborators::noop();

    let outcome = CycleOrchestrator::new(&config, &similarity, &parts)
        .run(&CycleRequest {
            file_path: "does/not/exist.py".into(),
            ..CycleRequest::default()
        })
        .await;

    assert!(outcome.proceed);
    assert_eq!(outcome.status, CycleStatus::Degraded);
    let _ = std::fs::remove_dir_all(&root);
}

// ===========================================================================
// Single flight
// ===========================================================================

#[tokio::test]
async fn held_lock_skips_cycle() {
    let root = temp_root("locked");
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let parts = collaborators(&config, vec![observation("guards", "guard clauses", Outcome::Success)]);
    let held = CycleLock::try_acquire(&config.paths.lock, Duration::from_secs(600))
        .unwrap()
        .expect("lock free");

    let outcome = CycleOrchestrator::new(&config, &similarity, &parts)
        .run(&request("a.py"))
        .await;

    assert!(outcome.proceed);
    assert_eq!(outcome.status, CycleStatus::Skipped);
    assert!(outcome.decisions.is_empty());
    drop(held);

    let again = CycleOrchestrator::new(&config, &similarity, &parts)
        .run(&request("a.py"))
        .await;
    assert_eq!(again.status, CycleStatus::Completed);
    let _ = std::fs::remove_dir_all(&root);
}

// ===========================================================================
// Taxonomy and epochs
// ===========================================================================

#[tokio::test]
async fn crossing_the_modulus_refreshes_taxonomy() {
    let root = temp_root("taxonomy");
    let mut config = Config::with_root(&root);
    config.thresholds.taxonomy_modulus = 2;
    let similarity = SimilarityEngine::jaccard_only();
    let parts = collaborators(
        &config,
        vec![
            observation("guards", "guard clauses", Outcome::Success),
            observation("ctx", "context managers for files", Outcome::Success),
        ],
    );

    let outcome = CycleOrchestrator::new(&config, &similarity, &parts)
        .run(&request("a.py"))
        .await;

    assert!(outcome.taxonomy_refreshed);
    let taxonomy: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config.paths.taxonomy).unwrap()).unwrap();
    assert_eq!(taxonomy["total_patterns"], 2);
    assert_eq!(taxonomy["domains"]["python"]["count"], 2);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn running_epoch_receives_evolution_records() {
    let root = temp_root("epoch");
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let tracker = EpochTracker::new(config.thresholds.max_epochs);
    {
        let mut store = PatternStore::open(&config.paths.store).unwrap();
        assert_eq!(tracker.start_epoch(&mut store).unwrap(), 1);
    }
    let parts = collaborators(&config, vec![observation("guards", "guard clauses", Outcome::Success)]);

    let outcome = CycleOrchestrator::new(&config, &similarity, &parts)
        .run(&request("a.py"))
        .await;

    assert_eq!(outcome.epoch, Some(1));
    let store = PatternStore::open(&config.paths.store).unwrap();
    let evolution = tracker.evolution_for(&store, "guards").unwrap();
    assert_eq!(evolution.len(), 1);
    assert_eq!(evolution[0].epoch_number, 1);
    let _ = std::fs::remove_dir_all(&root);
}
