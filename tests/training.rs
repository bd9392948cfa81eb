//! Multi-epoch training: corpus pass, cache replay, epoch cap and convergence.

use std::path::PathBuf;
use std::time::Duration;

use playbook::config::Config;
use playbook::epoch::{EpochStatus, EpochTracker, TrainingCache, convergence};
use playbook::error::PlaybookError;
use playbook::lock::CycleLock;
use playbook::ports::{NoopDiscovery, PatternObservation};
use playbook::similarity::SimilarityEngine;
use playbook::store::{PatternStore, PatternType};
use playbook::training::{EpochSource, Trainer, TrainingRequest};

fn temp_root(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("playbook-test-train-{tag}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn corpus(root: &std::path::Path) -> PathBuf {
    let corpus = root.join("corpus");
    std::fs::create_dir_all(corpus.join("pkg")).unwrap();
    std::fs::write(corpus.join("a.py"), "def a(x):\n    if not x:\n        return\n").unwrap();
    std::fs::write(corpus.join("pkg/b.py"), "def b(y):\n    if y is None:\n        return\n").unwrap();
    std::fs::write(corpus.join("README.md"), "ignored").unwrap();
    corpus
}

fn guard_discovery() -> NoopDiscovery {
    NoopDiscovery::returning(vec![PatternObservation {
        id: "guards".into(),
        name: "guard clauses".into(),
        domain: "python".into(),
        pattern_type: PatternType::Helpful,
        description: "return early on invalid input".into(),
        language: "python".into(),
        confidence: None,
        outcome: None,
        insight: String::new(),
        recommendation: String::new(),
        applied_correctly: true,
    }])
}

// ===========================================================================
// Epoch state machine
// ===========================================================================

#[test]
fn sixth_epoch_request_returns_the_cap() {
    let mut store = PatternStore::open_in_memory().unwrap();
    let tracker = EpochTracker::new(5);

    for expected in 1..=5 {
        assert_eq!(tracker.start_epoch(&mut store).unwrap(), expected);
    }
    assert_eq!(tracker.start_epoch(&mut store).unwrap(), 5);

    let epochs = tracker.list_epochs(&store).unwrap();
    assert_eq!(epochs.len(), 5);
    assert_eq!(epochs.iter().filter(|e| e.status == EpochStatus::Running).count(), 1);
    assert_eq!(tracker.running_epoch(&store).unwrap(), Some(5));
}

// ===========================================================================
// Training runs
// ===========================================================================

#[tokio::test]
async fn corpus_then_replay_epochs() {
    let root = temp_root("epochs");
    let corpus = corpus(&root);
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let discovery = guard_discovery();

    let report = Trainer::new(&config, &similarity, &discovery)
        .train(&TrainingRequest {
            corpus: corpus.clone(),
            epochs: 3,
            extensions: Vec::new(),
        })
        .await
        .unwrap();

    let sources: Vec<EpochSource> = report.epochs.iter().map(|e| e.source).collect();
    assert_eq!(sources, vec![EpochSource::Corpus, EpochSource::Cache, EpochSource::Cache]);
    assert_eq!(report.epochs[0].files, 2);
    assert_eq!(report.epochs[1].files, 2);
    assert!(!report.capped);
    assert_eq!(report.patterns, 1);
    assert!(report.document.is_some());

    let store = PatternStore::open(&config.paths.store).unwrap();
    let guards = store.get_by_id("guards").unwrap().unwrap();
    assert_eq!(guards.counts.observations, 6);
    assert_eq!(guards.counts.successes, 6);
    let tracker = EpochTracker::new(config.thresholds.max_epochs);
    let epochs = tracker.list_epochs(&store).unwrap();
    assert_eq!(epochs.len(), 3);
    assert!(epochs.iter().all(|e| e.status == EpochStatus::Completed));
    for entry in TrainingCache::all(&store).unwrap() {
        assert_eq!(entry.consumed_epochs.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn training_stops_at_the_epoch_cap() {
    let root = temp_root("cap");
    let corpus = corpus(&root);
    let mut config = Config::with_root(&root);
    config.thresholds.max_epochs = 2;
    let similarity = SimilarityEngine::jaccard_only();
    let discovery = guard_discovery();
    let trainer = Trainer::new(&config, &similarity, &discovery);
    let request = TrainingRequest {
        corpus,
        epochs: 4,
        extensions: vec!["py".into()],
    };

    let report = trainer.train(&request).await.unwrap();
    assert_eq!(report.epochs.len(), 2);
    assert!(report.capped);

    let again = trainer.train(&request).await.unwrap();
    assert!(again.epochs.is_empty());
    assert!(again.capped);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn training_refuses_while_a_cycle_runs() {
    let root = temp_root("busy");
    let corpus = corpus(&root);
    let config = Config::with_root(&root);
    let similarity = SimilarityEngine::jaccard_only();
    let discovery = guard_discovery();
    let _held = CycleLock::try_acquire(&config.paths.lock, Duration::from_secs(600))
        .unwrap()
        .expect("lock free");

    let err = Trainer::new(&config, &similarity, &discovery)
        .train(&TrainingRequest {
            corpus,
            epochs: 1,
            extensions: Vec::new(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PlaybookError::LockHeld));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn stable_pattern_converges_after_enough_epochs() {
    let root = temp_root("converge");
    let corpus = corpus(&root);
    let mut config = Config::with_root(&root);
    config.thresholds.max_epochs = 12;
    let similarity = SimilarityEngine::jaccard_only();
    let discovery = guard_discovery();

    let report = Trainer::new(&config, &similarity, &discovery)
        .train(&TrainingRequest {
            corpus,
            epochs: 12,
            extensions: Vec::new(),
        })
        .await
        .unwrap();

    // 2 files x 12 epochs, every outcome a success.
    let store = PatternStore::open(&config.paths.store).unwrap();
    assert_eq!(store.get_by_id("guards").unwrap().unwrap().counts.observations, 24);
    let check = convergence::check_all(&store, &config.thresholds).unwrap();
    assert_eq!(check.converged.len(), 1);
    assert!((report.convergence_rate - 1.0).abs() < 1e-9);
    let _ = std::fs::remove_dir_all(&root);
}
