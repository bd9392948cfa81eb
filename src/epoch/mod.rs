//! Multi-pass training bookkeeping: epochs, per-pattern evolution records,
//! and the replay cache.
//!
//! Epoch state machine: `None -> Running -> Completed`. At most one epoch is
//! Running; starting a new one force-completes the old one. Epoch numbers are
//! capped at `max_epochs`, and a request past the cap returns the last valid
//! number without creating a row.

pub mod cache;
pub mod convergence;

use duckdb::params;
use serde::Serialize;

use crate::error::Result;
use crate::store::PatternStore;
use crate::time::now_ms;

pub use cache::{TrainingCache, TrainingCacheEntry};
pub use convergence::{ConvergenceReport, ConvergenceStatus, PatternConvergence};

/// Confidence change above which a touch counts as a refinement.
pub const REFINEMENT_DELTA: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochStatus {
    Running,
    Completed,
}

impl EpochStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "running" {
            Self::Running
        } else {
            Self::Completed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Epoch {
    pub number: u32,
    pub status: EpochStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub patterns_processed: u64,
    pub patterns_refined: u64,
    pub avg_confidence_before: Option<f64>,
    pub avg_confidence_after: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpochStats {
    pub processed: u64,
    pub refined: u64,
    pub avg_confidence_before: f64,
    pub avg_confidence_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvolutionRecord {
    pub pattern_id: String,
    pub epoch_number: u32,
    pub confidence_before: f64,
    pub confidence_after: f64,
    pub observations_added: u64,
    pub refinement_applied: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct EpochTracker {
    max_epochs: u32,
}

impl EpochTracker {
    pub fn new(max_epochs: u32) -> Self {
        Self {
            max_epochs: max_epochs.max(1),
        }
    }

    pub fn max_epochs(&self) -> u32 {
        self.max_epochs
    }

    /// Complete any running epoch and open the next one.
    ///
    /// Past the cap this logs a warning and returns the highest existing
    /// epoch number instead of creating a row.
    pub fn start_epoch(&self, store: &mut PatternStore) -> Result<u32> {
        let avg_before = average_confidence(store)?;
        let tx = store.conn_mut().transaction()?;
        let now = now_ms();
        let stale = tx.execute(
            "UPDATE epochs SET status = 'completed', completed_at = ? WHERE status = 'running'",
            [now],
        )?;
        if stale > 0 {
            tracing::warn!(stale, "epoch: force-completed a running epoch");
        }

        let last: u32 = tx.query_row(
            "SELECT COALESCE(MAX(epoch_number), 0) FROM epochs",
            [],
            |row| row.get::<_, i64>(0),
        )? as u32;
        let next = last + 1;
        if next > self.max_epochs {
            tx.commit()?;
            tracing::warn!(
                max_epochs = self.max_epochs,
                "epoch: cap reached, staying at epoch {last}"
            );
            return Ok(last);
        }

        tx.execute(
            "INSERT INTO epochs (epoch_number, started_at, avg_confidence_before, status) \
             VALUES (?, ?, ?, 'running')",
            params![next as i64, now, avg_before],
        )?;
        tx.commit()?;
        tracing::info!(epoch = next, "epoch: started");
        Ok(next)
    }

    pub fn running_epoch(&self, store: &PatternStore) -> Result<Option<u32>> {
        let mut stmt = store
            .conn()
            .prepare("SELECT epoch_number FROM epochs WHERE status = 'running' ORDER BY epoch_number DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get::<_, i64>(0)? as u32)),
            None => Ok(None),
        }
    }

    /// Append an evolution record. Returns whether it counts as a refinement.
    pub fn record_evolution(
        &self,
        store: &mut PatternStore,
        epoch: u32,
        pattern_id: &str,
        confidence_before: f64,
        confidence_after: f64,
        observations_added: u64,
    ) -> Result<bool> {
        let refined = (confidence_after - confidence_before).abs() > REFINEMENT_DELTA;
        store.conn().execute(
            "INSERT INTO pattern_evolution (pattern_id, epoch_number, confidence_before, \
             confidence_after, observations_added, refinement_applied, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                pattern_id,
                epoch as i64,
                confidence_before,
                confidence_after,
                observations_added as i64,
                refined,
                now_ms()
            ],
        )?;
        Ok(refined)
    }

    /// Counts come from the epoch's evolution records; the confidence
    /// averages are store-wide, recorded at start and measured now.
    pub fn tally(&self, store: &PatternStore, epoch: u32) -> Result<EpochStats> {
        let (processed, refined) = store.conn().query_row(
            "SELECT COUNT(*), \
             COALESCE(CAST(SUM(CASE WHEN refinement_applied THEN 1 ELSE 0 END) AS BIGINT), 0) \
             FROM pattern_evolution WHERE epoch_number = ?",
            [epoch as i64],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        let avg_after = average_confidence(store)?;
        let mut stmt = store
            .conn()
            .prepare("SELECT avg_confidence_before FROM epochs WHERE epoch_number = ?")?;
        let mut rows = stmt.query([epoch as i64])?;
        let avg_before = match rows.next()? {
            Some(row) => row.get::<_, Option<f64>>(0)?.unwrap_or(avg_after),
            None => avg_after,
        };
        Ok(EpochStats {
            processed: processed.max(0) as u64,
            refined: refined.max(0) as u64,
            avg_confidence_before: avg_before,
            avg_confidence_after: avg_after,
        })
    }

    /// Mark `epoch` completed. The start-time average stays as recorded;
    /// the closing average is taken over the whole store. A completed
    /// epoch is left untouched.
    pub fn complete_epoch(&self, store: &mut PatternStore, epoch: u32, stats: &EpochStats) -> Result<bool> {
        let avg_after = average_confidence(store)?;
        let updated = store.conn().execute(
            "UPDATE epochs SET status = 'completed', completed_at = ?, patterns_processed = ?, \
             patterns_refined = ?, avg_confidence_after = ? \
             WHERE epoch_number = ? AND status = 'running'",
            params![
                now_ms(),
                stats.processed as i64,
                stats.refined as i64,
                avg_after,
                epoch as i64
            ],
        )?;
        if updated > 0 {
            tracing::info!(
                epoch,
                processed = stats.processed,
                refined = stats.refined,
                avg_after,
                "epoch: completed"
            );
        }
        Ok(updated > 0)
    }

    pub fn list_epochs(&self, store: &PatternStore) -> Result<Vec<Epoch>> {
        let mut stmt = store.conn().prepare(
            "SELECT epoch_number, status, started_at, completed_at, patterns_processed, \
             patterns_refined, avg_confidence_before, avg_confidence_after \
             FROM epochs ORDER BY epoch_number",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(1)?;
            Ok(Epoch {
                number: row.get::<_, i64>(0)? as u32,
                status: EpochStatus::parse(&status),
                started_at: row.get(2)?,
                completed_at: row.get(3)?,
                patterns_processed: row.get::<_, i64>(4)?.max(0) as u64,
                patterns_refined: row.get::<_, i64>(5)?.max(0) as u64,
                avg_confidence_before: row.get(6)?,
                avg_confidence_after: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    pub fn evolution_for(&self, store: &PatternStore, pattern_id: &str) -> Result<Vec<EvolutionRecord>> {
        let mut stmt = store.conn().prepare(
            "SELECT pattern_id, epoch_number, confidence_before, confidence_after, \
             observations_added, refinement_applied, timestamp \
             FROM pattern_evolution WHERE pattern_id = ? ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map([pattern_id], |row| {
            Ok(EvolutionRecord {
                pattern_id: row.get(0)?,
                epoch_number: row.get::<_, i64>(1)? as u32,
                confidence_before: row.get(2)?,
                confidence_after: row.get(3)?,
                observations_added: row.get::<_, i64>(4)?.max(0) as u64,
                refinement_applied: row.get(5)?,
                timestamp: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }
}

/// Mean confidence over all patterns, 0 for an empty store.
pub fn average_confidence(store: &PatternStore) -> Result<f64> {
    Ok(store.conn().query_row(
        "SELECT COALESCE(AVG(confidence), 0) FROM patterns",
        [],
        |row| row.get::<_, f64>(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_are_sequential_and_capped() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let tracker = EpochTracker::new(5);
        for expected in 1..=5 {
            assert_eq!(tracker.start_epoch(&mut store).unwrap(), expected);
        }
        assert_eq!(tracker.start_epoch(&mut store).unwrap(), 5);

        let epochs = tracker.list_epochs(&store).unwrap();
        assert_eq!(epochs.len(), 5);
        assert!(epochs.iter().all(|e| e.status == EpochStatus::Completed));
        assert_eq!(tracker.running_epoch(&store).unwrap(), None);
    }

    #[test]
    fn starting_completes_the_running_epoch() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let tracker = EpochTracker::new(5);
        tracker.start_epoch(&mut store).unwrap();
        assert_eq!(tracker.running_epoch(&store).unwrap(), Some(1));
        tracker.start_epoch(&mut store).unwrap();
        let epochs = tracker.list_epochs(&store).unwrap();
        assert_eq!(epochs[0].status, EpochStatus::Completed);
        assert_eq!(epochs[1].status, EpochStatus::Running);
    }

    #[test]
    fn evolution_flags_refinements_and_tallies() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let tracker = EpochTracker::new(5);
        let epoch = tracker.start_epoch(&mut store).unwrap();

        assert!(!tracker.record_evolution(&mut store, epoch, "p", 0.5, 0.505, 1).unwrap());
        assert!(tracker.record_evolution(&mut store, epoch, "p", 0.5, 0.6, 1).unwrap());

        let stats = tracker.tally(&store, epoch).unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.refined, 1);
        // No patterns stored, so both store-wide averages are zero.
        assert_eq!(stats.avg_confidence_before, 0.0);
        assert_eq!(stats.avg_confidence_after, 0.0);

        assert!(tracker.complete_epoch(&mut store, epoch, &stats).unwrap());
        assert!(!tracker.complete_epoch(&mut store, epoch, &stats).unwrap());
        let epochs = tracker.list_epochs(&store).unwrap();
        assert_eq!(epochs[0].patterns_refined, 1);
        assert_eq!(tracker.evolution_for(&store, "p").unwrap().len(), 2);
    }

    fn scored(id: &str, successes: u64, observations: u64) -> crate::store::Pattern {
        use crate::store::{Counts, Pattern, PatternType};
        let counts = Counts {
            observations,
            successes,
            failures: observations - successes,
            ..Counts::default()
        };
        Pattern {
            id: id.into(),
            bullet_id: String::new(),
            name: format!("pattern {id}"),
            domain: "python".into(),
            pattern_type: PatternType::Helpful,
            description: String::new(),
            language: "python".into(),
            confidence: counts.confidence(),
            counts,
            last_seen: 0,
            created_at: 0,
        }
    }

    #[test]
    fn epoch_averages_cover_the_whole_store() {
        let mut store = PatternStore::open_in_memory().unwrap();
        store.insert_pattern(&scored("a", 2, 2)).unwrap();
        store.insert_pattern(&scored("b", 0, 2)).unwrap();
        let tracker = EpochTracker::new(5);
        let epoch = tracker.start_epoch(&mut store).unwrap();

        // Only `a` moves this epoch; `b` stays at zero.
        let mut a = scored("a", 2, 4);
        store.replace_pattern(&a).unwrap();
        a.confidence = a.counts.confidence();
        tracker.record_evolution(&mut store, epoch, "a", 1.0, a.confidence, 2).unwrap();

        let stats = tracker.tally(&store, epoch).unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.refined, 1);
        assert!((stats.avg_confidence_before - 0.5).abs() < 1e-9);
        assert!((stats.avg_confidence_after - 0.25).abs() < 1e-9);
        assert!(tracker.complete_epoch(&mut store, epoch, &stats).unwrap());

        let row = &tracker.list_epochs(&store).unwrap()[0];
        assert!((row.avg_confidence_before.unwrap() - 0.5).abs() < 1e-9);
        assert!((row.avg_confidence_after.unwrap() - average_confidence(&store).unwrap()).abs() < 1e-9);
        assert!((row.avg_confidence_after.unwrap() - 0.25).abs() < 1e-9);
    }
}
