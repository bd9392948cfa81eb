//! Persistent pattern store backed by an embedded DuckDB file.
//!
//! Every mutating operation runs in a single transaction and recomputes the
//! affected pattern's confidence from its counts before committing, so a
//! stored confidence is never stale.

pub mod bullet;
pub mod schema;
pub mod types;

use std::path::{Path, PathBuf};

use duckdb::{Connection, Row, params};

use crate::error::{PlaybookError, Result};
use crate::time::now_ms;

pub use bullet::{extract_bullet_ids, generate_bullet_id, normalize_bullet_id};
pub use types::{Counts, Feedback, Insight, Observation, Outcome, Pattern, PatternDelta, PatternType};

const PATTERN_COLUMNS: &str = "id, bullet_id, name, domain, type, description, language, \
     observations, successes, failures, neutrals, helpful_count, harmful_count, \
     confidence, last_seen, created_at";

/// Whether an upsert inserted a new row or folded into an existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub pattern: Pattern,
    pub created: bool,
}

/// Insight fields supplied by the caller; id and timestamp are assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewInsight {
    pub insight: String,
    pub recommendation: String,
    pub confidence: f64,
    pub applied_correctly: bool,
}

#[derive(Debug, Clone)]
pub struct NewObservation {
    pub outcome: Outcome,
    pub test_status: Option<String>,
    pub error_logs: Option<String>,
    pub file_path: Option<String>,
}

pub struct PatternStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl PatternStore {
    /// Open (or create) the store at `path`.
    ///
    /// A file that cannot be opened or migrated is moved aside to
    /// `<name>.corrupt-<ms>` and a fresh store is initialised in its place.
    /// A file locked by another process is reported as an error untouched.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match Self::try_open(path) {
            Ok(store) => Ok(store),
            Err(first) if path.exists() && !is_lock_conflict(&first) => {
                let aside = quarantine_path(path);
                tracing::warn!(
                    "store: {} unusable ({first}), moving aside to {} and re-initialising",
                    path.display(),
                    aside.display()
                );
                std::fs::rename(path, &aside)?;
                let wal = wal_path(path);
                if wal.exists() {
                    let _ = std::fs::remove_file(&wal);
                }
                Self::try_open(path)
            }
            Err(e) => Err(e),
        }
    }

    fn try_open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::apply_migrations(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::apply_migrations(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_by_id(&self, id: &str) -> Result<Option<Pattern>> {
        fetch_pattern(&self.conn, "id", id)
    }

    pub fn get_by_bullet(&self, bullet_id: &str) -> Result<Option<Pattern>> {
        let bare = bullet_id.trim().trim_start_matches('[').trim_end_matches(']');
        fetch_pattern(&self.conn, "bullet_id", bare)
    }

    /// All patterns, highest confidence first.
    pub fn list_all(&self) -> Result<Vec<Pattern>> {
        let sql = format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns \
             ORDER BY confidence DESC, observations DESC, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], pattern_from_row)?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM patterns", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub fn insights_for(&self, pattern_id: &str) -> Result<Vec<Insight>> {
        self.query_insights("WHERE pattern_id = ? ORDER BY timestamp, id", &[&pattern_id])
    }

    pub fn all_insights(&self) -> Result<Vec<Insight>> {
        self.query_insights("ORDER BY pattern_id, timestamp, id", &[])
    }

    fn query_insights(&self, tail: &str, args: &[&dyn duckdb::ToSql]) -> Result<Vec<Insight>> {
        let sql = format!(
            "SELECT id, pattern_id, timestamp, insight, recommendation, confidence, \
             applied_correctly FROM insights {tail}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok(Insight {
                id: row.get(0)?,
                pattern_id: row.get(1)?,
                timestamp: row.get(2)?,
                insight: row.get(3)?,
                recommendation: row.get(4)?,
                confidence: row.get(5)?,
                applied_correctly: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    pub fn observations_for(&self, pattern_id: &str) -> Result<Vec<Observation>> {
        self.query_observations("WHERE pattern_id = ? ORDER BY timestamp, id", &[&pattern_id])
    }

    pub fn all_observations(&self) -> Result<Vec<Observation>> {
        self.query_observations("ORDER BY pattern_id, timestamp, id", &[])
    }

    fn query_observations(
        &self,
        tail: &str,
        args: &[&dyn duckdb::ToSql],
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT id, pattern_id, timestamp, outcome, test_status, error_logs, file_path \
             FROM observations {tail}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            let outcome: String = row.get(3)?;
            Ok(Observation {
                id: row.get(0)?,
                pattern_id: row.get(1)?,
                timestamp: row.get(2)?,
                outcome: Outcome::parse(&outcome).unwrap_or(Outcome::Neutral),
                test_status: row.get(4)?,
                error_logs: row.get(5)?,
                file_path: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    /// Confidence snapshots from the pattern's insights, most recent first.
    pub fn recent_confidences(&self, pattern_id: &str, limit: usize) -> Result<Vec<f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT confidence FROM insights WHERE pattern_id = ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![pattern_id, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<duckdb::Result<Vec<f64>>>()?)
    }

    /// Number of insight snapshots recorded for a pattern.
    pub fn snapshot_count(&self, pattern_id: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM insights WHERE pattern_id = ?",
            [pattern_id],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Fold `delta` into the pattern with the same id, or insert it with a new bullet id.
    pub fn upsert(&mut self, delta: &PatternDelta) -> Result<Upserted> {
        let tx = self.conn.transaction()?;
        let upserted = match fetch_pattern(&tx, "id", &delta.id)? {
            Some(mut existing) => {
                existing.counts.absorb(&delta.counts);
                existing.last_seen = existing.last_seen.max(delta.seen_at);
                fill_if_empty(&mut existing.name, &delta.name);
                fill_if_empty(&mut existing.description, &delta.description);
                fill_if_empty(&mut existing.language, &delta.language);
                existing.confidence = existing.counts.confidence();
                write_pattern(&tx, &existing)?;
                Upserted {
                    pattern: existing,
                    created: false,
                }
            }
            None => {
                let bullet_id = allocate_bullet_id(&tx, &delta.id, &delta.domain)?;
                let pattern = Pattern {
                    id: delta.id.clone(),
                    bullet_id,
                    name: delta.name.clone(),
                    domain: delta.domain.clone(),
                    pattern_type: delta.pattern_type,
                    description: delta.description.clone(),
                    language: delta.language.clone(),
                    counts: delta.counts,
                    confidence: delta.counts.confidence(),
                    last_seen: delta.seen_at,
                    created_at: delta.seen_at,
                };
                insert_pattern_row(&tx, &pattern)?;
                Upserted {
                    pattern,
                    created: true,
                }
            }
        };
        tx.commit()?;
        Ok(upserted)
    }

    /// Merge `source_id` (if it exists) plus `extra` counts into `target_id`.
    ///
    /// Counts are summed component-wise, `last_seen` keeps the most recent
    /// value, the source's insights and observations move to the target and
    /// the source row is deleted.
    pub fn merge_into(
        &mut self,
        target_id: &str,
        source_id: &str,
        extra: &Counts,
        seen_at: i64,
    ) -> Result<Pattern> {
        let tx = self.conn.transaction()?;
        let mut target = fetch_pattern(&tx, "id", target_id)?
            .ok_or_else(|| PlaybookError::PatternNotFound(target_id.to_string()))?;

        if source_id != target_id
            && let Some(source) = fetch_pattern(&tx, "id", source_id)?
        {
            target.counts.absorb(&source.counts);
            target.last_seen = target.last_seen.max(source.last_seen);
            reparent_rows(&tx, source_id, target_id)?;
            delete_pattern_row(&tx, source_id)?;
        }

        target.counts.absorb(extra);
        target.last_seen = target.last_seen.max(seen_at);
        target.confidence = target.counts.confidence();
        write_pattern(&tx, &target)?;
        tx.commit()?;
        Ok(target)
    }

    /// Rewrite the stored confidence from counts. Returns the new value.
    pub fn recompute_confidence(&mut self, id: &str) -> Result<Option<f64>> {
        let tx = self.conn.transaction()?;
        let Some(mut pattern) = fetch_pattern(&tx, "id", id)? else {
            return Ok(None);
        };
        pattern.confidence = pattern.counts.confidence();
        write_pattern(&tx, &pattern)?;
        tx.commit()?;
        Ok(Some(pattern.confidence))
    }

    /// Recompute every pattern's confidence. Returns how many values changed.
    pub fn recompute_all(&mut self) -> Result<usize> {
        let patterns = self.list_all()?;
        let tx = self.conn.transaction()?;
        let mut changed = 0;
        for mut pattern in patterns {
            let fresh = pattern.counts.confidence();
            if (fresh - pattern.confidence).abs() > f64::EPSILON {
                pattern.confidence = fresh;
                write_pattern(&tx, &pattern)?;
                changed += 1;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Delete a pattern with its insights and observations. Returns false if absent.
    pub fn delete_cascade(&mut self, id: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM insights WHERE pattern_id = ?", [id])?;
        tx.execute("DELETE FROM observations WHERE pattern_id = ?", [id])?;
        let removed = delete_pattern_row(&tx, id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Move insights and observations from one pattern to another. Returns rows moved.
    pub fn reparent_children(&mut self, from_id: &str, to_id: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let moved = reparent_rows(&tx, from_id, to_id)?;
        tx.commit()?;
        Ok(moved)
    }

    pub fn add_insight(&mut self, pattern_id: &str, insight: &NewInsight) -> Result<()> {
        self.conn.execute(
            "INSERT INTO insights (pattern_id, timestamp, insight, recommendation, confidence, applied_correctly) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                pattern_id,
                now_ms(),
                insight.insight,
                insight.recommendation,
                insight.confidence,
                insight.applied_correctly
            ],
        )?;
        Ok(())
    }

    pub fn add_observation(&mut self, pattern_id: &str, observation: &NewObservation) -> Result<()> {
        self.conn.execute(
            "INSERT INTO observations (pattern_id, timestamp, outcome, test_status, error_logs, file_path) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                pattern_id,
                now_ms(),
                observation.outcome.as_str(),
                observation.test_status,
                observation.error_logs,
                observation.file_path
            ],
        )?;
        Ok(())
    }

    /// Apply one piece of feedback to the pattern behind `bullet_id`.
    pub fn record_feedback(&mut self, bullet_id: &str, feedback: Feedback) -> Result<Option<Pattern>> {
        let bare = bullet_id.trim().trim_start_matches('[').trim_end_matches(']');
        let tx = self.conn.transaction()?;
        let Some(mut pattern) = fetch_pattern(&tx, "bullet_id", bare)? else {
            return Ok(None);
        };
        match feedback {
            Feedback::Helpful => pattern.counts.helpful += 1,
            Feedback::Harmful => pattern.counts.harmful += 1,
            Feedback::Neutral => {}
        }
        pattern.last_seen = pattern.last_seen.max(now_ms());
        pattern.confidence = pattern.counts.confidence();
        write_pattern(&tx, &pattern)?;
        tx.commit()?;
        Ok(Some(pattern))
    }

    /// Insert a fully-formed pattern (import path).
    ///
    /// Keeps the given bullet id (brackets stripped) when it is well formed
    /// and free, otherwise allocates a fresh one.
    pub fn insert_pattern(&mut self, pattern: &Pattern) -> Result<Pattern> {
        let tx = self.conn.transaction()?;
        if fetch_pattern(&tx, "id", &pattern.id)?.is_some() {
            return Err(PlaybookError::Other(format!(
                "pattern {} already exists",
                pattern.id
            )));
        }
        let mut row = pattern.clone();
        let reusable = match normalize_bullet_id(&pattern.bullet_id) {
            Some(bullet) => (!bullet_taken(&tx, &bullet)?).then_some(bullet),
            None => None,
        };
        row.bullet_id = match reusable {
            Some(bullet) => bullet,
            None => {
                if !pattern.bullet_id.is_empty() {
                    tracing::debug!(
                        id = %pattern.id,
                        bullet = %pattern.bullet_id,
                        "store: bullet id unusable, allocating a fresh one"
                    );
                }
                allocate_bullet_id(&tx, &row.id, &row.domain)?
            }
        };
        row.confidence = row.counts.confidence();
        insert_pattern_row(&tx, &row)?;
        tx.commit()?;
        Ok(row)
    }

    /// Replace an existing pattern's fields and counts, keeping its bullet id.
    pub fn replace_pattern(&mut self, pattern: &Pattern) -> Result<Pattern> {
        let tx = self.conn.transaction()?;
        let existing = fetch_pattern(&tx, "id", &pattern.id)?
            .ok_or_else(|| PlaybookError::PatternNotFound(pattern.id.clone()))?;
        let mut row = pattern.clone();
        row.bullet_id = existing.bullet_id;
        row.confidence = row.counts.confidence();
        write_pattern(&tx, &row)?;
        tx.commit()?;
        Ok(row)
    }

    /// Append an insight or observation row verbatim (import path).
    pub fn import_children(
        &mut self,
        pattern_id: &str,
        insights: &[Insight],
        observations: &[Observation],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for i in insights {
            tx.execute(
                "INSERT INTO insights (pattern_id, timestamp, insight, recommendation, confidence, applied_correctly) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    pattern_id,
                    i.timestamp,
                    i.insight,
                    i.recommendation,
                    i.confidence,
                    i.applied_correctly
                ],
            )?;
        }
        for o in observations {
            tx.execute(
                "INSERT INTO observations (pattern_id, timestamp, outcome, test_status, error_logs, file_path) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    pattern_id,
                    o.timestamp,
                    o.outcome.as_str(),
                    o.test_status,
                    o.error_logs,
                    o.file_path
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers (usable with a Connection or a Transaction)
// ---------------------------------------------------------------------------

fn pattern_from_row(row: &Row<'_>) -> duckdb::Result<Pattern> {
    let raw_type: String = row.get(4)?;
    let count = |idx: usize| row.get::<_, i64>(idx).map(|v| v.max(0) as u64);
    Ok(Pattern {
        id: row.get(0)?,
        bullet_id: row.get(1)?,
        name: row.get(2)?,
        domain: row.get(3)?,
        pattern_type: PatternType::parse(&raw_type).unwrap_or(PatternType::Neutral),
        description: row.get(5)?,
        language: row.get(6)?,
        counts: Counts {
            observations: count(7)?,
            successes: count(8)?,
            failures: count(9)?,
            neutrals: count(10)?,
            helpful: count(11)?,
            harmful: count(12)?,
        },
        confidence: row.get(13)?,
        last_seen: row.get(14)?,
        created_at: row.get(15)?,
    })
}

fn fetch_pattern(conn: &Connection, column: &str, value: &str) -> Result<Option<Pattern>> {
    let sql = format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE {column} = ?");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([value])?;
    match rows.next()? {
        Some(row) => Ok(Some(pattern_from_row(row)?)),
        None => Ok(None),
    }
}

fn insert_pattern_row(conn: &Connection, p: &Pattern) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO patterns ({PATTERN_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        params![
            p.id,
            p.bullet_id,
            p.name,
            p.domain,
            p.pattern_type.as_str(),
            p.description,
            p.language,
            p.counts.observations as i64,
            p.counts.successes as i64,
            p.counts.failures as i64,
            p.counts.neutrals as i64,
            p.counts.helpful as i64,
            p.counts.harmful as i64,
            p.confidence,
            p.last_seen,
            p.created_at
        ],
    )?;
    Ok(())
}

/// Update every non-key column of an existing row.
fn write_pattern(conn: &Connection, p: &Pattern) -> Result<()> {
    conn.execute(
        "UPDATE patterns SET name = ?, domain = ?, type = ?, description = ?, language = ?, \
         observations = ?, successes = ?, failures = ?, neutrals = ?, helpful_count = ?, \
         harmful_count = ?, confidence = ?, last_seen = ?, created_at = ? WHERE id = ?",
        params![
            p.name,
            p.domain,
            p.pattern_type.as_str(),
            p.description,
            p.language,
            p.counts.observations as i64,
            p.counts.successes as i64,
            p.counts.failures as i64,
            p.counts.neutrals as i64,
            p.counts.helpful as i64,
            p.counts.harmful as i64,
            p.confidence,
            p.last_seen,
            p.created_at,
            p.id
        ],
    )?;
    Ok(())
}

fn delete_pattern_row(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM patterns WHERE id = ?", [id])? > 0)
}

fn reparent_rows(conn: &Connection, from_id: &str, to_id: &str) -> Result<usize> {
    let insights = conn.execute(
        "UPDATE insights SET pattern_id = ? WHERE pattern_id = ?",
        [to_id, from_id],
    )?;
    let observations = conn.execute(
        "UPDATE observations SET pattern_id = ? WHERE pattern_id = ?",
        [to_id, from_id],
    )?;
    Ok(insights + observations)
}

fn bullet_taken(conn: &Connection, bullet_id: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM patterns WHERE bullet_id = ?",
        [bullet_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

fn allocate_bullet_id(conn: &Connection, pattern_id: &str, domain: &str) -> Result<String> {
    let mut failure = None;
    let allocated = generate_bullet_id(pattern_id, domain, |candidate| {
        match bullet_taken(conn, candidate) {
            Ok(taken) => taken,
            Err(e) => {
                failure.get_or_insert(e);
                false
            }
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    allocated.ok_or_else(|| PlaybookError::Other(format!("no free bullet id for {pattern_id}")))
}

fn fill_if_empty(field: &mut String, value: &str) {
    if field.trim().is_empty() && !value.trim().is_empty() {
        *field = value.to_string();
    }
}

/// Another process holding the DuckDB file lock is contention, not corruption.
fn is_lock_conflict(err: &PlaybookError) -> bool {
    matches!(err, PlaybookError::Store(e) if e.to_string().contains("lock"))
}

fn quarantine_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    path.with_file_name(format!("{name}.corrupt-{}", now_ms()))
}

fn wal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".wal");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(id: &str, outcome: Outcome) -> PatternDelta {
        PatternDelta {
            id: id.to_string(),
            name: format!("{id} name"),
            domain: "python".to_string(),
            pattern_type: PatternType::Helpful,
            description: format!("{id} description"),
            language: "python".to_string(),
            counts: Counts::single(outcome),
            seen_at: now_ms(),
        }
    }

    fn assert_confidence_invariant(store: &PatternStore) {
        for p in store.list_all().unwrap() {
            assert!(
                (p.confidence - p.counts.confidence()).abs() < 1e-12,
                "{} has stale confidence",
                p.id
            );
        }
    }

    #[test]
    fn upsert_creates_then_accumulates() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let first = store.upsert(&delta("py-typed", Outcome::Success)).unwrap();
        assert!(first.created);
        assert_eq!(first.pattern.confidence, 1.0);
        assert!(first.pattern.bullet_id.starts_with("py-"));

        let second = store.upsert(&delta("py-typed", Outcome::Failure)).unwrap();
        assert!(!second.created);
        assert_eq!(second.pattern.counts.observations, 2);
        assert_eq!(second.pattern.confidence, 0.5);
        assert_eq!(second.pattern.bullet_id, first.pattern.bullet_id);
        assert_confidence_invariant(&store);
    }

    #[test]
    fn bullet_ids_stay_unique() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..25 {
            let p = store
                .upsert(&delta(&format!("py-p{i}"), Outcome::Success))
                .unwrap()
                .pattern;
            assert!(seen.insert(p.bullet_id));
        }
    }

    #[test]
    fn merge_sums_counts_and_reparents() {
        let mut store = PatternStore::open_in_memory().unwrap();
        store.upsert(&delta("py-a", Outcome::Success)).unwrap();
        store.upsert(&delta("py-b", Outcome::Failure)).unwrap();
        store
            .add_insight(
                "py-b",
                &NewInsight {
                    insight: "b insight".into(),
                    confidence: 0.0,
                    applied_correctly: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let merged = store
            .merge_into("py-a", "py-b", &Counts::single(Outcome::Success), now_ms())
            .unwrap();
        assert_eq!(merged.counts.observations, 3);
        assert_eq!(merged.counts.successes, 2);
        assert_eq!(merged.counts.failures, 1);
        assert!(store.get_by_id("py-b").unwrap().is_none());
        assert_eq!(store.insights_for("py-a").unwrap().len(), 1);
        assert_confidence_invariant(&store);
    }

    #[test]
    fn merge_into_missing_target_fails() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let err = store
            .merge_into("nope", "also-nope", &Counts::default(), 0)
            .unwrap_err();
        assert!(matches!(err, PlaybookError::PatternNotFound(_)));
    }

    #[test]
    fn delete_cascade_removes_children() {
        let mut store = PatternStore::open_in_memory().unwrap();
        store.upsert(&delta("py-a", Outcome::Failure)).unwrap();
        store
            .add_observation(
                "py-a",
                &NewObservation {
                    outcome: Outcome::Failure,
                    test_status: Some("failed".into()),
                    error_logs: None,
                    file_path: Some("a.py".into()),
                },
            )
            .unwrap();
        assert!(store.delete_cascade("py-a").unwrap());
        assert!(store.get_by_id("py-a").unwrap().is_none());
        assert!(store.all_observations().unwrap().is_empty());
        assert!(!store.delete_cascade("py-a").unwrap());
    }

    #[test]
    fn feedback_recomputes_confidence() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let p = store.upsert(&delta("py-a", Outcome::Failure)).unwrap().pattern;
        let bullet = format!("[{}]", p.bullet_id);
        let after = store
            .record_feedback(&bullet, Feedback::Helpful)
            .unwrap()
            .unwrap();
        assert_eq!(after.counts.helpful, 1);
        assert_eq!(after.confidence, 0.5);
        assert!(store.record_feedback("[zz-00001]", Feedback::Helpful).unwrap().is_none());
        assert_confidence_invariant(&store);
    }

    #[test]
    fn list_all_orders_by_confidence() {
        let mut store = PatternStore::open_in_memory().unwrap();
        store.upsert(&delta("py-low", Outcome::Failure)).unwrap();
        store.upsert(&delta("py-high", Outcome::Success)).unwrap();
        let ids: Vec<_> = store.list_all().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["py-high", "py-low"]);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn recent_confidences_newest_first() {
        let mut store = PatternStore::open_in_memory().unwrap();
        store.upsert(&delta("py-a", Outcome::Success)).unwrap();
        for c in [0.1, 0.2, 0.3] {
            store
                .add_insight(
                    "py-a",
                    &NewInsight {
                        insight: "x".into(),
                        confidence: c,
                        applied_correctly: true,
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let recent = store.recent_confidences("py-a", 2).unwrap();
        assert_eq!(recent, vec![0.3, 0.2]);
        assert_eq!(store.snapshot_count("py-a").unwrap(), 3);
    }
}
