//! Replay cache for multi-epoch training.
//!
//! Every analyzed file is cached once per `(file_path, content_hash)`. Later
//! epochs replay entries instead of re-running discovery, and each entry is
//! consumed at most once per epoch.

use std::collections::BTreeSet;

use duckdb::params;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::store::PatternStore;
use crate::time::now_ms;

/// Entries replayed per epoch at most.
pub const REPLAY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingCacheEntry {
    pub id: i64,
    pub file_path: String,
    pub content_hash: String,
    pub code: String,
    pub detected_patterns: Vec<String>,
    pub test_status: String,
    pub cached_at: i64,
    pub consumed_epochs: BTreeSet<u32>,
}

pub struct TrainingCache;

impl TrainingCache {
    pub fn content_hash(code: &str) -> String {
        hex::encode(Sha256::digest(code.as_bytes()))
    }

    /// Cache an analyzed file. Returns the existing entry id when the same
    /// content was already cached for this path.
    pub fn add(
        store: &mut PatternStore,
        file_path: &str,
        code: &str,
        detected_patterns: &[String],
        test_status: &str,
    ) -> Result<i64> {
        let hash = Self::content_hash(code);
        {
            let mut stmt = store
                .conn()
                .prepare("SELECT id FROM training_cache WHERE file_path = ? AND content_hash = ?")?;
            let mut rows = stmt.query(params![file_path, hash])?;
            if let Some(row) = rows.next()? {
                return Ok(row.get(0)?);
            }
        }
        let detected = serde_json::to_string(detected_patterns)?;
        let id = store.conn().query_row(
            "INSERT INTO training_cache (file_path, content_hash, code_content, detected_patterns, \
             test_status, cached_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
            params![file_path, hash, code, detected, test_status, now_ms()],
            |row| row.get::<_, i64>(0),
        )?;
        tracing::debug!(id, file = file_path, "training cache: entry added");
        Ok(id)
    }

    pub fn all(store: &PatternStore) -> Result<Vec<TrainingCacheEntry>> {
        let mut stmt = store.conn().prepare(
            "SELECT id, file_path, content_hash, code_content, detected_patterns, test_status, \
             cached_at, consumed_epochs FROM training_cache ORDER BY cached_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, file_path, content_hash, code, detected, test_status, cached_at, consumed) = row?;
            entries.push(TrainingCacheEntry {
                id,
                file_path,
                content_hash,
                code,
                detected_patterns: serde_json::from_str(&detected).unwrap_or_default(),
                test_status,
                cached_at,
                consumed_epochs: serde_json::from_str(&consumed).unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    /// Oldest entries not yet consumed by `epoch`, up to [`REPLAY_LIMIT`].
    pub fn eligible_for(store: &PatternStore, epoch: u32) -> Result<Vec<TrainingCacheEntry>> {
        Ok(Self::all(store)?
            .into_iter()
            .filter(|e| !e.consumed_epochs.contains(&epoch))
            .take(REPLAY_LIMIT)
            .collect())
    }

    pub fn mark_consumed(store: &mut PatternStore, id: i64, epoch: u32) -> Result<bool> {
        let current: Option<String> = {
            let mut stmt = store
                .conn()
                .prepare("SELECT consumed_epochs FROM training_cache WHERE id = ?")?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let Some(current) = current else {
            return Ok(false);
        };
        let mut consumed: BTreeSet<u32> = serde_json::from_str(&current).unwrap_or_default();
        if !consumed.insert(epoch) {
            return Ok(false);
        }
        store.conn().execute(
            "UPDATE training_cache SET consumed_epochs = ? WHERE id = ?",
            params![serde_json::to_string(&consumed)?, id],
        )?;
        Ok(true)
    }

    pub fn len(store: &PatternStore) -> Result<u64> {
        Ok(store
            .conn()
            .query_row("SELECT COUNT(*) FROM training_cache", [], |row| row.get::<_, i64>(0))?
            .max(0) as u64)
    }
}
