//! DuckDB schema definitions and migration support for the pattern store.

use std::fmt;

// ---------------------------------------------------------------------------
// DDL constants
// ---------------------------------------------------------------------------

pub const DDL_SCHEMA_VERSION: &str = "\
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at BIGINT NOT NULL
);";

pub const DDL_PATTERNS: &str = "\
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    bullet_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    domain TEXT NOT NULL,
    type TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    language TEXT NOT NULL DEFAULT '',
    observations BIGINT NOT NULL DEFAULT 0,
    successes BIGINT NOT NULL DEFAULT 0,
    failures BIGINT NOT NULL DEFAULT 0,
    neutrals BIGINT NOT NULL DEFAULT 0,
    helpful_count BIGINT NOT NULL DEFAULT 0,
    harmful_count BIGINT NOT NULL DEFAULT 0,
    confidence DOUBLE NOT NULL DEFAULT 0,
    last_seen BIGINT NOT NULL,
    created_at BIGINT NOT NULL
);";

// Child tables have no FOREIGN KEY; cascade and reparent happen in store
// transactions.
pub const DDL_SEQ_INSIGHTS: &str = "CREATE SEQUENCE IF NOT EXISTS seq_insights START 1;";

pub const DDL_INSIGHTS: &str = "\
CREATE TABLE IF NOT EXISTS insights (
    id BIGINT PRIMARY KEY DEFAULT nextval('seq_insights'),
    pattern_id TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    insight TEXT NOT NULL,
    recommendation TEXT NOT NULL DEFAULT '',
    confidence DOUBLE NOT NULL,
    applied_correctly BOOLEAN NOT NULL DEFAULT TRUE
);";

pub const DDL_SEQ_OBSERVATIONS: &str =
    "CREATE SEQUENCE IF NOT EXISTS seq_observations START 1;";

pub const DDL_OBSERVATIONS: &str = "\
CREATE TABLE IF NOT EXISTS observations (
    id BIGINT PRIMARY KEY DEFAULT nextval('seq_observations'),
    pattern_id TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    outcome TEXT NOT NULL,
    test_status TEXT,
    error_logs TEXT,
    file_path TEXT
);";

pub const DDL_EPOCHS: &str = "\
CREATE TABLE IF NOT EXISTS epochs (
    epoch_number INTEGER PRIMARY KEY,
    started_at BIGINT NOT NULL,
    completed_at BIGINT,
    patterns_processed BIGINT NOT NULL DEFAULT 0,
    patterns_refined BIGINT NOT NULL DEFAULT 0,
    avg_confidence_before DOUBLE,
    avg_confidence_after DOUBLE,
    status TEXT NOT NULL
);";

pub const DDL_SEQ_EVOLUTION: &str = "CREATE SEQUENCE IF NOT EXISTS seq_evolution START 1;";

pub const DDL_PATTERN_EVOLUTION: &str = "\
CREATE TABLE IF NOT EXISTS pattern_evolution (
    id BIGINT PRIMARY KEY DEFAULT nextval('seq_evolution'),
    pattern_id TEXT NOT NULL,
    epoch_number INTEGER NOT NULL,
    confidence_before DOUBLE NOT NULL,
    confidence_after DOUBLE NOT NULL,
    observations_added BIGINT NOT NULL,
    refinement_applied BOOLEAN NOT NULL,
    timestamp BIGINT NOT NULL
);";

pub const DDL_SEQ_TRAINING: &str = "CREATE SEQUENCE IF NOT EXISTS seq_training START 1;";

pub const DDL_TRAINING_CACHE: &str = "\
CREATE TABLE IF NOT EXISTS training_cache (
    id BIGINT PRIMARY KEY DEFAULT nextval('seq_training'),
    file_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    code_content TEXT NOT NULL,
    detected_patterns TEXT NOT NULL DEFAULT '[]',
    test_status TEXT NOT NULL,
    cached_at BIGINT NOT NULL,
    consumed_epochs TEXT NOT NULL DEFAULT '[]'
);";

/// All DDL statements for schema version 1, in order.
pub const SCHEMA_V1: &[&str] = &[
    DDL_SCHEMA_VERSION,
    DDL_PATTERNS,
    DDL_SEQ_INSIGHTS,
    DDL_INSIGHTS,
    DDL_SEQ_OBSERVATIONS,
    DDL_OBSERVATIONS,
    DDL_EPOCHS,
    DDL_SEQ_EVOLUTION,
    DDL_PATTERN_EVOLUTION,
    DDL_SEQ_TRAINING,
    DDL_TRAINING_CACHE,
];

/// Tables that must exist for the store to be usable.
pub const REQUIRED_TABLES: &[&str] = &[
    "patterns",
    "insights",
    "observations",
    "epochs",
    "pattern_evolution",
    "training_cache",
];

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Migration support
// ---------------------------------------------------------------------------

/// Apply schema migrations up to `CURRENT_VERSION`.
///
/// Uses `schema_version` table for idempotent version tracking.
/// Returns the version that was applied (or the already-current version).
pub fn apply_migrations(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(DDL_SCHEMA_VERSION)
        .map_err(MigrationError::Duckdb)?;

    let current = get_current_version(conn)?;

    if current > CURRENT_VERSION {
        return Err(MigrationError::NewerSchema(current));
    }

    if current < 1 {
        for ddl in SCHEMA_V1 {
            conn.execute_batch(ddl).map_err(MigrationError::Duckdb)?;
        }
        record_version(conn, 1)?;
    }

    verify_tables(conn)?;
    Ok(CURRENT_VERSION)
}

fn get_current_version(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .map_err(MigrationError::Duckdb)?;
    let version: i32 = stmt
        .query_row([], |row| row.get(0))
        .map_err(MigrationError::Duckdb)?;
    Ok(version)
}

fn record_version(conn: &duckdb::Connection, version: i32) -> Result<(), MigrationError> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        duckdb::params![version, crate::time::now_ms()],
    )
    .map_err(MigrationError::Duckdb)?;
    Ok(())
}

/// A version row without its tables means someone dropped them by hand.
fn verify_tables(conn: &duckdb::Connection) -> Result<(), MigrationError> {
    let mut stmt = conn
        .prepare("SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?")
        .map_err(MigrationError::Duckdb)?;
    for table in REQUIRED_TABLES {
        let count: i64 = stmt
            .query_row([*table], |row| row.get(0))
            .map_err(MigrationError::Duckdb)?;
        if count == 0 {
            return Err(MigrationError::MissingTable(*table));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MigrationError {
    Duckdb(duckdb::Error),
    NewerSchema(i32),
    MissingTable(&'static str),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Duckdb(e) => write!(f, "DuckDB migration error: {e}"),
            MigrationError::NewerSchema(v) => {
                write!(f, "store schema v{v} is newer than supported v{CURRENT_VERSION}")
            }
            MigrationError::MissingTable(t) => write!(f, "table {t} is missing"),
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<MigrationError> for crate::error::PlaybookError {
    fn from(e: MigrationError) -> Self {
        crate::error::PlaybookError::Migration(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_create_all_tables() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        assert_eq!(apply_migrations(&conn).unwrap(), CURRENT_VERSION);

        for table in REQUIRED_TABLES {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn child_ids_come_from_sequences() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        for _ in 0..2 {
            conn.execute(
                "INSERT INTO insights (pattern_id, timestamp, insight, confidence) VALUES ('p', 1, 'i', 0.5)",
                [],
            )
            .unwrap();
        }
        let max_id: i64 = conn
            .query_row("SELECT MAX(id) FROM insights", [], |row| row.get(0))
            .unwrap();
        assert_eq!(max_id, 2);
    }

    #[test]
    fn dropped_table_is_reported() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        conn.execute_batch("DROP TABLE training_cache").unwrap();
        let err = apply_migrations(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::MissingTable("training_cache")));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (99, 0)",
            [],
        )
        .unwrap();
        assert!(matches!(
            apply_migrations(&conn),
            Err(MigrationError::NewerSchema(99))
        ));
    }
}
