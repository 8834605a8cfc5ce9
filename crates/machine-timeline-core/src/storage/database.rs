//! SQLite storage for machine timelines.
//!
//! One connection holds:
//! - Raw inputs: facts and auto-sequences
//! - The modification queue
//! - Slots of every kind, with JSON attributes
//! - Summary rows, machine status and the analysis watermark
//!
//! Timestamps are stored as RFC3339 UTC text with millisecond precision so
//! that text order is time order. Query helpers live next to the records
//! they map, in `timeline_db`, `modification_db` and `summary_db`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use super::{data_dir, migrations};
use crate::error::{DatabaseError, Result};

/// SQLite database for timelines and their inputs.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Get a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Open the database at `<data_dir>/machine-timeline.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self> {
        Self::open_path(&data_dir()?.join("machine-timeline.db"))
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS machines (
                id    INTEGER PRIMARY KEY,
                name  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS machine_modes (
                id             INTEGER PRIMARY KEY,
                name           TEXT NOT NULL,
                category       TEXT NOT NULL,
                running        INTEGER NOT NULL DEFAULT 0,
                auto_sequence  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS facts (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id  INTEGER NOT NULL,
                begin_at    TEXT NOT NULL,
                end_at      TEXT,
                mode_id     INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auto_sequences (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id  INTEGER NOT NULL,
                module_id   INTEGER NOT NULL DEFAULT 0,
                begin_at    TEXT NOT NULL,
                end_at      TEXT,
                sequence    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS modifications (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id  INTEGER,
                parent_id   INTEGER,
                priority    INTEGER NOT NULL DEFAULT 100,
                status      TEXT NOT NULL DEFAULT 'pending',
                payload     TEXT NOT NULL,
                children    TEXT NOT NULL DEFAULT '[]',
                error       TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS slots (
                machine_id  INTEGER NOT NULL,
                kind        TEXT NOT NULL,
                begin_at    TEXT NOT NULL,
                end_at      TEXT,
                attributes  TEXT NOT NULL,
                PRIMARY KEY (machine_id, kind, begin_at)
            );

            CREATE TABLE IF NOT EXISTS reason_summary (
                machine_id         INTEGER NOT NULL,
                day                TEXT NOT NULL,
                shift              TEXT NOT NULL DEFAULT '',
                observation_state  TEXT NOT NULL DEFAULT '',
                reason             TEXT NOT NULL,
                duration_secs      INTEGER NOT NULL DEFAULT 0,
                number             INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (machine_id, day, shift, observation_state, reason)
            );

            CREATE TABLE IF NOT EXISTS machine_activity_summary (
                machine_id         INTEGER NOT NULL,
                day                TEXT NOT NULL,
                observation_state  TEXT NOT NULL DEFAULT '',
                mode_id            INTEGER NOT NULL,
                duration_secs      INTEGER NOT NULL DEFAULT 0,
                number             INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (machine_id, day, observation_state, mode_id)
            );

            CREATE TABLE IF NOT EXISTS machine_status (
                machine_id              INTEGER PRIMARY KEY,
                mode_id                 INTEGER,
                observation_state       TEXT,
                shift                   TEXT,
                machine_state_template  TEXT,
                reason                  TEXT,
                reason_source           TEXT NOT NULL DEFAULT '{}',
                reason_score            REAL NOT NULL DEFAULT 0,
                auto_reason_number      INTEGER NOT NULL DEFAULT 0,
                reason_slot_end         TEXT,
                consolidation_limit     TEXT,
                updated_at              TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analysis_status (
                machine_id  INTEGER PRIMARY KEY,
                watermark   TEXT,
                updated_at  TEXT NOT NULL
            );",
        )?;

        migrations::migrate(&self.conn)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(())
    }

    /// Run `f` in one transaction, committed when `f` succeeds and rolled
    /// back otherwise.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Database) -> std::result::Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }
}

// === Helper Functions ===

/// Format a timestamp for storage.
pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn format_opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(format_ts)
}

/// Parse a stored timestamp from column `idx`.
pub(crate) fn parse_ts(
    idx: usize,
    value: &str,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(
    idx: usize,
    value: Option<String>,
) -> std::result::Result<Option<DateTime<Utc>>, rusqlite::Error> {
    value.map(|v| parse_ts(idx, &v)).transpose()
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> std::result::Result<String, rusqlite::Error> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(crate) fn from_json<T: DeserializeOwned>(
    idx: usize,
    value: &str,
) -> std::result::Result<T, rusqlite::Error> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Key columns cannot hold NULL, so an absent value is stored as ''.
pub(crate) fn format_key_text(value: Option<&str>) -> &str {
    value.unwrap_or("")
}

pub(crate) fn parse_key_text(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
