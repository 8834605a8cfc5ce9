//! Database schema migrations for machine-timeline.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{params, Connection, Result as SqliteResult};
use tracing::warn;

use crate::model::ModeCatalog;

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const CURRENT_VERSION: i32 = 4;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }
    if current_version < 3 {
        migrate_v3(conn)?;
    }
    if current_version < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Returns 0 if no version is set (initial database).
fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            warn!(error = %e, "failed to read schema_version");
        }
        0
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration v1: baseline. Tables are created by `Database::migrate()`.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    set_schema_version(conn, 1)
}

/// Migration v2: seed the builtin mode catalog.
///
/// Existing rows are kept so operator edits survive.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    for mode in ModeCatalog::builtin().iter() {
        tx.execute(
            "INSERT OR IGNORE INTO machine_modes (id, name, category, running, auto_sequence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                mode.id,
                mode.name,
                mode.category.as_str(),
                mode.running,
                mode.auto_sequence
            ],
        )?;
    }
    set_schema_version(&tx, 2)?;
    tx.commit()
}

/// Migration v3: indexes for the range lookups done by the analysis.
fn migrate_v3(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_facts_machine_end ON facts(machine_id, end_at);
         CREATE INDEX IF NOT EXISTS idx_facts_machine_begin ON facts(machine_id, begin_at);
         CREATE INDEX IF NOT EXISTS idx_auto_sequences_machine_begin ON auto_sequences(machine_id, begin_at);
         CREATE INDEX IF NOT EXISTS idx_modifications_queue ON modifications(machine_id, parent_id, status, priority);
         CREATE INDEX IF NOT EXISTS idx_modifications_parent ON modifications(parent_id);",
    )?;
    set_schema_version(&tx, 3)?;
    tx.commit()
}

fn has_column(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Migration v4: processing columns on slots and the auto-sequence watermark.
///
/// `needs_reconsolidation` and `consolidation_limit` mirror the reason
/// outcome so pending slots are found through an index. Existing reason
/// slots with either flag set are marked for reconsolidation, which
/// rewrites both columns.
fn migrate_v4(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    if !has_column(&tx, "slots", "needs_reconsolidation")? {
        tx.execute(
            "ALTER TABLE slots ADD COLUMN needs_reconsolidation INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !has_column(&tx, "slots", "consolidation_limit")? {
        tx.execute("ALTER TABLE slots ADD COLUMN consolidation_limit TEXT", [])?;
    }
    if !has_column(&tx, "analysis_status", "auto_sequence_watermark")? {
        tx.execute(
            "ALTER TABLE analysis_status ADD COLUMN auto_sequence_watermark TEXT",
            [],
        )?;
    }
    tx.execute(
        "UPDATE slots SET needs_reconsolidation = 1
         WHERE kind = 'reason'
           AND (json_extract(attributes, '$.outcome.needs_reconsolidation') = 1
                OR json_extract(attributes, '$.outcome.consolidation_limit') IS NOT NULL)",
        [],
    )?;
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_slots_machine_end ON slots(machine_id, kind, end_at);
         CREATE INDEX IF NOT EXISTS idx_slots_reconsolidation
            ON slots(machine_id, kind, begin_at) WHERE needs_reconsolidation = 1;
         CREATE INDEX IF NOT EXISTS idx_slots_consolidation_limit
            ON slots(machine_id, kind, consolidation_limit) WHERE consolidation_limit IS NOT NULL;",
    )?;
    set_schema_version(&tx, 4)?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE machine_modes (
                id INTEGER PRIMARY KEY, name TEXT NOT NULL, category TEXT NOT NULL,
                running INTEGER NOT NULL DEFAULT 0, auto_sequence INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE facts (id INTEGER PRIMARY KEY, machine_id INTEGER, begin_at TEXT, end_at TEXT, mode_id INTEGER);
             CREATE TABLE auto_sequences (id INTEGER PRIMARY KEY, machine_id INTEGER, begin_at TEXT);
             CREATE TABLE modifications (id INTEGER PRIMARY KEY, machine_id INTEGER, parent_id INTEGER, status TEXT, priority INTEGER);
             CREATE TABLE slots (machine_id INTEGER, kind TEXT, begin_at TEXT, end_at TEXT, attributes TEXT,
                PRIMARY KEY (machine_id, kind, begin_at));
             CREATE TABLE analysis_status (machine_id INTEGER PRIMARY KEY, watermark TEXT, updated_at TEXT);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn migrations_seed_modes_and_are_idempotent() {
        let conn = fresh();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), CURRENT_VERSION);
        let modes: i64 = conn
            .query_row("SELECT COUNT(*) FROM machine_modes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(modes, ModeCatalog::builtin().len() as i64);
    }

    #[test]
    fn seeding_keeps_existing_modes() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO machine_modes (id, name, category) VALUES (1, 'Idle', 'inactive')",
            [],
        )
        .unwrap();
        migrate(&conn).unwrap();
        let name: String = conn
            .query_row("SELECT name FROM machine_modes WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Idle");
    }

    #[test]
    fn processing_columns_mark_pending_reason_slots() {
        let conn = fresh();
        conn.execute_batch(
            "INSERT INTO slots VALUES (1, 'reason', '2024-02-01T08:00:00.000Z', '2024-02-01T09:00:00.000Z',
                '{\"outcome\":{\"needs_reconsolidation\":false,\"consolidation_limit\":\"2024-02-01T10:00:00Z\"}}');
             INSERT INTO slots VALUES (1, 'reason', '2024-02-01T09:00:00.000Z', NULL,
                '{\"outcome\":{\"needs_reconsolidation\":false,\"consolidation_limit\":null}}');
             INSERT INTO slots VALUES (1, 'observation', '2024-02-01T08:00:00.000Z', NULL, '{}');",
        )
        .unwrap();
        migrate(&conn).unwrap();
        assert!(has_column(&conn, "analysis_status", "auto_sequence_watermark").unwrap());
        let pending: Vec<String> = conn
            .prepare("SELECT begin_at FROM slots WHERE needs_reconsolidation = 1")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(pending, vec!["2024-02-01T08:00:00.000Z".to_string()]);
    }
}
