//! The modification queue.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::database::{format_ts, from_json, parse_ts, to_json, Database};
use crate::model::{
    Modification, ModificationCursor, ModificationQueue, ModificationScope, ModificationStatus,
    NewModification, QueuedModification,
};

/// Parse a modification status, falling back to `Error` so that an
/// unreadable row halts its queue instead of being skipped.
fn parse_status(value: &str) -> ModificationStatus {
    ModificationStatus::parse(value).unwrap_or(ModificationStatus::Error)
}

fn parse_scope(machine_id: Option<i64>) -> ModificationScope {
    match machine_id {
        Some(id) => ModificationScope::Machine(id),
        None => ModificationScope::Global,
    }
}

const MODIFICATION_COLUMNS: &str =
    "id, machine_id, parent_id, priority, status, payload, children, error, created_at, updated_at";

fn row_to_modification(row: &rusqlite::Row) -> Result<Modification, rusqlite::Error> {
    let status: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let children: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(Modification {
        id: row.get(0)?,
        scope: parse_scope(row.get(1)?),
        parent_id: row.get(2)?,
        priority: row.get(3)?,
        status: parse_status(&status),
        kind: from_json(5, &payload)?,
        children: from_json(6, &children)?,
        error: row.get(7)?,
        created_at: parse_ts(8, &created_at)?,
        updated_at: parse_ts(9, &updated_at)?,
    })
}

impl Database {
    pub fn insert_modification(&self, new: &NewModification) -> Result<i64, rusqlite::Error> {
        let now = format_ts(Utc::now());
        self.conn().execute(
            "INSERT INTO modifications
                (machine_id, parent_id, priority, status, payload, children, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?7)",
            params![
                new.scope.machine_id(),
                new.parent_id,
                new.priority,
                ModificationStatus::Pending.as_str(),
                to_json(&new.kind)?,
                format_ts(new.created_at),
                now
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_modification(&self, id: i64) -> Result<Option<Modification>, rusqlite::Error> {
        let sql = format!("SELECT {MODIFICATION_COLUMNS} FROM modifications WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![id], row_to_modification)
            .optional()
    }

    /// Modifications by id, optionally restricted to one status.
    pub fn list_modifications(
        &self,
        status: Option<ModificationStatus>,
    ) -> Result<Vec<Modification>, rusqlite::Error> {
        let sql = format!(
            "SELECT {MODIFICATION_COLUMNS} FROM modifications
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], row_to_modification)?;
        rows.collect()
    }

    /// Move a modification from `from` to `to`. Returns `false`, leaving the
    /// row untouched, when its stored status is not `from`.
    pub fn transition_modification(
        &self,
        id: i64,
        from: ModificationStatus,
        to: ModificationStatus,
        error: Option<&str>,
    ) -> Result<bool, rusqlite::Error> {
        let updated = self.conn().execute(
            "UPDATE modifications SET status = ?3, error = ?4, updated_at = ?5
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), error, format_ts(Utc::now())],
        )?;
        Ok(updated > 0)
    }

    pub fn set_modification_children(
        &self,
        id: i64,
        children: &[i64],
    ) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "UPDATE modifications SET children = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, to_json(&children)?, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Put a failed modification back in its queue. Returns whether the
    /// modification was in `Error`.
    pub fn retry_modification(&self, id: i64) -> Result<bool, rusqlite::Error> {
        self.transition_modification(
            id,
            ModificationStatus::Error,
            ModificationStatus::Pending,
            None,
        )
    }

    /// First top-level, unfinished modification of `queue` after `cursor`
    /// in `(effective priority desc, id asc)` order.
    ///
    /// A parent waiting on children takes the highest priority among its
    /// unfinished direct children.
    pub fn next_modification(
        &self,
        queue: ModificationQueue,
        cursor: &ModificationCursor,
    ) -> Result<Option<QueuedModification>, rusqlite::Error> {
        let machine_id = match queue {
            ModificationQueue::Global => None,
            ModificationQueue::Machine(id) => Some(id),
        };
        let sql = format!(
            "SELECT * FROM (
                SELECT {MODIFICATION_COLUMNS},
                    CASE WHEN m.status = ?1
                        THEN COALESCE(
                            (SELECT MAX(c.priority) FROM modifications c
                             WHERE c.parent_id = m.id AND c.status <> ?2),
                            m.priority)
                        ELSE m.priority
                    END AS effective_priority
                FROM modifications m
                WHERE m.parent_id IS NULL
                  AND m.status <> ?2
                  AND ((?3 IS NULL AND m.machine_id IS NULL) OR m.machine_id = ?3)
             )
             WHERE effective_priority < ?4 OR (effective_priority = ?4 AND id > ?5)
             ORDER BY effective_priority DESC, id ASC
             LIMIT 1"
        );
        self.conn()
            .query_row(
                &sql,
                params![
                    ModificationStatus::PendingSubModifications.as_str(),
                    ModificationStatus::Done.as_str(),
                    machine_id,
                    cursor.after_priority,
                    cursor.after_id
                ],
                |row| {
                    Ok(QueuedModification {
                        modification: row_to_modification(row)?,
                        effective_priority: row.get(10)?,
                    })
                },
            )
            .optional()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModificationKind;
    use crate::timeline::TimeRange;
    use chrono::TimeZone;

    fn kind() -> ModificationKind {
        ModificationKind::Reconsolidate {
            range: TimeRange::open(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    fn drain(db: &Database, queue: ModificationQueue) -> Vec<i64> {
        let mut cursor = ModificationCursor::start();
        let mut drawn = Vec::new();
        while let Some(next) = db.next_modification(queue, &cursor).unwrap() {
            cursor.advance(&next);
            drawn.push(next.modification.id);
        }
        drawn
    }

    #[test]
    fn insert_and_read_back() {
        let db = Database::open_memory().unwrap();
        let id = db
            .insert_modification(&NewModification::for_machine(3, kind()).with_priority(7))
            .unwrap();
        let stored = db.get_modification(id).unwrap().unwrap();
        assert_eq!(stored.scope, ModificationScope::Machine(3));
        assert_eq!(stored.priority, 7);
        assert_eq!(stored.status, ModificationStatus::Pending);
        assert_eq!(stored.kind, kind());
        assert!(stored.children.is_empty());
    }

    #[test]
    fn queues_are_separated() {
        let db = Database::open_memory().unwrap();
        let global = db.insert_modification(&NewModification::global(kind())).unwrap();
        let first = db
            .insert_modification(&NewModification::for_machine(1, kind()))
            .unwrap();
        db.insert_modification(&NewModification::for_machine(2, kind()))
            .unwrap();
        assert_eq!(drain(&db, ModificationQueue::Global), vec![global]);
        assert_eq!(drain(&db, ModificationQueue::Machine(1)), vec![first]);
    }

    #[test]
    fn done_and_child_modifications_are_not_drawn() {
        let db = Database::open_memory().unwrap();
        let parent = db
            .insert_modification(&NewModification::for_machine(1, kind()))
            .unwrap();
        let stored = db.get_modification(parent).unwrap().unwrap();
        db.insert_modification(&NewModification::for_machine(1, kind()).child_of(&stored))
            .unwrap();
        let done = db
            .insert_modification(&NewModification::for_machine(1, kind()))
            .unwrap();
        db.transition_modification(
            done,
            ModificationStatus::Pending,
            ModificationStatus::Done,
            None,
        )
        .unwrap();
        assert_eq!(drain(&db, ModificationQueue::Machine(1)), vec![parent]);
    }

    #[test]
    fn waiting_parent_takes_child_priority() {
        let db = Database::open_memory().unwrap();
        let parent = db
            .insert_modification(&NewModification::for_machine(1, kind()).with_priority(10))
            .unwrap();
        let other = db
            .insert_modification(&NewModification::for_machine(1, kind()).with_priority(50))
            .unwrap();
        let stored = db.get_modification(parent).unwrap().unwrap();
        db.insert_modification(
            &NewModification::for_machine(1, kind())
                .with_priority(90)
                .child_of(&stored),
        )
        .unwrap();
        db.transition_modification(
            parent,
            ModificationStatus::Pending,
            ModificationStatus::PendingSubModifications,
            None,
        )
        .unwrap();

        let first = db
            .next_modification(ModificationQueue::Machine(1), &ModificationCursor::start())
            .unwrap()
            .unwrap();
        assert_eq!(first.modification.id, parent);
        assert_eq!(first.effective_priority, 90);
        assert_eq!(drain(&db, ModificationQueue::Machine(1)), vec![parent, other]);
    }

    #[test]
    fn retry_only_applies_to_errors() {
        let db = Database::open_memory().unwrap();
        let id = db
            .insert_modification(&NewModification::for_machine(1, kind()))
            .unwrap();
        assert!(!db.retry_modification(id).unwrap());
        db.transition_modification(
            id,
            ModificationStatus::Pending,
            ModificationStatus::Error,
            Some("bad range"),
        )
        .unwrap();
        assert_eq!(
            db.list_modifications(Some(ModificationStatus::Error)).unwrap().len(),
            1
        );
        assert!(db.retry_modification(id).unwrap());
        let stored = db.get_modification(id).unwrap().unwrap();
        assert_eq!(stored.status, ModificationStatus::Pending);
        assert_eq!(stored.error, None);
    }

    #[test]
    fn transition_requires_the_expected_status() {
        let db = Database::open_memory().unwrap();
        let id = db
            .insert_modification(&NewModification::for_machine(1, kind()))
            .unwrap();
        assert!(!db
            .transition_modification(
                id,
                ModificationStatus::InProgress,
                ModificationStatus::Done,
                None
            )
            .unwrap());
        assert!(db
            .transition_modification(
                id,
                ModificationStatus::Pending,
                ModificationStatus::InProgress,
                None
            )
            .unwrap());
        let stored = db.get_modification(id).unwrap().unwrap();
        assert_eq!(stored.status, ModificationStatus::InProgress);
    }
}
