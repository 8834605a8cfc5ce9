//! Machines, raw inputs, slots and per-machine status.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::database::{
    format_opt_ts, format_ts, from_json, parse_opt_ts, parse_ts, to_json, Database,
};
use crate::model::{
    AutoSequence, Fact, Machine, MachineMode, MachineStatus, ModeCatalog, ModeCategory,
};
use crate::timeline::{KindAttributes, Slot, SlotChange, SlotKind, TimeRange};

fn row_to_fact(row: &rusqlite::Row) -> Result<Fact, rusqlite::Error> {
    let begin: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;
    Ok(Fact {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        range: TimeRange {
            begin: parse_ts(2, &begin)?,
            end: parse_opt_ts(3, end)?,
        },
        mode_id: row.get(4)?,
    })
}

fn row_to_auto_sequence(row: &rusqlite::Row) -> Result<AutoSequence, rusqlite::Error> {
    let begin: String = row.get(3)?;
    let end: Option<String> = row.get(4)?;
    Ok(AutoSequence {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        module_id: row.get(2)?,
        range: TimeRange {
            begin: parse_ts(3, &begin)?,
            end: parse_opt_ts(4, end)?,
        },
        sequence: row.get(5)?,
    })
}

fn row_to_slot<A: KindAttributes>(row: &rusqlite::Row) -> Result<Slot<A>, rusqlite::Error> {
    let begin: String = row.get(0)?;
    let end: Option<String> = row.get(1)?;
    let attributes: String = row.get(2)?;
    Ok(Slot::new(
        TimeRange {
            begin: parse_ts(0, &begin)?,
            end: parse_opt_ts(1, end)?,
        },
        from_json(2, &attributes)?,
    ))
}

fn row_to_status(row: &rusqlite::Row) -> Result<MachineStatus, rusqlite::Error> {
    let source: String = row.get(6)?;
    let updated_at: String = row.get(11)?;
    Ok(MachineStatus {
        machine_id: row.get(0)?,
        mode_id: row.get(1)?,
        observation_state: row.get(2)?,
        shift: row.get(3)?,
        machine_state_template: row.get(4)?,
        reason: row.get(5)?,
        reason_source: from_json(6, &source)?,
        reason_score: row.get(7)?,
        auto_reason_number: row.get(8)?,
        reason_slot_end: parse_opt_ts(9, row.get(9)?)?,
        consolidation_limit: parse_opt_ts(10, row.get(10)?)?,
        updated_at: parse_ts(11, &updated_at)?,
    })
}

const FACT_COLUMNS: &str = "id, machine_id, begin_at, end_at, mode_id";
const AUTO_SEQUENCE_COLUMNS: &str = "id, machine_id, module_id, begin_at, end_at, sequence";

impl Database {
    // === Machines & modes ===

    pub fn upsert_machine(&self, machine: &Machine) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO machines (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![machine.id, machine.name],
        )?;
        Ok(())
    }

    pub fn list_machines(&self) -> Result<Vec<Machine>, rusqlite::Error> {
        let mut stmt = self.conn().prepare("SELECT id, name FROM machines ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Machine {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    pub fn machine_exists(&self, machine_id: i64) -> Result<bool, rusqlite::Error> {
        self.conn()
            .query_row(
                "SELECT 1 FROM machines WHERE id = ?1",
                params![machine_id],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
    }

    pub fn upsert_mode(&self, mode: &MachineMode) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO machine_modes (id, name, category, running, auto_sequence)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, category = excluded.category,
                running = excluded.running, auto_sequence = excluded.auto_sequence",
            params![
                mode.id,
                mode.name,
                mode.category.as_str(),
                mode.running,
                mode.auto_sequence
            ],
        )?;
        Ok(())
    }

    pub fn mode_catalog(&self) -> Result<ModeCatalog, rusqlite::Error> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, category, running, auto_sequence FROM machine_modes ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let category: String = row.get(2)?;
            Ok(MachineMode {
                id: row.get(0)?,
                name: row.get(1)?,
                category: ModeCategory::parse(&category),
                running: row.get(3)?,
                auto_sequence: row.get(4)?,
            })
        })?;
        Ok(ModeCatalog::new(rows.collect::<Result<Vec<_>, _>>()?))
    }

    // === Facts ===

    pub fn insert_fact(
        &self,
        machine_id: i64,
        range: &TimeRange,
        mode_id: i64,
    ) -> Result<i64, rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO facts (machine_id, begin_at, end_at, mode_id) VALUES (?1, ?2, ?3, ?4)",
            params![
                machine_id,
                format_ts(range.begin),
                format_opt_ts(range.end),
                mode_id
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Facts not yet folded into slots: those ending after `after` (all of
    /// them when `None`), open facts included, by begin.
    pub fn facts_after(
        &self,
        machine_id: i64,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Fact>, rusqlite::Error> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM facts
             WHERE machine_id = ?1 AND (?2 IS NULL OR end_at IS NULL OR end_at > ?2)
             ORDER BY begin_at, id
             LIMIT ?3"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![machine_id, format_opt_ts(after), limit as i64],
            row_to_fact,
        )?;
        rows.collect()
    }

    pub fn facts_overlapping(
        &self,
        machine_id: i64,
        range: &TimeRange,
    ) -> Result<Vec<Fact>, rusqlite::Error> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM facts
             WHERE machine_id = ?1
               AND (end_at IS NULL OR end_at > ?2)
               AND (?3 IS NULL OR begin_at < ?3)
             ORDER BY begin_at, id"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![machine_id, format_ts(range.begin), format_opt_ts(range.end)],
            row_to_fact,
        )?;
        rows.collect()
    }

    // === Auto-sequences ===

    pub fn insert_auto_sequence(
        &self,
        machine_id: i64,
        module_id: i64,
        range: &TimeRange,
        sequence: &str,
    ) -> Result<i64, rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO auto_sequences (machine_id, module_id, begin_at, end_at, sequence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                machine_id,
                module_id,
                format_ts(range.begin),
                format_opt_ts(range.end),
                sequence
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Auto-sequences overlapping `range`, by begin.
    pub fn auto_sequences_overlapping(
        &self,
        machine_id: i64,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<AutoSequence>, rusqlite::Error> {
        let sql = format!(
            "SELECT {AUTO_SEQUENCE_COLUMNS} FROM auto_sequences
             WHERE machine_id = ?1
               AND (end_at IS NULL OR end_at > ?2)
               AND (?3 IS NULL OR begin_at < ?3)
             ORDER BY begin_at, id
             LIMIT ?4"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                machine_id,
                format_ts(range.begin),
                format_opt_ts(range.end),
                limit as i64
            ],
            row_to_auto_sequence,
        )?;
        rows.collect()
    }

    /// First auto-sequence starting at or after `at`.
    pub fn first_auto_sequence_after(
        &self,
        machine_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<AutoSequence>, rusqlite::Error> {
        let sql = format!(
            "SELECT {AUTO_SEQUENCE_COLUMNS} FROM auto_sequences
             WHERE machine_id = ?1 AND begin_at >= ?2
             ORDER BY begin_at, id
             LIMIT 1"
        );
        self.conn()
            .query_row(&sql, params![machine_id, format_ts(at)], row_to_auto_sequence)
            .optional()
    }

    // === Slots ===

    pub fn load_slots<A: KindAttributes>(
        &self,
        machine_id: i64,
    ) -> Result<Vec<Slot<A>>, rusqlite::Error> {
        let mut stmt = self.conn().prepare(
            "SELECT begin_at, end_at, attributes FROM slots
             WHERE machine_id = ?1 AND kind = ?2
             ORDER BY begin_at",
        )?;
        let rows = stmt.query_map(params![machine_id, A::KIND.as_str()], row_to_slot::<A>)?;
        rows.collect()
    }

    /// Slots of one kind whose end falls in `[from, before)`. Open slots
    /// count as ending after any `from` and are never before `before`; a
    /// missing bound is unbounded.
    pub fn load_slots_ending<A: KindAttributes>(
        &self,
        machine_id: i64,
        from: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Slot<A>>, rusqlite::Error> {
        let mut stmt = self.conn().prepare(
            "SELECT begin_at, end_at, attributes FROM slots
             WHERE machine_id = ?1 AND kind = ?2
               AND (?3 IS NULL OR end_at IS NULL OR end_at >= ?3)
               AND (?4 IS NULL OR (end_at IS NOT NULL AND end_at < ?4))
             ORDER BY begin_at",
        )?;
        let rows = stmt.query_map(
            params![
                machine_id,
                A::KIND.as_str(),
                format_opt_ts(from),
                format_opt_ts(before)
            ],
            row_to_slot::<A>,
        )?;
        rows.collect()
    }

    /// Reason slots to consolidate again at `data_end`: those flagged for
    /// reconsolidation and those whose consolidation limit has been
    /// reached, by begin.
    pub fn reason_slots_to_process(
        &self,
        machine_id: i64,
        data_end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TimeRange>, rusqlite::Error> {
        let mut stmt = self.conn().prepare(
            "SELECT begin_at, end_at FROM slots
             WHERE machine_id = ?1 AND kind = ?2 AND needs_reconsolidation = 1
             UNION
             SELECT begin_at, end_at FROM slots
             WHERE machine_id = ?1 AND kind = ?2
               AND consolidation_limit IS NOT NULL AND consolidation_limit <= ?3
             ORDER BY begin_at
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                machine_id,
                SlotKind::Reason.as_str(),
                format_opt_ts(data_end),
                limit as i64
            ],
            |row| {
                let begin: String = row.get(0)?;
                Ok(TimeRange {
                    begin: parse_ts(0, &begin)?,
                    end: parse_opt_ts(1, row.get(1)?)?,
                })
            },
        )?;
        rows.collect()
    }

    /// Replay partition changes, in order, on the stored slots.
    pub fn apply_slot_changes<A: KindAttributes>(
        &self,
        machine_id: i64,
        changes: &[SlotChange<A>],
    ) -> Result<(), rusqlite::Error> {
        let kind = A::KIND.as_str();
        for change in changes {
            match change {
                SlotChange::Removed(slot) => {
                    self.conn().execute(
                        "DELETE FROM slots WHERE machine_id = ?1 AND kind = ?2 AND begin_at = ?3",
                        params![machine_id, kind, format_ts(slot.range.begin)],
                    )?;
                }
                SlotChange::Added(slot) => {
                    let (needs_reconsolidation, consolidation_limit) =
                        slot.attrs.processing_marks();
                    self.conn().execute(
                        "INSERT OR REPLACE INTO slots (machine_id, kind, begin_at, end_at,
                            attributes, needs_reconsolidation, consolidation_limit)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            machine_id,
                            kind,
                            format_ts(slot.range.begin),
                            format_opt_ts(slot.range.end),
                            to_json(&slot.attrs)?,
                            needs_reconsolidation,
                            format_opt_ts(consolidation_limit)
                        ],
                    )?;
                }
            }
        }
        Ok(())
    }

    // === Status & watermark ===

    pub fn upsert_machine_status(&self, status: &MachineStatus) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO machine_status (
                machine_id, mode_id, observation_state, shift, machine_state_template, reason,
                reason_source, reason_score, auto_reason_number, reason_slot_end,
                consolidation_limit, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                status.machine_id,
                status.mode_id,
                status.observation_state,
                status.shift,
                status.machine_state_template,
                status.reason,
                to_json(&status.reason_source)?,
                status.reason_score,
                status.auto_reason_number,
                format_opt_ts(status.reason_slot_end),
                format_opt_ts(status.consolidation_limit),
                format_ts(status.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_machine_status(
        &self,
        machine_id: i64,
    ) -> Result<Option<MachineStatus>, rusqlite::Error> {
        self.conn()
            .query_row(
                "SELECT machine_id, mode_id, observation_state, shift, machine_state_template,
                        reason, reason_source, reason_score, auto_reason_number,
                        reason_slot_end, consolidation_limit, updated_at
                 FROM machine_status WHERE machine_id = ?1",
                params![machine_id],
                row_to_status,
            )
            .optional()
    }

    /// Time up to which facts have been folded into slots.
    pub fn watermark(&self, machine_id: i64) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
        let value: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT watermark FROM analysis_status WHERE machine_id = ?1",
                params![machine_id],
                |row| row.get(0),
            )
            .optional()?;
        parse_opt_ts(0, value.flatten())
    }

    pub fn set_watermark(
        &self,
        machine_id: i64,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO analysis_status (machine_id, watermark, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(machine_id) DO UPDATE SET
                watermark = excluded.watermark, updated_at = excluded.updated_at",
            params![machine_id, format_opt_ts(watermark), format_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Time up to which eligible slots have been matched against
    /// auto-sequences. Trails the watermark while a run waits for its
    /// auto-sequence.
    pub fn auto_sequence_watermark(
        &self,
        machine_id: i64,
    ) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
        let value: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT auto_sequence_watermark FROM analysis_status WHERE machine_id = ?1",
                params![machine_id],
                |row| row.get(0),
            )
            .optional()?;
        parse_opt_ts(0, value.flatten())
    }

    pub fn set_auto_sequence_watermark(
        &self,
        machine_id: i64,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO analysis_status (machine_id, auto_sequence_watermark, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(machine_id) DO UPDATE SET
                auto_sequence_watermark = excluded.auto_sequence_watermark,
                updated_at = excluded.updated_at",
            params![machine_id, format_opt_ts(watermark), format_ts(Utc::now())],
        )?;
        Ok(())
    }
}
