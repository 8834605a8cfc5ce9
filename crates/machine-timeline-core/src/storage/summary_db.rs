//! Summary rows, updated only through signed deltas.

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::params;

use super::database::{format_key_text, parse_key_text, Database};
use crate::accumulator::{Delta, SummaryKey, SummaryRow};

fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn parse_day(idx: usize, value: &str) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_reason_summary(row: &rusqlite::Row) -> Result<SummaryRow, rusqlite::Error> {
    let day: String = row.get(1)?;
    Ok(SummaryRow {
        key: SummaryKey::Reason {
            machine_id: row.get(0)?,
            day: parse_day(1, &day)?,
            shift: parse_key_text(row.get(2)?),
            observation_state: parse_key_text(row.get(3)?),
            reason: row.get(4)?,
        },
        duration_secs: row.get(5)?,
        number: row.get(6)?,
    })
}

fn row_to_activity_summary(row: &rusqlite::Row) -> Result<SummaryRow, rusqlite::Error> {
    let day: String = row.get(1)?;
    Ok(SummaryRow {
        key: SummaryKey::Activity {
            machine_id: row.get(0)?,
            day: parse_day(1, &day)?,
            observation_state: parse_key_text(row.get(2)?),
            mode_id: row.get(3)?,
        },
        duration_secs: row.get(4)?,
        number: row.get(5)?,
    })
}

impl Database {
    /// Add `delta` to the row of `key`, creating it when missing and
    /// deleting it when it falls to zero. Returns the new totals; the
    /// caller rejects negative ones.
    pub fn apply_summary_delta(
        &self,
        key: &SummaryKey,
        delta: Delta,
    ) -> Result<Delta, rusqlite::Error> {
        let totals = match key {
            SummaryKey::Reason {
                machine_id,
                day,
                shift,
                observation_state,
                reason,
            } => {
                let day = format_day(*day);
                let shift = format_key_text(shift.as_deref());
                let observation_state = format_key_text(observation_state.as_deref());
                let key_params = params![machine_id, day, shift, observation_state, reason];
                self.conn().execute(
                    "INSERT INTO reason_summary
                        (machine_id, day, shift, observation_state, reason, duration_secs, number)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(machine_id, day, shift, observation_state, reason) DO UPDATE SET
                        duration_secs = duration_secs + excluded.duration_secs,
                        number = number + excluded.number",
                    params![
                        machine_id,
                        day,
                        shift,
                        observation_state,
                        reason,
                        delta.duration_secs,
                        delta.number
                    ],
                )?;
                let totals = self.conn().query_row(
                    "SELECT duration_secs, number FROM reason_summary
                     WHERE machine_id = ?1 AND day = ?2 AND shift = ?3
                       AND observation_state = ?4 AND reason = ?5",
                    key_params,
                    |row| {
                        Ok(Delta {
                            duration_secs: row.get(0)?,
                            number: row.get(1)?,
                        })
                    },
                )?;
                if totals.is_zero() {
                    self.conn().execute(
                        "DELETE FROM reason_summary
                         WHERE machine_id = ?1 AND day = ?2 AND shift = ?3
                           AND observation_state = ?4 AND reason = ?5",
                        key_params,
                    )?;
                }
                totals
            }
            SummaryKey::Activity {
                machine_id,
                day,
                observation_state,
                mode_id,
            } => {
                let day = format_day(*day);
                let observation_state = format_key_text(observation_state.as_deref());
                let key_params = params![machine_id, day, observation_state, mode_id];
                self.conn().execute(
                    "INSERT INTO machine_activity_summary
                        (machine_id, day, observation_state, mode_id, duration_secs, number)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(machine_id, day, observation_state, mode_id) DO UPDATE SET
                        duration_secs = duration_secs + excluded.duration_secs,
                        number = number + excluded.number",
                    params![
                        machine_id,
                        day,
                        observation_state,
                        mode_id,
                        delta.duration_secs,
                        delta.number
                    ],
                )?;
                let totals = self.conn().query_row(
                    "SELECT duration_secs, number FROM machine_activity_summary
                     WHERE machine_id = ?1 AND day = ?2 AND observation_state = ?3 AND mode_id = ?4",
                    key_params,
                    |row| {
                        Ok(Delta {
                            duration_secs: row.get(0)?,
                            number: row.get(1)?,
                        })
                    },
                )?;
                if totals.is_zero() {
                    self.conn().execute(
                        "DELETE FROM machine_activity_summary
                         WHERE machine_id = ?1 AND day = ?2 AND observation_state = ?3 AND mode_id = ?4",
                        key_params,
                    )?;
                }
                totals
            }
        };
        Ok(totals)
    }

    pub fn reason_summary(
        &self,
        machine_id: Option<i64>,
    ) -> Result<Vec<SummaryRow>, rusqlite::Error> {
        let mut stmt = self.conn().prepare(
            "SELECT machine_id, day, shift, observation_state, reason, duration_secs, number
             FROM reason_summary
             WHERE ?1 IS NULL OR machine_id = ?1
             ORDER BY machine_id, day, shift, observation_state, reason",
        )?;
        let rows = stmt.query_map(params![machine_id], row_to_reason_summary)?;
        rows.collect()
    }

    pub fn activity_summary(
        &self,
        machine_id: Option<i64>,
    ) -> Result<Vec<SummaryRow>, rusqlite::Error> {
        let mut stmt = self.conn().prepare(
            "SELECT machine_id, day, observation_state, mode_id, duration_secs, number
             FROM machine_activity_summary
             WHERE ?1 IS NULL OR machine_id = ?1
             ORDER BY machine_id, day, observation_state, mode_id",
        )?;
        let rows = stmt.query_map(params![machine_id], row_to_activity_summary)?;
        rows.collect()
    }
}
