pub mod analyze;
pub mod config;
pub mod fact;
pub mod machine;
pub mod modification;
pub mod report;

use chrono::{DateTime, Utc};
use machine_timeline_core::TimeRange;
use serde::Serialize;

/// Parse an RFC 3339 timestamp argument.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{value}': {e}"))
}

/// Range from command arguments; no end means open-ended.
pub fn range(
    begin: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Result<TimeRange, Box<dyn std::error::Error>> {
    Ok(TimeRange::with_end(begin, end)?)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
