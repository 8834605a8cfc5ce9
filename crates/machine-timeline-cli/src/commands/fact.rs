use chrono::{DateTime, Utc};
use clap::Subcommand;
use machine_timeline_core::storage::Database;
use serde_json::json;

use super::{parse_time, print_json, range};

#[derive(Subcommand)]
pub enum FactAction {
    /// Append a mode fact
    Add {
        /// Machine id
        machine: i64,
        /// Mode id
        mode: i64,
        /// Begin (RFC 3339)
        #[arg(value_parser = parse_time)]
        begin: DateTime<Utc>,
        /// End (RFC 3339); omit for a fact still running
        #[arg(value_parser = parse_time)]
        end: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand)]
pub enum AutoSequenceAction {
    /// Append an auto-sequence
    Add {
        /// Machine id
        machine: i64,
        /// Sequence label
        sequence: String,
        /// Begin (RFC 3339)
        #[arg(value_parser = parse_time)]
        begin: DateTime<Utc>,
        /// End (RFC 3339)
        #[arg(value_parser = parse_time)]
        end: Option<DateTime<Utc>>,
        /// Machine module emitting the sequence
        #[arg(long, default_value_t = 1)]
        module: i64,
    },
}

pub fn run_facts(action: FactAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;
    match action {
        FactAction::Add {
            machine,
            mode,
            begin,
            end,
        } => {
            let range = range(begin, end)?;
            let id = db.insert_fact(machine, &range, mode)?;
            print_json(&json!({
                "id": id,
                "machine_id": machine,
                "range": range,
                "mode_id": mode
            }))?;
        }
    }
    Ok(())
}

pub fn run_auto_sequences(action: AutoSequenceAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;
    match action {
        AutoSequenceAction::Add {
            machine,
            sequence,
            begin,
            end,
            module,
        } => {
            let range = range(begin, end)?;
            let id = db.insert_auto_sequence(machine, module, &range, &sequence)?;
            print_json(&json!({
                "id": id,
                "machine_id": machine,
                "module_id": module,
                "range": range,
                "sequence": sequence,
            }))?;
        }
    }
    Ok(())
}
