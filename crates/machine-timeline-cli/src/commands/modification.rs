use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use machine_timeline_core::model::DEFAULT_PRIORITY;
use machine_timeline_core::storage::Database;
use machine_timeline_core::{Config, ModificationKind, ModificationStatus, NewModification};
use serde_json::json;

use super::{parse_time, print_json, range};

#[derive(Subcommand)]
pub enum ModificationAction {
    /// Queue an observation state change
    ObservationState {
        #[command(flatten)]
        target: Target,
        /// Observation state (e.g. "Attended", "Unemployed")
        state: String,
        #[arg(long)]
        shift: Option<String>,
        #[arg(long)]
        template: Option<String>,
    },
    /// Queue a manual reason; omit the reason to reset it
    Reason {
        #[command(flatten)]
        target: Target,
        reason: Option<String>,
        /// Score of the manual reason (defaults to consolidation.manual_score)
        #[arg(long)]
        score: Option<f64>,
    },
    /// Queue an operation
    Operation {
        #[command(flatten)]
        target: Target,
        operation: String,
        #[arg(long)]
        work_order: Option<String>,
    },
    /// Queue a shift change
    Shift {
        #[command(flatten)]
        target: Target,
        shift: Option<String>,
    },
    /// Queue a reconsolidation
    Reconsolidate {
        #[command(flatten)]
        target: Target,
    },
    /// List modifications
    List {
        /// Only modifications in this status (e.g. "error")
        #[arg(long)]
        status: Option<String>,
    },
    /// Put a failed modification back in its queue
    Retry { id: i64 },
}

/// Where and when a modification applies.
#[derive(Args)]
pub struct Target {
    /// Machine id; omit for the Global queue
    #[arg(long)]
    machine: Option<i64>,
    /// Begin (RFC 3339)
    #[arg(long, value_parser = parse_time)]
    begin: DateTime<Utc>,
    /// End (RFC 3339); omit for open-ended
    #[arg(long, value_parser = parse_time)]
    end: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = DEFAULT_PRIORITY)]
    priority: i32,
}

fn queue(
    db: &Database,
    target: Target,
    kind: impl FnOnce(machine_timeline_core::TimeRange) -> ModificationKind,
) -> Result<(), Box<dyn std::error::Error>> {
    let kind = kind(range(target.begin, target.end)?);
    let new = match target.machine {
        Some(machine_id) => NewModification::for_machine(machine_id, kind),
        None => NewModification::global(kind),
    }
    .with_priority(target.priority);
    let id = db.insert_modification(&new)?;
    print_json(&json!({ "id": id }))
}

pub fn run(action: ModificationAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        ModificationAction::ObservationState {
            target,
            state,
            shift,
            template,
        } => queue(&db, target, |range| ModificationKind::ObservationState {
            range,
            observation_state: state,
            shift,
            machine_state_template: template,
        })?,
        ModificationAction::Reason {
            target,
            reason,
            score,
        } => {
            let score = match score {
                Some(score) => score,
                None => Config::load()?.consolidation.manual_score,
            };
            queue(&db, target, |range| ModificationKind::Reason {
                range,
                reason,
                score,
            })?
        }
        ModificationAction::Operation {
            target,
            operation,
            work_order,
        } => queue(&db, target, |range| ModificationKind::Operation {
            range,
            operation,
            work_order,
        })?,
        ModificationAction::Shift { target, shift } => {
            queue(&db, target, |range| ModificationKind::Shift { range, shift })?
        }
        ModificationAction::Reconsolidate { target } => {
            queue(&db, target, |range| ModificationKind::Reconsolidate { range })?
        }
        ModificationAction::List { status } => {
            let status = match status {
                Some(value) => Some(
                    ModificationStatus::parse(&value)
                        .ok_or_else(|| format!("unknown status: {value}"))?,
                ),
                None => None,
            };
            print_json(&db.list_modifications(status)?)?;
        }
        ModificationAction::Retry { id } => {
            if !db.retry_modification(id)? {
                return Err(format!("modification {id} is not in error").into());
            }
            print_json(&json!({ "id": id, "status": ModificationStatus::Pending }))?;
        }
    }
    Ok(())
}
