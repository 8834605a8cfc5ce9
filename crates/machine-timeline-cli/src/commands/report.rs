use clap::{Subcommand, ValueEnum};
use machine_timeline_core::timeline::{ObservationAttrs, OperationAttrs, ReasonAttrs};
use machine_timeline_core::Database;

use super::print_json;

#[derive(Clone, Copy, ValueEnum)]
pub enum SlotKindArg {
    Observation,
    Reason,
    Operation,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SummaryArg {
    Reason,
    Activity,
}

#[derive(Subcommand)]
pub enum ReportAction {
    /// Slots of one machine and kind
    Slots {
        machine: i64,
        #[arg(value_enum)]
        kind: SlotKindArg,
    },
    /// Day summaries
    Summary {
        #[arg(value_enum, default_value = "reason")]
        kind: SummaryArg,
        #[arg(long)]
        machine: Option<i64>,
    },
    /// Current status of a machine
    Status { machine: i64 },
}

pub fn run(action: ReportAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        ReportAction::Slots { machine, kind } => match kind {
            SlotKindArg::Observation => print_json(&db.load_slots::<ObservationAttrs>(machine)?)?,
            SlotKindArg::Reason => print_json(&db.load_slots::<ReasonAttrs>(machine)?)?,
            SlotKindArg::Operation => print_json(&db.load_slots::<OperationAttrs>(machine)?)?,
        },
        ReportAction::Summary { kind, machine } => {
            let rows = match kind {
                SummaryArg::Reason => db.reason_summary(machine)?,
                SummaryArg::Activity => db.activity_summary(machine)?,
            };
            print_json(&rows)?;
        }
        ReportAction::Status { machine } => match db.get_machine_status(machine)? {
            Some(status) => print_json(&status)?,
            None => return Err(format!("no status for machine {machine}").into()),
        },
    }
    Ok(())
}
