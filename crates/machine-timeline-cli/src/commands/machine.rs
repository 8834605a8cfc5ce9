use clap::Subcommand;
use machine_timeline_core::storage::Database;
use machine_timeline_core::Machine;

use super::print_json;

#[derive(Subcommand)]
pub enum MachineAction {
    /// Register or rename a machine
    Add {
        /// Machine id
        id: i64,
        /// Display name
        name: String,
    },
    /// List machines
    List,
    /// List the mode catalog
    Modes,
}

pub fn run(action: MachineAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        MachineAction::Add { id, name } => {
            let machine = Machine { id, name };
            db.upsert_machine(&machine)?;
            print_json(&machine)?;
        }
        MachineAction::List => {
            print_json(&db.list_machines()?)?;
        }
        MachineAction::Modes => {
            let catalog = db.mode_catalog()?;
            let modes: Vec<_> = catalog.iter().collect();
            print_json(&modes)?;
        }
    }
    Ok(())
}
