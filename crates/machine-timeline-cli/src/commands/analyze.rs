use std::time::Duration;

use clap::Subcommand;
use machine_timeline_core::{Config, Database, Scheduler};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::print_json;

#[derive(Subcommand)]
pub enum AnalyzeAction {
    /// Run one analysis pass and print its report
    Run {
        /// Only this machine (its queue and activity, no Global queue)
        #[arg(long)]
        machine: Option<i64>,
    },
    /// Run passes periodically until interrupted
    Watch {
        /// Seconds between passes (defaults to analysis.interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
}

pub fn run(action: AnalyzeAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let scheduler = Scheduler::open(Database::open()?, &config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match action {
        AnalyzeAction::Run { machine } => {
            let cancel = CancellationToken::new();
            match machine {
                Some(machine_id) => {
                    let report = runtime.block_on(async {
                        let scheduler = scheduler.clone();
                        tokio::task::spawn_blocking(move || {
                            scheduler.run_machine(machine_id, &cancel)
                        })
                        .await
                    })?;
                    print_json(&report)?;
                }
                None => {
                    let report = runtime.block_on(scheduler.run_pass(&cancel))?;
                    print_json(&report)?;
                }
            }
        }
        AnalyzeAction::Watch { interval } => {
            let interval_secs = interval.unwrap_or(config.analysis.interval_secs).max(1);
            let interval = Duration::from_secs(interval_secs);
            let cancel = CancellationToken::new();
            runtime.block_on(async {
                let shutdown = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received");
                    }
                    shutdown.cancel();
                });
                info!(interval_secs = interval.as_secs(), "watching");
                scheduler.run_periodically(interval, cancel).await
            })?;
        }
    }
    Ok(())
}
