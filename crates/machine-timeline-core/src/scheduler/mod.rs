//! Analysis passes over every machine.
//!
//! A pass drains the Global modification queue first, then runs one
//! worker per machine. A machine worker:
//!
//! 1. drains the machine's modification queue;
//! 2. folds new facts into the timeline, batch after batch;
//! 3. reconsolidates reason slots waiting for it;
//! 4. refreshes the machine status.
//!
//! Every step is one unit of work: a single transaction holding the
//! database lock, retried on transient storage failures. Cancellation is
//! checked between units.

mod global;
mod queue;
mod retry;

pub use global::GlobalProcessor;
pub use queue::{
    drain_queue, ModificationProcessor, Outcome, QueueReport, QueueSettings, QueueStop,
};
pub use retry::retry_transient;

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analysis::{AnalysisContext, MachineAnalysis};
use crate::error::{CoreError, ErrorContext, Result};
use crate::model::{MachineStatus, ModificationQueue};
use crate::storage::{Config, Database};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MachineRunStatus {
    Completed,
    Cancelled,
    /// A modification in `Error` stopped the machine's queue, or the Global
    /// queue the machine passes wait for.
    Halted { modification_id: i64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineReport {
    pub machine_id: i64,
    pub modifications: usize,
    pub facts: usize,
    pub auto_sequence_tags: usize,
    pub reason_slots: usize,
    pub extension_failures: usize,
    pub status: MachineRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_status: Option<MachineStatus>,
}

impl MachineReport {
    fn new(machine_id: i64) -> Self {
        Self {
            machine_id,
            modifications: 0,
            facts: 0,
            auto_sequence_tags: 0,
            reason_slots: 0,
            extension_failures: 0,
            status: MachineRunStatus::Completed,
            machine_status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub global: QueueReport,
    pub machines: Vec<MachineReport>,
}

/// Runs analysis passes against a shared database.
#[derive(Clone)]
pub struct Scheduler {
    db: Arc<Mutex<Database>>,
    context: Arc<AnalysisContext>,
}

impl Scheduler {
    pub fn new(db: Arc<Mutex<Database>>, context: Arc<AnalysisContext>) -> Self {
        Self { db, context }
    }

    /// Build a scheduler over `db` with the mode catalog stored in it.
    pub fn open(db: Database, config: &Config) -> Result<Self> {
        let modes = db.mode_catalog()?;
        let context = AnalysisContext::new(config, modes)?;
        Ok(Self::new(Arc::new(Mutex::new(db)), Arc::new(context)))
    }

    pub fn database(&self) -> &Arc<Mutex<Database>> {
        &self.db
    }

    pub fn context(&self) -> &Arc<AnalysisContext> {
        &self.context
    }

    fn settings(&self) -> QueueSettings {
        let analysis = &self.context.analysis;
        QueueSettings {
            max_attempts: analysis.max_attempts,
            backoff: Duration::from_millis(analysis.retry_backoff_ms),
            max_depth: analysis.max_sub_modification_depth,
        }
    }

    /// Drain the Global queue.
    pub fn run_global(&self, cancel: &CancellationToken) -> Result<QueueReport> {
        let mut processor = GlobalProcessor::new(Arc::clone(&self.context));
        let report = drain_queue(
            &self.db,
            ModificationQueue::Global,
            &mut processor,
            &self.settings(),
            cancel,
        )?;
        if let QueueStop::Halted {
            modification_id, ..
        } = &report.stop
        {
            warn!(modification_id, "global queue halted");
        }
        Ok(report)
    }

    /// Run one machine's pass. Errors end the pass and are reported, not
    /// returned.
    pub fn run_machine(&self, machine_id: i64, cancel: &CancellationToken) -> MachineReport {
        let mut report = MachineReport::new(machine_id);
        match self.machine_pass(machine_id, cancel, &mut report) {
            Ok(status) => report.status = status,
            Err(err) => {
                error!(machine_id, error = %err, "machine pass failed");
                report.status = MachineRunStatus::Failed {
                    error: err.to_string(),
                };
            }
        }
        report
    }

    fn machine_pass(
        &self,
        machine_id: i64,
        cancel: &CancellationToken,
        report: &mut MachineReport,
    ) -> Result<MachineRunStatus> {
        let settings = self.settings();
        let context = ErrorContext::machine(machine_id);
        let mut analysis = retry_transient(settings.max_attempts, settings.backoff, &context, || {
            let db = self.db.lock()?;
            MachineAnalysis::load(&db, machine_id, Arc::clone(&self.context))
        })?;

        let queue = drain_queue(
            &self.db,
            ModificationQueue::Machine(machine_id),
            &mut analysis,
            &settings,
            cancel,
        );
        report.extension_failures = analysis.extension_failures();
        let queue = queue?;
        report.modifications = queue.processed;
        match queue.stop {
            QueueStop::Drained => {}
            QueueStop::Cancelled => return Ok(MachineRunStatus::Cancelled),
            QueueStop::Halted {
                modification_id, ..
            } => {
                warn!(machine_id, modification_id, "machine queue halted");
                return Ok(MachineRunStatus::Halted { modification_id });
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(MachineRunStatus::Cancelled);
            }
            let batch = self.unit(&mut analysis, &settings, |analysis, db| {
                analysis.process_activity(db)
            })?;
            report.facts += batch.facts;
            if batch.facts == 0 || !batch.advanced {
                break;
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(MachineRunStatus::Cancelled);
            }
            let batch = self.unit(&mut analysis, &settings, |analysis, db| {
                analysis.process_auto_sequences(db)
            })?;
            report.auto_sequence_tags += batch.tagged;
            if !batch.advanced {
                break;
            }
        }

        for _ in 0..self.context.analysis.max_loops {
            if cancel.is_cancelled() {
                return Ok(MachineRunStatus::Cancelled);
            }
            let processed = self.unit(&mut analysis, &settings, |analysis, db| {
                analysis.process_reason_slots(db)
            })?;
            report.reason_slots += processed;
            if processed == 0 {
                break;
            }
        }
        report.extension_failures = analysis.extension_failures();

        if cancel.is_cancelled() {
            return Ok(MachineRunStatus::Cancelled);
        }
        let status = self.unit(&mut analysis, &settings, |analysis, db| {
            analysis.refresh_status(db)
        })?;
        report.machine_status = Some(status);
        info!(
            machine_id,
            facts = report.facts,
            auto_sequence_tags = report.auto_sequence_tags,
            reason_slots = report.reason_slots,
            "machine pass completed"
        );
        Ok(MachineRunStatus::Completed)
    }

    /// One unit of work: `work` and the journal it leaves are written in a
    /// single transaction, and undone in memory when it rolls back.
    fn unit<T, F>(
        &self,
        analysis: &mut MachineAnalysis,
        settings: &QueueSettings,
        mut work: F,
    ) -> Result<T>
    where
        F: FnMut(&mut MachineAnalysis, &Database) -> Result<T>,
    {
        let context = ErrorContext::machine(analysis.machine_id());
        retry_transient(settings.max_attempts, settings.backoff, &context, || {
            let db = self.db.lock()?;
            let result: Result<T> = db.transaction(|db| {
                let value = work(analysis, db)?;
                analysis.persist(db)?;
                Ok(value)
            });
            match &result {
                Ok(_) => analysis.commit(),
                Err(_) => analysis.rollback(),
            }
            result
        })
    }

    fn machine_ids(&self) -> Result<Vec<i64>> {
        let db = self.db.lock()?;
        Ok(db.list_machines()?.into_iter().map(|m| m.id).collect())
    }

    /// Run a full pass on the calling thread.
    pub fn run_pass_blocking(&self, cancel: &CancellationToken) -> Result<PassReport> {
        let global = self.run_global(cancel)?;
        let machine_ids = self.machine_ids()?;
        if let Some(machines) = held_by_global(&global, &machine_ids) {
            return Ok(PassReport { global, machines });
        }
        let machines = machine_ids
            .into_iter()
            .map(|id| self.run_machine(id, cancel))
            .collect();
        Ok(PassReport { global, machines })
    }

    /// Run a full pass: the Global queue, then the machines, concurrently
    /// unless `analysis.sequential` is set.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassReport> {
        let scheduler = self.clone();
        let token = cancel.clone();
        let (global, machine_ids) = tokio::task::spawn_blocking(move || {
            let global = scheduler.run_global(&token)?;
            Ok::<_, CoreError>((global, scheduler.machine_ids()?))
        })
        .await
        .map_err(join_error)??;
        if let Some(machines) = held_by_global(&global, &machine_ids) {
            return Ok(PassReport { global, machines });
        }

        let machines = if self.context.analysis.sequential {
            let scheduler = self.clone();
            let token = cancel.clone();
            tokio::task::spawn_blocking(move || {
                machine_ids
                    .into_iter()
                    .map(|id| scheduler.run_machine(id, &token))
                    .collect::<Vec<_>>()
            })
            .await
            .map_err(join_error)?
        } else {
            let mut workers = JoinSet::new();
            for machine_id in machine_ids {
                let scheduler = self.clone();
                let token = cancel.clone();
                workers.spawn_blocking(move || scheduler.run_machine(machine_id, &token));
            }
            let mut machines = Vec::with_capacity(workers.len());
            while let Some(joined) = workers.join_next().await {
                machines.push(joined.map_err(join_error)?);
            }
            machines.sort_by_key(|report: &MachineReport| report.machine_id);
            machines
        };
        Ok(PassReport { global, machines })
    }

    /// Run passes every `interval` until `cancel` fires.
    pub async fn run_periodically(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_pass(&cancel).await {
                        Ok(report) => info!(
                            machines = report.machines.len(),
                            global = report.global.processed,
                            "analysis pass finished"
                        ),
                        Err(err) => error!(error = %err, "analysis pass failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("analysis loop shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Reports for machines whose passes cannot start because the Global queue
/// halted; `None` when it did not.
fn held_by_global(global: &QueueReport, machine_ids: &[i64]) -> Option<Vec<MachineReport>> {
    let QueueStop::Halted {
        modification_id, ..
    } = global.stop
    else {
        return None;
    };
    warn!(modification_id, "machine passes held by the global queue");
    Some(
        machine_ids
            .iter()
            .map(|&machine_id| MachineReport {
                status: MachineRunStatus::Halted { modification_id },
                ..MachineReport::new(machine_id)
            })
            .collect(),
    )
}

fn join_error(err: tokio::task::JoinError) -> CoreError {
    CoreError::Custom(format!("analysis worker failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Machine, ModificationKind, ModificationStatus, NewModification};
    use crate::timeline::TimeRange;
    use chrono::{TimeZone, Utc};

    fn scheduler() -> Scheduler {
        let db = Database::open_memory().unwrap();
        for id in [1, 2] {
            db.upsert_machine(&Machine {
                id,
                name: format!("machine-{id}"),
            })
            .unwrap();
        }
        Scheduler::open(db, &Config::default()).unwrap()
    }

    fn reconsolidate() -> ModificationKind {
        ModificationKind::Reconsolidate {
            range: TimeRange::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(),
            )
            .unwrap(),
        }
    }

    #[test]
    fn global_modifications_fan_out_to_machines() {
        let scheduler = scheduler();
        let id = {
            let db = scheduler.database().lock().unwrap();
            db.insert_modification(&NewModification::global(reconsolidate()))
                .unwrap()
        };
        let report = scheduler.run_global(&CancellationToken::new()).unwrap();
        assert_eq!(report.stop, QueueStop::Drained);
        assert_eq!(report.processed, 3);

        let db = scheduler.database().lock().unwrap();
        let parent = db.get_modification(id).unwrap().unwrap();
        assert_eq!(parent.status, ModificationStatus::Done);
        assert_eq!(parent.children.len(), 2);
    }

    #[test]
    fn machine_only_kinds_fail_in_the_global_queue() {
        let scheduler = scheduler();
        let kind = ModificationKind::Reason {
            range: *reconsolidate().range(),
            reason: Some("Setup".into()),
            score: 100.0,
        };
        let id = {
            let db = scheduler.database().lock().unwrap();
            db.insert_modification(&NewModification::global(kind)).unwrap()
        };
        let report = scheduler.run_global(&CancellationToken::new()).unwrap();
        assert!(matches!(
            report.stop,
            QueueStop::Halted { modification_id, .. } if modification_id == id
        ));
    }

    #[test]
    fn halted_global_queue_holds_machine_passes() {
        let scheduler = scheduler();
        let kind = ModificationKind::Reason {
            range: *reconsolidate().range(),
            reason: Some("Setup".into()),
            score: 100.0,
        };
        let (global_id, machine_id) = {
            let db = scheduler.database().lock().unwrap();
            let global_id = db.insert_modification(&NewModification::global(kind)).unwrap();
            let machine_id = db
                .insert_modification(&NewModification::for_machine(1, reconsolidate()))
                .unwrap();
            (global_id, machine_id)
        };

        let report = scheduler.run_pass_blocking(&CancellationToken::new()).unwrap();
        assert_eq!(report.machines.len(), 2);
        for machine in &report.machines {
            assert_eq!(
                machine.status,
                MachineRunStatus::Halted {
                    modification_id: global_id
                }
            );
            assert_eq!(machine.modifications, 0);
        }
        let db = scheduler.database().lock().unwrap();
        assert_eq!(
            db.get_modification(machine_id).unwrap().unwrap().status,
            ModificationStatus::Pending
        );
    }

    #[test]
    fn cancelled_pass_stops_before_work() {
        let scheduler = scheduler();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = scheduler.run_pass_blocking(&cancel).unwrap();
        assert_eq!(report.global.stop, QueueStop::Cancelled);
        assert!(report
            .machines
            .iter()
            .all(|m| m.status == MachineRunStatus::Cancelled));
    }

    #[test]
    fn machine_pass_writes_status() {
        let scheduler = scheduler();
        {
            let db = scheduler.database().lock().unwrap();
            db.insert_fact(
                1,
                &TimeRange::new(
                    Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap(),
                    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
                )
                .unwrap(),
                2,
            )
            .unwrap();
        }
        let report = scheduler.run_machine(1, &CancellationToken::new());
        assert_eq!(report.status, MachineRunStatus::Completed);
        assert_eq!(report.facts, 1);
        let status = report.machine_status.unwrap();
        assert_eq!(status.reason.as_deref(), Some("Motion"));

        let db = scheduler.database().lock().unwrap();
        assert_eq!(db.get_machine_status(1).unwrap().unwrap().reason, status.reason);
    }
}
