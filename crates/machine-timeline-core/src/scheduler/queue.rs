//! Draining one modification queue.
//!
//! Top-level modifications are drawn in `(effective priority desc, id asc)`
//! order. A drawn modification is walked depth-first with an explicit
//! stack: a modification that spawned children stays on the stack until
//! every child is `Done`, then becomes `Done` itself. A modification in
//! `Error` halts the queue until it is retried.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::retry::{is_fatal, retry_transient};
use crate::error::{AnalysisError, ErrorContext, Result};
use crate::model::{
    Modification, ModificationCursor, ModificationQueue, ModificationStatus, NewModification,
};
use crate::storage::Database;

/// Result of applying one modification.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    /// The modification is replaced by these children.
    Spawn(Vec<NewModification>),
}

/// Applies modifications inside the caller's transaction.
pub trait ModificationProcessor {
    /// Apply `modification` and write its effects through `db`.
    fn apply(&mut self, db: &Database, modification: &Modification) -> Result<Outcome>;

    /// The transaction of the last `apply` committed.
    fn commit(&mut self) {}

    /// The transaction of the last `apply` rolled back; undo in-memory
    /// effects.
    fn rollback(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_depth: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(200),
            max_depth: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum QueueStop {
    Drained,
    Halted {
        modification_id: i64,
        error: Option<String>,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    /// Modifications applied, children included.
    pub processed: usize,
    #[serde(flatten)]
    pub stop: QueueStop,
}

/// Where the walk of one tree stopped.
enum Walk {
    Done,
    Halted {
        modification_id: i64,
        error: Option<String>,
    },
    Cancelled,
}

fn queue_context(queue: ModificationQueue) -> ErrorContext {
    match queue {
        ModificationQueue::Global => ErrorContext::machine(0),
        ModificationQueue::Machine(id) => ErrorContext::machine(id),
    }
}

/// Move `id` from `from` to `to` in storage. An illegal transition, or a
/// stored status other than `from`, is an invariant violation.
fn transition(
    db: &Database,
    context: &ErrorContext,
    id: i64,
    from: ModificationStatus,
    to: ModificationStatus,
    error: Option<&str>,
) -> Result<()> {
    let context = context.clone().with_modification(id);
    if !from.can_transition_to(to) {
        return Err(
            AnalysisError::invariant(context, format!("illegal transition {from} -> {to}")).into(),
        );
    }
    if !db.transition_modification(id, from, to, error)? {
        return Err(AnalysisError::invariant(
            context,
            format!("modification left {from} before moving to {to}"),
        )
        .into());
    }
    Ok(())
}

/// Process the modifications of `queue` until none is left, one halts the
/// queue or `cancel` fires.
pub fn drain_queue<P: ModificationProcessor>(
    db: &Mutex<Database>,
    queue: ModificationQueue,
    processor: &mut P,
    settings: &QueueSettings,
    cancel: &CancellationToken,
) -> Result<QueueReport> {
    let mut drain = Drain {
        db,
        context: queue_context(queue),
        processor,
        settings,
        cancel,
        processed: 0,
    };
    let mut cursor = ModificationCursor::start();
    loop {
        if cancel.is_cancelled() {
            return Ok(drain.report(QueueStop::Cancelled));
        }
        let next = drain.storage(|db| Ok(db.next_modification(queue, &cursor)?))?;
        let Some(queued) = next else {
            return Ok(drain.report(QueueStop::Drained));
        };
        cursor.advance(&queued);
        debug!(
            modification_id = queued.modification.id,
            priority = queued.effective_priority,
            "modification drawn"
        );
        match drain.walk(queued.modification)? {
            Walk::Done => {}
            Walk::Halted {
                modification_id,
                error,
            } => {
                return Ok(drain.report(QueueStop::Halted {
                    modification_id,
                    error,
                }))
            }
            Walk::Cancelled => return Ok(drain.report(QueueStop::Cancelled)),
        }
    }
}

struct Drain<'a, P> {
    db: &'a Mutex<Database>,
    context: ErrorContext,
    processor: &'a mut P,
    settings: &'a QueueSettings,
    cancel: &'a CancellationToken,
    processed: usize,
}

impl<P: ModificationProcessor> Drain<'_, P> {
    fn report(&self, stop: QueueStop) -> QueueReport {
        QueueReport {
            processed: self.processed,
            stop,
        }
    }

    /// Run one storage step under the lock, retrying transient failures.
    fn storage<T>(&self, mut step: impl FnMut(&Database) -> Result<T>) -> Result<T> {
        retry_transient(
            self.settings.max_attempts,
            self.settings.backoff,
            &self.context,
            || {
                let db = self.db.lock()?;
                step(&*db)
            },
        )
    }

    fn load(&self, id: i64) -> Result<Modification> {
        self.storage(|db| Ok(db.get_modification(id)?))?
            .ok_or_else(|| {
                AnalysisError::invariant(
                    self.context.clone().with_modification(id),
                    "modification disappeared while being processed",
                )
                .into()
            })
    }

    fn walk(&mut self, root: Modification) -> Result<Walk> {
        let mut stack = vec![root.id];
        let mut on_stack = HashSet::from([root.id]);

        while let Some(&id) = stack.last() {
            if self.cancel.is_cancelled() {
                return Ok(Walk::Cancelled);
            }
            let modification = self.load(id)?;
            match modification.status {
                ModificationStatus::Done => {
                    stack.pop();
                    on_stack.remove(&id);
                }
                ModificationStatus::Error => {
                    return Ok(Walk::Halted {
                        modification_id: id,
                        error: modification.error,
                    })
                }
                ModificationStatus::Pending | ModificationStatus::InProgress => {
                    if let Some(error) = self.process(&modification)? {
                        return Ok(Walk::Halted {
                            modification_id: id,
                            error: Some(error),
                        });
                    }
                }
                ModificationStatus::PendingSubModifications => {
                    let mut waiting = None;
                    for child_id in &modification.children {
                        let child = self.load(*child_id)?;
                        if child.status != ModificationStatus::Done {
                            waiting = Some(child);
                            break;
                        }
                    }
                    match waiting {
                        None => {
                            self.storage(|db| {
                                transition(
                                    db,
                                    &self.context,
                                    id,
                                    ModificationStatus::PendingSubModifications,
                                    ModificationStatus::Done,
                                    None,
                                )
                            })?;
                            debug!(modification_id = id, "all sub-modifications done");
                        }
                        Some(child) if child.status == ModificationStatus::Error => {
                            return Ok(Walk::Halted {
                                modification_id: child.id,
                                error: child.error,
                            })
                        }
                        Some(child) => {
                            let context = self.context.clone().with_modification(child.id);
                            if on_stack.contains(&child.id) {
                                return Err(AnalysisError::invariant(
                                    context,
                                    format!("sub-modification cycle through {id}"),
                                )
                                .into());
                            }
                            if stack.len() >= self.settings.max_depth {
                                return Err(AnalysisError::invariant(
                                    context,
                                    format!(
                                        "sub-modifications nested deeper than {}",
                                        self.settings.max_depth
                                    ),
                                )
                                .into());
                            }
                            stack.push(child.id);
                            on_stack.insert(child.id);
                        }
                    }
                }
            }
        }
        Ok(Walk::Done)
    }

    /// Apply one modification in its own transaction. Returns the message
    /// of a failure that put the modification in `Error`.
    fn process(&mut self, modification: &Modification) -> Result<Option<String>> {
        let id = modification.id;
        if modification.status == ModificationStatus::Pending {
            self.storage(|db| {
                transition(
                    db,
                    &self.context,
                    id,
                    ModificationStatus::Pending,
                    ModificationStatus::InProgress,
                    None,
                )
            })?;
        }

        let db = self.db;
        let queue_context = &self.context;
        let processor = &mut *self.processor;
        let applied = retry_transient(
            self.settings.max_attempts,
            self.settings.backoff,
            &self.context.clone().with_modification(id),
            || {
                let db = db.lock()?;
                let result: Result<()> = db.transaction(|db| {
                    let done = match processor.apply(db, modification)? {
                        Outcome::Done => ModificationStatus::Done,
                        Outcome::Spawn(children) => {
                            let mut ids = Vec::with_capacity(children.len());
                            for child in &children {
                                ids.push(db.insert_modification(child)?);
                            }
                            db.set_modification_children(id, &ids)?;
                            ModificationStatus::PendingSubModifications
                        }
                    };
                    transition(
                        db,
                        queue_context,
                        id,
                        ModificationStatus::InProgress,
                        done,
                        None,
                    )
                });
                match &result {
                    Ok(()) => processor.commit(),
                    Err(_) => processor.rollback(),
                }
                result
            },
        );

        match applied {
            Ok(()) => {
                self.processed += 1;
                Ok(None)
            }
            Err(err) if is_fatal(&err) => Err(err),
            Err(err) => {
                let message = err.to_string();
                error!(modification_id = id, error = %message, "modification failed");
                self.storage(|db| {
                    transition(
                        db,
                        &self.context,
                        id,
                        ModificationStatus::InProgress,
                        ModificationStatus::Error,
                        Some(&message),
                    )
                })?;
                Ok(Some(message))
            }
        }
    }
}
