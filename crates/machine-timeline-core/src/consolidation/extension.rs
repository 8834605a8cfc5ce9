//! Decision extensions and their ordered registry.

use thiserror::Error;

use crate::model::{MachineMode, ProductionState};
use crate::timeline::{ReasonInput, TimeRange};

/// What an extension sees when asked about one reason slot.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub machine_id: i64,
    pub range: &'a TimeRange,
    pub mode: &'a MachineMode,
    pub input: &'a ReasonInput,
    /// Inputs of the slot ending where this one begins.
    pub previous: Option<&'a ReasonInput>,
    /// Inputs of the slot beginning where this one ends.
    pub next: Option<&'a ReasonInput>,
}

impl DecisionContext<'_> {
    pub fn observation_state(&self) -> Option<&str> {
        self.input.observation_state.as_deref()
    }
}

/// A reason proposed by an extension.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub reason: String,
    pub production_state: ProductionState,
    pub score: f64,
    /// The reason was derived automatically from machine data.
    pub auto: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ExtensionError(pub String);

/// Every reason decision extension implements this trait.
/// Extensions are resolved once at start-up and asked in registration order.
pub trait ReasonExtension: Send + Sync {
    /// Unique identifier, used in logs and errors.
    fn name(&self) -> &str;

    /// Propose a reason for the slot, or abstain with `Ok(None)`.
    fn try_propose(&self, ctx: &DecisionContext<'_>) -> Result<Option<Proposal>, ExtensionError>;

    /// Called before a batch of slots is consolidated.
    fn start_batch(&self) {}

    /// Called after a batch of slots is consolidated.
    fn end_batch(&self) {}
}

/// Winning proposal with the extension that made it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub extension: String,
    pub proposal: Proposal,
}

/// Failure of one extension on one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionFailure {
    pub extension: String,
    pub error: ExtensionError,
}

#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn ReasonExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Box<dyn ReasonExtension>) {
        self.extensions.push(extension);
    }

    pub fn with(mut self, extension: impl ReasonExtension + 'static) -> Self {
        self.register(Box::new(extension));
        self
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    pub fn start_batch(&self) {
        for extension in &self.extensions {
            extension.start_batch();
        }
    }

    pub fn end_batch(&self) {
        for extension in &self.extensions {
            extension.end_batch();
        }
    }

    /// Highest-scoring proposal; on equal scores the extension registered
    /// first wins. The first failing extension aborts the decision.
    pub fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Option<Decision>, DecisionFailure> {
        let mut best: Option<Decision> = None;
        for extension in &self.extensions {
            let proposal = extension
                .try_propose(ctx)
                .map_err(|error| DecisionFailure {
                    extension: extension.name().to_string(),
                    error,
                })?;
            let Some(proposal) = proposal else {
                continue;
            };
            let better = best
                .as_ref()
                .map_or(true, |current| proposal.score > current.proposal.score);
            if better {
                best = Some(Decision {
                    extension: extension.name().to_string(),
                    proposal,
                });
            }
        }
        Ok(best)
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("extensions", &self.names())
            .finish()
    }
}
