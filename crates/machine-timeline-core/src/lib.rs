//! # Machine Timeline Core Library
//!
//! This library turns raw machine activity (mode facts, controller
//! auto-sequences) and operator modifications into per-machine timelines
//! of slots, consolidated reasons and day summaries. The `machine-timeline`
//! CLI is a thin layer over the same library.
//!
//! ## Architecture
//!
//! - **Timeline**: half-open ranges and the interval partition holding the
//!   slots of one machine and one kind
//! - **Auto-sequences**: correlation of eligible activity runs with
//!   controller auto-sequences
//! - **Consolidation**: reason decision through ordered extensions, with
//!   `Short` and `Unanswered` fallbacks and manual overrides
//! - **Accumulators**: signed day-bucketed deltas keeping the summaries in
//!   step with the slots
//! - **Scheduler**: modification queues, sub-modification trees and the
//!   per-machine analysis passes
//! - **Storage**: SQLite persistence and TOML configuration
//!
//! ## Key Components
//!
//! - [`Partition`]: ordered, non-overlapping, merged slots
//! - [`Consolidator`]: reason outcome of a slot
//! - [`Scheduler`]: analysis passes over all machines
//! - [`Database`]: persistence of inputs, slots, summaries and queues
//! - [`Config`]: configuration management

pub mod accumulator;
pub mod analysis;
pub mod autosequence;
pub mod consolidation;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod storage;
pub mod timeline;

pub use accumulator::{Accumulator, DayCutoff, Delta, SummaryKey, SummaryRow};
pub use analysis::{AnalysisContext, MachineAnalysis, MachineTimeline};
pub use autosequence::{AutoSequenceMatcher, AutoSequencePeriod, AutoSequenceStep};
pub use consolidation::{
    Consolidator, DefaultReasonExtension, ExtensionRegistry, Proposal, ReasonExtension,
};
pub use error::{
    AnalysisError, ConfigError, CoreError, DatabaseError, ErrorContext, ValidationError,
};
pub use model::{
    AutoSequence, Fact, Machine, MachineMode, MachineStatus, ModeCatalog, Modification,
    ModificationKind, ModificationStatus, NewModification, ReasonSource,
};
pub use scheduler::{MachineReport, MachineRunStatus, PassReport, QueueStop, Scheduler};
pub use storage::{Config, Database};
pub use timeline::{Partition, Slot, SlotChange, SlotKind, TimeRange};
