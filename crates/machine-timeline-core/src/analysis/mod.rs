//! Per-machine analysis: folding facts into slots, applying modifications
//! and keeping the machine status current.
//!
//! A [`MachineAnalysis`] owns the in-memory timeline of one machine. Every
//! step journals the slot changes it makes; the journal is written to the
//! database (slots, summaries and watermark) inside the caller's
//! transaction and either cleared on commit or reverted on rollback.

mod activity;
mod machine;
mod modification;
mod run_time;

pub use activity::{ActivityBatch, AutoSequenceBatch};
pub use machine::{MachineAnalysis, MachineTimeline, TimelineChanges};
pub use run_time::run_time;

use chrono::Duration;

use crate::accumulator::DayCutoff;
use crate::consolidation::{Consolidator, DefaultReasonExtension, ExtensionRegistry};
use crate::error::ConfigError;
use crate::model::ModeCatalog;
use crate::storage::{AnalysisConfig, Config, ConsolidationConfig};

/// Settings and collaborators shared by every machine worker.
#[derive(Debug)]
pub struct AnalysisContext {
    pub analysis: AnalysisConfig,
    pub consolidation: ConsolidationConfig,
    pub cutoff: DayCutoff,
    pub registry: ExtensionRegistry,
    pub modes: ModeCatalog,
}

impl AnalysisContext {
    /// Build a context with the default-reason extension registered from
    /// the configured rules.
    pub fn new(config: &Config, modes: ModeCatalog) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ExtensionRegistry::new().with(DefaultReasonExtension::new(
            config.consolidation.default_reasons.clone(),
        ));
        Ok(Self {
            analysis: config.analysis.clone(),
            consolidation: config.consolidation.clone(),
            cutoff: config.day_cutoff()?,
            registry,
            modes,
        })
    }

    /// Replace the extension registry.
    pub fn with_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn consolidator(&self) -> Consolidator<'_> {
        Consolidator::new(&self.registry, &self.modes, self.short_period())
    }

    pub fn short_period(&self) -> Duration {
        Duration::seconds(self.consolidation.short_period_secs)
    }

    pub fn max_modification_span(&self) -> Duration {
        Duration::hours(self.analysis.max_modification_span_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_registers_default_reasons() {
        let context = AnalysisContext::new(&Config::default(), ModeCatalog::builtin()).unwrap();
        assert_eq!(context.registry.names(), vec!["default_reason"]);
        assert_eq!(context.short_period(), Duration::seconds(60));
        assert_eq!(context.max_modification_span(), Duration::hours(24));
    }

    #[test]
    fn invalid_cutoff_is_rejected() {
        let mut config = Config::default();
        config.summary.day_cutoff = "25:00".into();
        assert!(AnalysisContext::new(&config, ModeCatalog::builtin()).is_err());
    }
}
