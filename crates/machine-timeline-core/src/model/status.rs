//! Per-machine current state and reason provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the reason of a slot comes from.
///
/// The facts are independent: a manual reason may be entered on top of a
/// default that was automatic, in which case both `manual` and
/// `default_is_auto` hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReasonSource {
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub default_is_auto: bool,
}

impl ReasonSource {
    pub const DEFAULT: ReasonSource = ReasonSource {
        default: true,
        auto: false,
        manual: false,
        default_is_auto: false,
    };
    pub const AUTO: ReasonSource = ReasonSource {
        default: false,
        auto: true,
        manual: false,
        default_is_auto: false,
    };
    pub const MANUAL: ReasonSource = ReasonSource {
        default: false,
        auto: false,
        manual: true,
        default_is_auto: false,
    };
    pub const DEFAULT_AUTO: ReasonSource = ReasonSource {
        default: true,
        auto: true,
        manual: false,
        default_is_auto: false,
    };
    pub const DEFAULT_IS_AUTO: ReasonSource = ReasonSource {
        default: false,
        auto: false,
        manual: false,
        default_is_auto: true,
    };

    pub fn union(self, other: ReasonSource) -> ReasonSource {
        ReasonSource {
            default: self.default || other.default,
            auto: self.auto || other.auto,
            manual: self.manual || other.manual,
            default_is_auto: self.default_is_auto || other.default_is_auto,
        }
    }

    pub fn contains(self, other: ReasonSource) -> bool {
        self.union(other) == self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionState {
    Production,
    NoProduction,
    Unknown,
}

impl Default for ProductionState {
    fn default() -> Self {
        ProductionState::Unknown
    }
}

/// Tail-end state of a machine, refreshed after each analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub machine_id: i64,
    pub mode_id: Option<i64>,
    pub observation_state: Option<String>,
    pub shift: Option<String>,
    pub machine_state_template: Option<String>,
    pub reason: Option<String>,
    pub reason_source: ReasonSource,
    pub reason_score: f64,
    /// Consecutive slots at the tail whose reason was set automatically.
    pub auto_reason_number: u32,
    pub reason_slot_end: Option<DateTime<Utc>>,
    pub consolidation_limit: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl MachineStatus {
    pub fn empty(machine_id: i64, updated_at: DateTime<Utc>) -> Self {
        Self {
            machine_id,
            mode_id: None,
            observation_state: None,
            shift: None,
            machine_state_template: None,
            reason: None,
            reason_source: ReasonSource::default(),
            reason_score: 0.0,
            auto_reason_number: 0,
            reason_slot_end: None,
            consolidation_limit: None,
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_sources_combine() {
        let combined = ReasonSource::DEFAULT_AUTO.union(ReasonSource::DEFAULT_IS_AUTO);
        assert!(combined.default);
        assert!(combined.auto);
        assert!(combined.default_is_auto);
        assert!(!combined.manual);
        assert!(combined.contains(ReasonSource::DEFAULT));
        assert!(combined.contains(ReasonSource::AUTO));
        assert!(!combined.contains(ReasonSource::MANUAL));
        assert_eq!(
            ReasonSource::DEFAULT.union(ReasonSource::AUTO),
            ReasonSource::DEFAULT_AUTO
        );
    }

    #[test]
    fn reason_source_serializes_as_flags() {
        let json = serde_json::to_string(&ReasonSource::MANUAL).unwrap();
        assert_eq!(
            json,
            r#"{"default":false,"auto":false,"manual":true,"default_is_auto":false}"#
        );
        let parsed: ReasonSource = serde_json::from_str(r#"{"auto":true}"#).unwrap();
        assert_eq!(parsed, ReasonSource::AUTO);
    }
}
