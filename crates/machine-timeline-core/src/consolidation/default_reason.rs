//! Configuration-driven default reasons.
//!
//! Each rule matches on the mode category, the observation state and the
//! slot duration. Among the matching rules the highest score wins, the first
//! listed one on a tie.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::extension::{DecisionContext, ExtensionError, Proposal, ReasonExtension};
use crate::model::{ModeCategory, ProductionState};

fn default_rule_score() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultReasonRule {
    #[serde(default)]
    pub mode_category: Option<ModeCategory>,
    #[serde(default)]
    pub observation_state: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub production_state: ProductionState,
    #[serde(default = "default_rule_score")]
    pub score: f64,
    /// Inclusive lower bound on the slot duration.
    #[serde(default)]
    pub min_duration_secs: Option<i64>,
    /// Exclusive upper bound on the slot duration. Open slots never match.
    #[serde(default)]
    pub max_duration_secs: Option<i64>,
    /// The reason follows from machine data rather than from a plan.
    #[serde(default)]
    pub auto: bool,
}

impl DefaultReasonRule {
    fn matches(&self, ctx: &DecisionContext<'_>) -> bool {
        if let Some(category) = self.mode_category {
            if ctx.mode.category != category {
                return false;
            }
        }
        if let Some(state) = &self.observation_state {
            if ctx.observation_state() != Some(state.as_str()) {
                return false;
            }
        }
        let duration = ctx.range.duration();
        if let Some(min) = self.min_duration_secs {
            match duration {
                Some(d) if d < Duration::seconds(min) => return false,
                _ => {}
            }
        }
        if let Some(max) = self.max_duration_secs {
            match duration {
                Some(d) if d < Duration::seconds(max) => {}
                _ => return false,
            }
        }
        true
    }

    fn proposal(&self) -> Proposal {
        Proposal {
            reason: self.reason.clone(),
            production_state: self.production_state,
            score: self.score,
            auto: self.auto,
        }
    }
}

/// Rules installed in a fresh configuration.
pub fn default_rules() -> Vec<DefaultReasonRule> {
    let rule = |category, reason: &str, production_state, score, auto| DefaultReasonRule {
        mode_category: Some(category),
        observation_state: None,
        reason: reason.to_string(),
        production_state,
        score,
        min_duration_secs: None,
        max_duration_secs: None,
        auto,
    };
    vec![
        rule(
            ModeCategory::Active,
            "Motion",
            ProductionState::Production,
            10.0,
            true,
        ),
        rule(
            ModeCategory::Error,
            "Alarm",
            ProductionState::NoProduction,
            10.0,
            true,
        ),
        rule(
            ModeCategory::Stopped,
            "Stop",
            ProductionState::NoProduction,
            10.0,
            false,
        ),
        DefaultReasonRule {
            mode_category: None,
            observation_state: Some("Unemployed".to_string()),
            reason: "Unemployed".to_string(),
            production_state: ProductionState::NoProduction,
            score: 20.0,
            min_duration_secs: None,
            max_duration_secs: None,
            auto: false,
        },
    ]
}

/// Proposes the best matching [`DefaultReasonRule`].
#[derive(Debug, Clone)]
pub struct DefaultReasonExtension {
    rules: Vec<DefaultReasonRule>,
}

impl DefaultReasonExtension {
    pub fn new(rules: Vec<DefaultReasonRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[DefaultReasonRule] {
        &self.rules
    }
}

impl ReasonExtension for DefaultReasonExtension {
    fn name(&self) -> &str {
        "default_reason"
    }

    fn try_propose(&self, ctx: &DecisionContext<'_>) -> Result<Option<Proposal>, ExtensionError> {
        let mut best: Option<&DefaultReasonRule> = None;
        for rule in self.rules.iter().filter(|rule| rule.matches(ctx)) {
            if best.map_or(true, |current| rule.score > current.score) {
                best = Some(rule);
            }
        }
        Ok(best.map(DefaultReasonRule::proposal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModeCatalog;
    use crate::timeline::{ReasonInput, TimeRange};
    use chrono::{TimeZone, Utc};

    fn propose(
        extension: &DefaultReasonExtension,
        mode_id: i64,
        observation_state: Option<&str>,
        minutes: i64,
    ) -> Option<Proposal> {
        let begin = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();
        let range = TimeRange::new(begin, begin + Duration::minutes(minutes)).unwrap();
        let mode = ModeCatalog::builtin().get(mode_id);
        let input = ReasonInput {
            mode_id,
            observation_state: observation_state.map(str::to_string),
            shift: None,
            auto_sequence: None,
            manual: None,
        };
        let ctx = DecisionContext {
            machine_id: 1,
            range: &range,
            mode: &mode,
            input: &input,
            previous: None,
            next: None,
        };
        extension.try_propose(&ctx).unwrap()
    }

    #[test]
    fn builtin_rules_follow_the_mode() {
        let extension = DefaultReasonExtension::new(default_rules());
        assert_eq!(propose(&extension, 2, None, 5).unwrap().reason, "Motion");
        assert_eq!(propose(&extension, 4, None, 5).unwrap().reason, "Stop");
        assert_eq!(propose(&extension, 5, None, 5).unwrap().reason, "Alarm");
        assert_eq!(propose(&extension, 1, None, 5), None);
    }

    #[test]
    fn observation_rule_outscores_mode_rule() {
        let extension = DefaultReasonExtension::new(default_rules());
        let proposal = propose(&extension, 4, Some("Unemployed"), 5).unwrap();
        assert_eq!(proposal.reason, "Unemployed");
        assert!(!proposal.auto);
    }

    #[test]
    fn duration_bounds() {
        let extension = DefaultReasonExtension::new(vec![DefaultReasonRule {
            mode_category: Some(ModeCategory::Inactive),
            observation_state: None,
            reason: "Micro-stop".into(),
            production_state: ProductionState::NoProduction,
            score: 10.0,
            min_duration_secs: Some(120),
            max_duration_secs: Some(600),
            auto: true,
        }]);
        assert_eq!(propose(&extension, 1, None, 1), None);
        assert!(propose(&extension, 1, None, 5).is_some());
        assert_eq!(propose(&extension, 1, None, 10), None);
    }
}
