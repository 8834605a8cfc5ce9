//! TOML-based configuration.
//!
//! Holds the analysis tuning knobs, the consolidation policy (grace period
//! for short slots, default-reason rules), the summary day cutoff and the
//! log filter.
//!
//! Configuration is stored at `<data_dir>/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::accumulator::DayCutoff;
use crate::consolidation::{default_rules, DefaultReasonRule};
use crate::error::{ConfigError, CoreError, Result};

/// Scheduler and analysis tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Run machines one after another instead of one worker per machine.
    #[serde(default)]
    pub sequential: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_activity_batch_size")]
    pub activity_batch_size: usize,
    #[serde(default = "default_reason_slot_step")]
    pub reason_slot_step: usize,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Longer per-machine modifications are split into day-sized children.
    #[serde(default = "default_max_modification_span_hours")]
    pub max_modification_span_hours: i64,
    #[serde(default = "default_max_sub_modification_depth")]
    pub max_sub_modification_depth: usize,
    #[serde(default = "default_auto_sequence_max_items")]
    pub auto_sequence_max_items: usize,
    /// Period of `analyze watch`.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

/// Reason consolidation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Non-running slots shorter than this are `Short`.
    #[serde(default = "default_short_period_secs")]
    pub short_period_secs: i64,
    /// Score given to manual reasons entered without one.
    #[serde(default = "default_manual_score")]
    pub manual_score: f64,
    #[serde(default = "default_rules")]
    pub default_reasons: Vec<DefaultReasonRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// `HH:MM`; a cutoff after 12:00 starts the day on the previous date.
    #[serde(default = "default_day_cutoff")]
    pub day_cutoff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_max_attempts() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_activity_batch_size() -> usize {
    400
}
fn default_reason_slot_step() -> usize {
    50
}
fn default_max_loops() -> u32 {
    10
}
fn default_max_modification_span_hours() -> i64 {
    24
}
fn default_max_sub_modification_depth() -> usize {
    16
}
fn default_auto_sequence_max_items() -> usize {
    200
}
fn default_interval_secs() -> u64 {
    10
}
fn default_short_period_secs() -> i64 {
    60
}
fn default_manual_score() -> f64 {
    100.0
}
fn default_day_cutoff() -> String {
    "00:00".into()
}
fn default_log_filter() -> String {
    "info".into()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sequential: false,
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            activity_batch_size: default_activity_batch_size(),
            reason_slot_step: default_reason_slot_step(),
            max_loops: default_max_loops(),
            max_modification_span_hours: default_max_modification_span_hours(),
            max_sub_modification_depth: default_max_sub_modification_depth(),
            auto_sequence_max_items: default_auto_sequence_max_items(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            short_period_secs: default_short_period_secs(),
            manual_score: default_manual_score(),
            default_reasons: default_rules(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            day_cutoff: default_day_cutoff(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> std::result::Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };
        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() {
            return Err(ConfigError::MissingKey(key.to_string()));
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current
                    .as_object_mut()
                    .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
                let existing = obj
                    .get(part)
                    .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        let not_a_number = || invalid(format!("cannot parse '{value}' as number"));
                        if let Ok(n) = value.parse::<i64>() {
                            serde_json::Value::Number(n.into())
                        } else if let Ok(n) = value.parse::<f64>() {
                            serde_json::Number::from_f64(n)
                                .map(serde_json::Value::Number)
                                .ok_or_else(not_a_number)?
                        } else {
                            return Err(not_a_number());
                        }
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current
                .get_mut(part)
                .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        }

        Err(ConfigError::MissingKey(key.to_string()))
    }

    pub fn path() -> Result<PathBuf> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the data directory, writing the defaults on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config = toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
            .into()),
        }
    }

    /// Persist to the data directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        self.day_cutoff()?;
        if self.analysis.max_attempts == 0 {
            return Err(invalid("analysis.max_attempts", "must be at least 1"));
        }
        if self.analysis.activity_batch_size == 0 {
            return Err(invalid("analysis.activity_batch_size", "must be at least 1"));
        }
        if self.analysis.reason_slot_step == 0 {
            return Err(invalid("analysis.reason_slot_step", "must be at least 1"));
        }
        if self.analysis.max_modification_span_hours <= 0 {
            return Err(invalid("analysis.max_modification_span_hours", "must be positive"));
        }
        if self.consolidation.short_period_secs < 0 {
            return Err(invalid("consolidation.short_period_secs", "must not be negative"));
        }
        Ok(())
    }

    pub fn day_cutoff(&self) -> std::result::Result<DayCutoff, ConfigError> {
        DayCutoff::parse(&self.summary.day_cutoff)
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key without saving it.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut json = serde_json::to_value(&*self)?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Set a config value by key and save. Returns error if key is unknown.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Every leaf key with its value, in dot-path form.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        fn walk(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
            match value {
                serde_json::Value::Object(map) => {
                    for (key, child) in map {
                        let path = if prefix.is_empty() {
                            key.clone()
                        } else {
                            format!("{prefix}.{key}")
                        };
                        walk(&path, child, out);
                    }
                }
                serde_json::Value::String(s) => out.push((prefix.to_string(), s.clone())),
                other => out.push((prefix.to_string(), other.to_string())),
            }
        }
        let json = serde_json::to_value(self).map_err(CoreError::from)?;
        let mut out = Vec::new();
        walk("", &json, &mut out);
        Ok(out)
    }

    /// Load from disk, returning default on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.analysis.max_attempts, 2);
        assert_eq!(parsed.consolidation.short_period_secs, 60);
        assert_eq!(parsed.consolidation.default_reasons, default_rules());
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.analysis.activity_batch_size, 400);
        assert_eq!(cfg.analysis.reason_slot_step, 50);
        assert_eq!(cfg.analysis.max_modification_span_hours, 24);
        assert_eq!(cfg.summary.day_cutoff, "00:00");
        assert_eq!(cfg.logging.filter, "info");
        assert!(!cfg.analysis.sequential);
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = Config::default();
        assert_eq!(cfg.get("analysis.sequential").as_deref(), Some("false"));
        assert_eq!(cfg.get("summary.day_cutoff").as_deref(), Some("00:00"));
        assert!(cfg.get("analysis.missing_key").is_none());
    }

    #[test]
    fn apply_updates_nested_values() {
        let mut cfg = Config::default();
        cfg.apply("analysis.sequential", "true").unwrap();
        cfg.apply("consolidation.short_period_secs", "90").unwrap();
        cfg.apply("summary.day_cutoff", "22:00").unwrap();
        assert!(cfg.analysis.sequential);
        assert_eq!(cfg.consolidation.short_period_secs, 90);
        assert_eq!(cfg.summary.day_cutoff, "22:00");
    }

    #[test]
    fn apply_rejects_unknown_keys_and_bad_values() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.apply("analysis.nonexistent", "1"),
            Err(CoreError::Config(ConfigError::MissingKey(_)))
        ));
        assert!(cfg.apply("analysis.sequential", "not_a_bool").is_err());
        assert!(cfg.apply("summary.day_cutoff", "26:00").is_err());
        assert_eq!(cfg.summary.day_cutoff, "00:00");
    }

    #[test]
    fn list_flattens_every_section() {
        let keys: Vec<String> = Config::default()
            .list()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert!(keys.contains(&"analysis.max_loops".to_string()));
        assert!(keys.contains(&"logging.filter".to_string()));
    }

    #[test]
    fn load_from_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.analysis.max_attempts, 2);

        let mut changed = cfg.clone();
        changed.apply("analysis.max_loops", "3").unwrap();
        changed.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap().analysis.max_loops, 3);
    }
}
