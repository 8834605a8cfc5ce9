mod config;
pub mod database;
pub mod migrations;
mod modification_db;
mod summary_db;
mod timeline_db;

pub use config::{AnalysisConfig, Config, ConsolidationConfig, LoggingConfig, SummaryConfig};
pub use database::Database;

use std::path::PathBuf;

use crate::error::Result;

/// Returns `$MACHINE_TIMELINE_DIR` when set, otherwise
/// `~/.config/machine-timeline[-dev]/` based on MACHINE_TIMELINE_ENV.
///
/// Set MACHINE_TIMELINE_ENV=dev to use the development data directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os("MACHINE_TIMELINE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");
            let env = std::env::var("MACHINE_TIMELINE_ENV")
                .unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("machine-timeline-dev")
            } else {
                base_dir.join("machine-timeline")
            }
        }
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
