//! Raw inputs appended by the acquisition side.

use serde::{Deserialize, Serialize};

use crate::timeline::TimeRange;

/// A period during which a machine stayed in one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub machine_id: i64,
    pub range: TimeRange,
    pub mode_id: i64,
}

/// A program sequence the controller reports as executed automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSequence {
    pub id: i64,
    pub machine_id: i64,
    pub module_id: i64,
    pub range: TimeRange,
    pub sequence: String,
}
