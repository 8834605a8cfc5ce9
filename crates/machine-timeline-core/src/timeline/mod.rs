//! Machine timeline primitives.
//!
//! This module provides:
//! - Half-open time ranges with an optionally open end
//! - Slot records and the attributes of each slot kind
//! - The interval partition keeping one machine's slots gap- and overlap-free

mod partition;
mod range;
mod slot;

pub use partition::Partition;
pub use range::{cmp_end, TimeRange};
pub use slot::{
    KindAttributes, ManualReason, ObservationAttrs, OperationAttrs, ReasonAttrs, ReasonInput,
    ReasonOutcome, Slot, SlotAttributes, SlotChange, SlotKind,
};
