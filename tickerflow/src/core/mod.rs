//! Core domain model types for tickerflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run, stage, and symbol status enums
//! - Typed stage identifiers
//! - Persisted records and caller-facing results

mod records;
mod result;
mod stage_id;
mod status;

pub use records::{
    Checkpoint, CheckpointState, DeadLetterItem, StageRun, SymbolStageState, WorkflowRun,
};
pub use result::WorkflowResult;
pub use stage_id::StageId;
pub use status::{DataFrequency, ParseStatusError, RunKind, RunStatus, SymbolStatus};
