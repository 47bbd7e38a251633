//! Workflow definition and execution.
//!
//! This module provides:
//! - Typed stage descriptors and the validated workflow definition
//! - The stateless retry policy
//! - The idempotent per-symbol stage executor
//! - The orchestrator that drives runs end to end

mod descriptor;
mod executor;
mod orchestrator;
mod retry;


pub use descriptor::{
    standard_pipeline, StageDescriptor, StandardStages, WorkflowBuilder, WorkflowDefinition,
};
pub use executor::{RunContext, StageExecutor, StageOutcome};
pub use orchestrator::{Orchestrator, WorkflowRequest};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
