//! Testing utilities for tickerflow workflows.
//!
//! This module provides:
//! - Scripted stage functions and static gates
//! - Assertions over workflow results and dead-letter items

mod assertions;
mod mocks;

pub use assertions::{
    assert_dead_lettered_once, assert_symbol_counts, assert_workflow_failed,
    assert_workflow_succeeded,
};
pub use mocks::{ScriptedStage, StaticGate};
