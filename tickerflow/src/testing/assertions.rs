//! Assertions over workflow results.

use crate::core::{DeadLetterItem, StageId, WorkflowResult};

/// Asserts that the run succeeded.
pub fn assert_workflow_succeeded(result: &WorkflowResult) {
    assert!(
        result.success,
        "Expected run {} to succeed, got error: {:?}",
        result.run_id, result.error
    );
}

/// Asserts that the run failed with the given error kind.
pub fn assert_workflow_failed(result: &WorkflowResult, error_kind: &str) {
    assert!(!result.success, "Expected run {} to fail", result.run_id);
    assert_eq!(
        result.error_kind.as_deref(),
        Some(error_kind),
        "Unexpected error for run {}: {:?}",
        result.run_id,
        result.error
    );
}

/// Asserts the succeeded/failed symbol counts.
pub fn assert_symbol_counts(result: &WorkflowResult, succeeded: usize, failed: usize) {
    assert_eq!(
        (result.symbols_succeeded, result.symbols_failed),
        (succeeded, failed),
        "Unexpected (succeeded, failed) counts for run {}",
        result.run_id
    );
}

/// Asserts exactly one dead-letter item exists for (symbol, stage).
pub fn assert_dead_lettered_once(items: &[DeadLetterItem], symbol: &str, stage: StageId) {
    let count = items
        .iter()
        .filter(|item| item.symbol == symbol && item.stage == stage)
        .count();
    assert_eq!(
        count, 1,
        "Expected one dead-letter item for {symbol}/{stage}, found {count}"
    );
}
