//! Results returned to orchestrator callers.

use serde::{Deserialize, Serialize};

use super::StageId;
use crate::errors::WorkflowError;

/// Outcome of one workflow invocation.
///
/// Callers always receive this structure; internal errors are flattened into
/// `error` and `error_kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Whether every declared stage ran to completion.
    pub success: bool,
    /// The run identifier.
    pub run_id: String,
    /// Error message when the run failed.
    pub error: Option<String>,
    /// Stable error classification when the run failed.
    pub error_kind: Option<String>,
    /// Number of distinct symbols the run worked on.
    pub symbols_processed: usize,
    /// Symbols that completed every executed required stage.
    pub symbols_succeeded: usize,
    /// Symbols that did not.
    pub symbols_failed: usize,
    /// Stages whose stage run completed.
    pub stages_completed: Vec<StageId>,
}

impl WorkflowResult {
    /// Builds a successful result.
    #[must_use]
    pub fn completed(
        run_id: impl Into<String>,
        symbols_processed: usize,
        symbols_succeeded: usize,
        stages_completed: Vec<StageId>,
    ) -> Self {
        Self {
            success: true,
            run_id: run_id.into(),
            error: None,
            error_kind: None,
            symbols_processed,
            symbols_succeeded,
            symbols_failed: symbols_processed.saturating_sub(symbols_succeeded),
            stages_completed,
        }
    }

    /// Builds a failed result from a run-level error.
    #[must_use]
    pub fn failed(
        run_id: impl Into<String>,
        error: &WorkflowError,
        symbols_processed: usize,
        symbols_succeeded: usize,
        stages_completed: Vec<StageId>,
    ) -> Self {
        Self {
            success: false,
            run_id: run_id.into(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            symbols_processed,
            symbols_succeeded,
            symbols_failed: symbols_processed.saturating_sub(symbols_succeeded),
            stages_completed,
        }
    }
}
