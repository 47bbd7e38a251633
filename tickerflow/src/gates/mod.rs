//! Post-stage quality gates.
//!
//! A gate runs after a stage function succeeds for a symbol and decides
//! whether the symbol may proceed. On failure it recommends an action:
//! - `Retry`: run the stage again for the symbol, within the retry ceiling
//! - `Skip`: dead-letter the symbol and continue the run
//! - `Abort`: dead-letter the symbol and abort the stage and the run

mod checks;
mod ledger;

pub use checks::{DataIngestionGate, IndicatorComputationGate, LedgerGate, SignalGenerationGate};
pub use ledger::{
    InMemoryValidationLedger, LedgerError, ValidationCheck, ValidationLedger, ValidationRecord,
};

#[cfg(test)]
pub use ledger::MockValidationLedger;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::GateFailed;

/// Remedial action recommended by a failing gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    /// The stage may be attempted again for this symbol.
    Retry,
    /// The symbol is excluded from downstream stages.
    Skip,
    /// The whole stage, and therefore the run, is aborted.
    Abort,
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Verdict of a gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// Whether the symbol passed.
    pub passed: bool,
    /// Explanation, empty on pass.
    pub reason: String,
    /// Recommended action; ignored when `passed` is true.
    pub action: GateAction,
}

impl GateResult {
    /// A passing verdict.
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
            action: GateAction::Skip,
        }
    }

    /// A failing verdict with the given action.
    #[must_use]
    pub fn fail(reason: impl Into<String>, action: GateAction) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            action,
        }
    }

    /// A failing verdict recommending a retry.
    #[must_use]
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::fail(reason, GateAction::Retry)
    }

    /// A failing verdict recommending a skip.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::fail(reason, GateAction::Skip)
    }

    /// A failing verdict recommending an abort.
    #[must_use]
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::fail(reason, GateAction::Abort)
    }

    /// Converts a failing verdict into a typed error.
    ///
    /// Returns `None` when the verdict passed.
    #[must_use]
    pub fn into_failure(self, gate_name: &str, symbol: &str) -> Option<GateFailed> {
        if self.passed {
            return None;
        }
        Some(GateFailed {
            gate_name: gate_name.to_string(),
            symbol: symbol.to_string(),
            reason: self.reason,
            action: self.action,
        })
    }
}

/// Trait for post-stage quality checks.
#[async_trait]
pub trait Gate: Send + Sync + fmt::Debug {
    /// Returns the gate name recorded in dead-letter context.
    fn name(&self) -> &str;

    /// Checks one symbol for the given date within a run.
    ///
    /// Gates never fail; lookup problems are reported as a verdict.
    async fn check(&self, symbol: &str, date: NaiveDate, run_id: &str) -> GateResult;
}

/// A closure-based gate.
pub struct FnGate<F>
where
    F: Fn(&str, NaiveDate, &str) -> GateResult + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnGate<F>
where
    F: Fn(&str, NaiveDate, &str) -> GateResult + Send + Sync,
{
    /// Creates a new closure-based gate.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnGate<F>
where
    F: Fn(&str, NaiveDate, &str) -> GateResult + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnGate").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Gate for FnGate<F>
where
    F: Fn(&str, NaiveDate, &str) -> GateResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, symbol: &str, date: NaiveDate, run_id: &str) -> GateResult {
        (self.func)(symbol, date, run_id)
    }
}
