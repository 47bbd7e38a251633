//! Scripted stage functions and gates.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::errors::StageError;
use crate::gates::{Gate, GateResult, ValidationCheck, ValidationLedger, ValidationRecord};
use crate::stages::{StageFn, StageInput};

/// A stage function with per-symbol scripted outcomes.
///
/// Each call pops the next scripted outcome for the symbol; an empty script
/// means success. A permanent failure set with
/// [`ScriptedStage::fail_permanently`] applies to every call.
pub struct ScriptedStage {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<StageError>>>,
    permanent: HashMap<String, StageError>,
    calls: Mutex<HashMap<String, usize>>,
    ledger: Option<(Arc<dyn ValidationLedger>, ValidationCheck)>,
}

impl ScriptedStage {
    /// Creates a stage function that succeeds for every symbol.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            permanent: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            ledger: None,
        }
    }

    /// Fails the first `times` calls for `symbol` with a transient error.
    #[must_use]
    pub fn fail_transiently(mut self, symbol: &str, times: usize) -> Self {
        let script = self.scripts.get_mut().entry(symbol.to_string()).or_default();
        for attempt in 1..=times {
            script.push_back(StageError::transient(format!(
                "connection reset fetching {symbol} (attempt {attempt})"
            )));
        }
        self
    }

    /// Queues one specific error for `symbol`.
    #[must_use]
    pub fn then_fail(mut self, symbol: &str, error: StageError) -> Self {
        self.scripts
            .get_mut()
            .entry(symbol.to_string())
            .or_default()
            .push_back(error);
        self
    }

    /// Fails every call for `symbol` with a permanent error.
    #[must_use]
    pub fn fail_permanently(mut self, symbol: &str, message: &str) -> Self {
        self.permanent
            .insert(symbol.to_string(), StageError::permanent(message));
        self
    }

    /// Writes a passing validation record after every successful call.
    #[must_use]
    pub fn records_to(mut self, ledger: Arc<dyn ValidationLedger>, check: ValidationCheck) -> Self {
        self.ledger = Some((ledger, check));
        self
    }

    /// Returns how often the stage ran for `symbol`.
    #[must_use]
    pub fn calls(&self, symbol: &str) -> usize {
        self.calls.lock().get(symbol).copied().unwrap_or(0)
    }

    /// Returns how often the stage ran in total.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl std::fmt::Debug for ScriptedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedStage")
            .field("name", &self.name)
            .field("permanent", &self.permanent)
            .field("records", &self.ledger.as_ref().map(|(_, check)| *check))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageFn for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &StageInput) -> Result<(), StageError> {
        *self.calls.lock().entry(input.symbol.clone()).or_insert(0) += 1;

        if let Some(err) = self.permanent.get(&input.symbol) {
            return Err(err.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .get_mut(&input.symbol)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        if let Some((ledger, check)) = &self.ledger {
            ledger
                .record(ValidationRecord::passed(&input.symbol, input.check_date, *check))
                .await
                .map_err(|e| StageError::transient(e.to_string()))?;
        }
        Ok(())
    }
}

/// A gate returning fixed per-symbol verdicts.
#[derive(Debug)]
pub struct StaticGate {
    name: String,
    results: HashMap<String, GateResult>,
    default: GateResult,
    calls: Mutex<HashMap<String, usize>>,
}

impl StaticGate {
    /// Creates a gate that passes every symbol.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            results: HashMap::new(),
            default: GateResult::pass(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the verdict for one symbol.
    #[must_use]
    pub fn with_result(mut self, symbol: &str, result: GateResult) -> Self {
        self.results.insert(symbol.to_string(), result);
        self
    }

    /// Sets the verdict for symbols without their own.
    #[must_use]
    pub fn with_default(mut self, result: GateResult) -> Self {
        self.default = result;
        self
    }

    /// Returns how often `symbol` was checked.
    #[must_use]
    pub fn calls(&self, symbol: &str) -> usize {
        self.calls.lock().get(symbol).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Gate for StaticGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, symbol: &str, _date: NaiveDate, _run_id: &str) -> GateResult {
        *self.calls.lock().entry(symbol.to_string()).or_insert(0) += 1;
        self.results
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataFrequency;
    use crate::gates::{GateAction, InMemoryValidationLedger};

    fn input(symbol: &str) -> StageInput {
        StageInput {
            symbol: symbol.to_string(),
            run_id: "run-1".to_string(),
            data_frequency: DataFrequency::Daily,
            force: false,
            check_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_scripted_stage_pops_outcomes() {
        let stage = ScriptedStage::new("ingest")
            .fail_transiently("GOOGL", 2)
            .fail_permanently("BADSYM", "unknown ticker");

        assert!(stage.run(&input("GOOGL")).await.unwrap_err().is_retryable());
        assert!(stage.run(&input("GOOGL")).await.is_err());
        assert!(stage.run(&input("GOOGL")).await.is_ok());

        for _ in 0..3 {
            assert!(!stage.run(&input("BADSYM")).await.unwrap_err().is_retryable());
        }

        assert_eq!(stage.calls("GOOGL"), 3);
        assert_eq!(stage.total_calls(), 6);
    }

    #[tokio::test]
    async fn test_scripted_stage_writes_ledger() {
        let ledger = Arc::new(InMemoryValidationLedger::new());
        let stage = ScriptedStage::new("ingest")
            .then_fail("AAPL", StageError::transient("rate limited"))
            .records_to(ledger.clone(), ValidationCheck::DataFreshness);

        assert!(stage.run(&input("AAPL")).await.is_err());
        assert!(ledger.is_empty());
        stage.run(&input("AAPL")).await.unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_static_gate() {
        let gate = StaticGate::new("g")
            .with_result("AAPL", GateResult::abort("outage"))
            .with_default(GateResult::skip("no data"));
        let day = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();

        assert_eq!(gate.check("AAPL", day, "r").await.action, GateAction::Abort);
        assert_eq!(gate.check("MSFT", day, "r").await.action, GateAction::Skip);
        assert_eq!(gate.calls("AAPL"), 1);
    }
}
