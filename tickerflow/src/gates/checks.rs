//! Concrete gates backed by the validation ledger.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use super::{Gate, GateAction, GateResult, ValidationCheck, ValidationLedger};

/// A gate that requires a passing ledger record for the checked symbol/date.
///
/// A missing record and a failing record map to configurable actions. A
/// ledger that cannot be reached affects every symbol, so it always aborts.
#[derive(Clone)]
pub struct LedgerGate {
    name: String,
    check: ValidationCheck,
    on_missing: GateAction,
    on_failed: GateAction,
    ledger: Arc<dyn ValidationLedger>,
}

impl LedgerGate {
    /// Creates a ledger gate.
    pub fn new(
        name: impl Into<String>,
        check: ValidationCheck,
        ledger: Arc<dyn ValidationLedger>,
    ) -> Self {
        Self {
            name: name.into(),
            check,
            on_missing: GateAction::Skip,
            on_failed: GateAction::Skip,
            ledger,
        }
    }

    /// Sets the action for a missing record.
    #[must_use]
    pub fn on_missing(mut self, action: GateAction) -> Self {
        self.on_missing = action;
        self
    }

    /// Sets the action for a failing record.
    #[must_use]
    pub fn on_failed(mut self, action: GateAction) -> Self {
        self.on_failed = action;
        self
    }

    /// Returns the validation check this gate inspects.
    #[must_use]
    pub const fn validation_check(&self) -> ValidationCheck {
        self.check
    }

    async fn evaluate(&self, symbol: &str, date: NaiveDate, run_id: &str) -> GateResult {
        match self.ledger.lookup(symbol, date, self.check).await {
            Ok(Some(record)) if record.passed => GateResult::pass(),
            Ok(Some(record)) => GateResult::fail(
                format!(
                    "{} check failed for {symbol} on {date}: {}",
                    self.check,
                    record.detail.as_deref().unwrap_or("no detail")
                ),
                self.on_failed,
            ),
            Ok(None) => GateResult::fail(
                format!("no {} record for {symbol} on {date}", self.check),
                self.on_missing,
            ),
            Err(e) => {
                warn!(
                    gate = %self.name,
                    run_id = %run_id,
                    symbol = %symbol,
                    error = %e,
                    "Validation ledger lookup failed"
                );
                GateResult::abort(e.to_string())
            }
        }
    }
}

impl fmt::Debug for LedgerGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerGate")
            .field("name", &self.name)
            .field("check", &self.check)
            .field("on_missing", &self.on_missing)
            .field("on_failed", &self.on_failed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Gate for LedgerGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, symbol: &str, date: NaiveDate, run_id: &str) -> GateResult {
        self.evaluate(symbol, date, run_id).await
    }
}

/// Confirms ingestion persisted fresh bars for the symbol.
///
/// A missing freshness record usually means the upsert raced the provider,
/// so it asks for a retry; a stale record skips the symbol.
#[derive(Debug, Clone)]
pub struct DataIngestionGate(LedgerGate);

impl DataIngestionGate {
    /// Creates the gate over the given ledger.
    pub fn new(ledger: Arc<dyn ValidationLedger>) -> Self {
        Self(
            LedgerGate::new("data_ingestion_gate", ValidationCheck::DataFreshness, ledger)
                .on_missing(GateAction::Retry)
                .on_failed(GateAction::Skip),
        )
    }
}

#[async_trait]
impl Gate for DataIngestionGate {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn check(&self, symbol: &str, date: NaiveDate, run_id: &str) -> GateResult {
        self.0.evaluate(symbol, date, run_id).await
    }
}

/// Confirms indicators were computed and validated for the symbol.
#[derive(Debug, Clone)]
pub struct IndicatorComputationGate(LedgerGate);

impl IndicatorComputationGate {
    /// Creates the gate over the given ledger.
    pub fn new(ledger: Arc<dyn ValidationLedger>) -> Self {
        Self(LedgerGate::new(
            "indicator_computation_gate",
            ValidationCheck::IndicatorValidation,
            ledger,
        ))
    }
}

#[async_trait]
impl Gate for IndicatorComputationGate {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn check(&self, symbol: &str, date: NaiveDate, run_id: &str) -> GateResult {
        self.0.evaluate(symbol, date, run_id).await
    }
}

/// Confirms signal generation ran for the symbol.
#[derive(Debug, Clone)]
pub struct SignalGenerationGate(LedgerGate);

impl SignalGenerationGate {
    /// Creates the gate over the given ledger.
    pub fn new(ledger: Arc<dyn ValidationLedger>) -> Self {
        Self(LedgerGate::new(
            "signal_generation_gate",
            ValidationCheck::SignalGeneration,
            ledger,
        ))
    }
}

#[async_trait]
impl Gate for SignalGenerationGate {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn check(&self, symbol: &str, date: NaiveDate, run_id: &str) -> GateResult {
        self.0.evaluate(symbol, date, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{
        InMemoryValidationLedger, LedgerError, MockValidationLedger, ValidationRecord,
    };

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    #[tokio::test]
    async fn test_ingestion_gate_passes_on_fresh_record() {
        let ledger = Arc::new(InMemoryValidationLedger::new());
        ledger
            .record(ValidationRecord::passed("AAPL", day(), ValidationCheck::DataFreshness))
            .await
            .unwrap();

        let gate = DataIngestionGate::new(ledger);
        assert_eq!(gate.name(), "data_ingestion_gate");
        assert!(gate.check("AAPL", day(), "run-1").await.passed);
    }

    #[tokio::test]
    async fn test_ingestion_gate_retries_on_missing_record() {
        let gate = DataIngestionGate::new(Arc::new(InMemoryValidationLedger::new()));
        let result = gate.check("AAPL", day(), "run-1").await;

        assert!(!result.passed);
        assert_eq!(result.action, GateAction::Retry);
        assert!(result.reason.contains("no data_freshness record"));
    }

    #[tokio::test]
    async fn test_ingestion_gate_skips_on_stale_record() {
        let ledger = Arc::new(InMemoryValidationLedger::new());
        ledger
            .record(ValidationRecord::failed(
                "AAPL",
                day(),
                ValidationCheck::DataFreshness,
                "last bar is 3 days old",
            ))
            .await
            .unwrap();

        let result = DataIngestionGate::new(ledger).check("AAPL", day(), "run-1").await;
        assert_eq!(result.action, GateAction::Skip);
        assert!(result.reason.contains("3 days old"));
    }

    #[tokio::test]
    async fn test_indicator_gate_aborts_when_ledger_unavailable() {
        let mut ledger = MockValidationLedger::new();
        ledger
            .expect_lookup()
            .withf(|symbol, _, check| {
                symbol.to_string() == "AAPL" && *check == ValidationCheck::IndicatorValidation
            })
            .times(1)
            .returning(|_, _, _| Err(LedgerError::Unavailable("connection refused".to_string())));

        let gate = IndicatorComputationGate::new(Arc::new(ledger));
        let result = gate.check("AAPL", day(), "run-1").await;

        assert!(!result.passed);
        assert_eq!(result.action, GateAction::Abort);
        assert!(result.reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_signal_gate_skips_on_missing_record() {
        let mut ledger = MockValidationLedger::new();
        ledger.expect_lookup().returning(|_, _, _| Ok(None));

        let gate = SignalGenerationGate::new(Arc::new(ledger));
        let result = gate.check("MSFT", day(), "run-1").await;
        assert_eq!(result.action, GateAction::Skip);
    }

    #[test]
    fn test_ledger_gate_builder() {
        let gate = LedgerGate::new(
            "custom",
            ValidationCheck::SignalGeneration,
            Arc::new(InMemoryValidationLedger::new()),
        )
        .on_missing(GateAction::Abort);

        assert_eq!(gate.validation_check(), ValidationCheck::SignalGeneration);
        assert!(format!("{gate:?}").contains("Abort"));
    }
}
