//! Validation ledger: the freshness/validation records gates inspect.
//!
//! Stage functions write a record per (symbol, date, check) after they
//! persist their output; gates look the record up to confirm the write.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::utils::{now_utc, Timestamp};

/// The kind of validation a record attests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    /// Raw bars were ingested and are fresh for the date.
    DataFreshness,
    /// Indicators were computed and sane for the date.
    IndicatorValidation,
    /// Signal generation ran for the date.
    SignalGeneration,
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataFreshness => write!(f, "data_freshness"),
            Self::IndicatorValidation => write!(f, "indicator_validation"),
            Self::SignalGeneration => write!(f, "signal_generation"),
        }
    }
}

/// One validation outcome written by a stage function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Validated symbol.
    pub symbol: String,
    /// Trading date the record covers.
    pub date: NaiveDate,
    /// What was validated.
    pub check: ValidationCheck,
    /// Whether validation passed.
    pub passed: bool,
    /// Failure detail.
    pub detail: Option<String>,
    /// When the record was written.
    pub recorded_at: Timestamp,
}

impl ValidationRecord {
    /// Creates a passing record.
    #[must_use]
    pub fn passed(symbol: impl Into<String>, date: NaiveDate, check: ValidationCheck) -> Self {
        Self {
            symbol: symbol.into(),
            date,
            check,
            passed: true,
            detail: None,
            recorded_at: now_utc(),
        }
    }

    /// Creates a failing record.
    #[must_use]
    pub fn failed(
        symbol: impl Into<String>,
        date: NaiveDate,
        check: ValidationCheck,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            date,
            check,
            passed: false,
            detail: Some(detail.into()),
            recorded_at: now_utc(),
        }
    }
}

/// Ledger lookup failure.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The ledger backend cannot be reached.
    #[error("Validation ledger unavailable: {0}")]
    Unavailable(String),
}

/// Storage for validation records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidationLedger: Send + Sync {
    /// Upserts a record keyed by (symbol, date, check).
    async fn record(&self, record: ValidationRecord) -> Result<(), LedgerError>;

    /// Looks up the record for (symbol, date, check).
    async fn lookup(
        &self,
        symbol: &str,
        date: NaiveDate,
        check: ValidationCheck,
    ) -> Result<Option<ValidationRecord>, LedgerError>;
}

/// In-memory validation ledger.
#[derive(Debug, Default)]
pub struct InMemoryValidationLedger {
    records: DashMap<(String, NaiveDate, ValidationCheck), ValidationRecord>,
}

impl InMemoryValidationLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ValidationLedger for InMemoryValidationLedger {
    async fn record(&self, record: ValidationRecord) -> Result<(), LedgerError> {
        let key = (record.symbol.clone(), record.date, record.check);
        self.records.insert(key, record);
        Ok(())
    }

    async fn lookup(
        &self,
        symbol: &str,
        date: NaiveDate,
        check: ValidationCheck,
    ) -> Result<Option<ValidationRecord>, LedgerError> {
        Ok(self
            .records
            .get(&(symbol.to_string(), date, check))
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    #[tokio::test]
    async fn test_record_is_upsert() {
        let ledger = InMemoryValidationLedger::new();
        ledger
            .record(ValidationRecord::failed("AAPL", day(), ValidationCheck::DataFreshness, "stale"))
            .await
            .unwrap();
        ledger
            .record(ValidationRecord::passed("AAPL", day(), ValidationCheck::DataFreshness))
            .await
            .unwrap();

        assert_eq!(ledger.len(), 1);
        let found = ledger
            .lookup("AAPL", day(), ValidationCheck::DataFreshness)
            .await
            .unwrap()
            .unwrap();
        assert!(found.passed);
    }

    #[tokio::test]
    async fn test_lookup_is_keyed_by_check() {
        let ledger = InMemoryValidationLedger::new();
        ledger
            .record(ValidationRecord::passed("AAPL", day(), ValidationCheck::DataFreshness))
            .await
            .unwrap();

        let missing = ledger
            .lookup("AAPL", day(), ValidationCheck::IndicatorValidation)
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
