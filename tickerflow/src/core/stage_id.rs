//! Typed stage identifiers.

use super::status::ParseStatusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one phase of the market data pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Raw market data ingestion.
    Ingestion,
    /// Technical indicator computation.
    Indicators,
    /// Financial statement ingestion.
    Financials,
    /// Weekly bar aggregation.
    WeeklyAggregation,
    /// Growth metric calculation.
    GrowthMetrics,
    /// Trading signal generation.
    Signals,
}

impl StageId {
    /// Every stage identifier, in the standard pipeline order.
    pub const ALL: [Self; 6] = [
        Self::Ingestion,
        Self::Indicators,
        Self::Financials,
        Self::WeeklyAggregation,
        Self::GrowthMetrics,
        Self::Signals,
    ];

    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Indicators => "indicators",
            Self::Financials => "financials",
            Self::WeeklyAggregation => "weekly_aggregation",
            Self::GrowthMetrics => "growth_metrics",
            Self::Signals => "signals",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                kind: "stage",
                value: s.to_string(),
            })
    }
}
