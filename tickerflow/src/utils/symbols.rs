//! Ticker symbol normalization.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

static SYMBOL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\^?[A-Z0-9][A-Z0-9.\-=]{0,14}$").ok());

/// Errors raised while normalizing a requested symbol list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    /// No symbols were requested.
    #[error("No symbols requested")]
    Empty,

    /// One or more symbols do not look like tickers.
    #[error("Invalid symbols: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Trims, upper-cases, and de-duplicates symbols, keeping first-seen order.
///
/// # Errors
///
/// Returns [`SymbolError::Empty`] for an empty list and
/// [`SymbolError::Invalid`] listing every symbol that is not a valid ticker.
pub fn normalize_symbols<S: AsRef<str>>(symbols: &[S]) -> Result<Vec<String>, SymbolError> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(symbols.len());
    let mut invalid = Vec::new();

    for raw in symbols {
        let symbol = raw.as_ref().trim().to_uppercase();
        if !is_valid_symbol(&symbol) {
            invalid.push(raw.as_ref().to_string());
            continue;
        }
        if seen.insert(symbol.clone()) {
            normalized.push(symbol);
        }
    }

    if !invalid.is_empty() {
        return Err(SymbolError::Invalid(invalid));
    }
    if normalized.is_empty() {
        return Err(SymbolError::Empty);
    }
    Ok(normalized)
}

fn is_valid_symbol(symbol: &str) -> bool {
    SYMBOL_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(symbol))
}
