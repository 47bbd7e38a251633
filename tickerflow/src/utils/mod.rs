//! Utility functions for identifiers, timestamps, digests, and symbols.

mod symbols;

pub use symbols::{normalize_symbols, SymbolError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a fresh workflow run identifier.
#[must_use]
pub fn generate_run_id() -> String {
    generate_uuid().to_string()
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Computes a hex SHA-256 digest of a value's JSON form.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn content_digest<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(hex::encode(hasher.finalize()))
}
