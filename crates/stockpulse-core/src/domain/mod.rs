//! Canonical domain models shared across the pipeline.

mod symbol;
mod timestamp;

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::Serialize;

use crate::error::ValidationError;

pub use symbol::{Symbol, MAX_SYMBOL_LEN};
pub use timestamp::UtcDateTime;

/// A validated in-flight tick event, ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct TickEvent {
    pub symbol: Symbol,
    pub price: f64,
    pub volume: i64,
    pub event_time: UtcDateTime,
}

impl TickEvent {
    /// Build a tick event, enforcing the field invariants: finite positive
    /// price and non-negative volume (missing volume defaults to 0).
    pub fn new(
        symbol: Symbol,
        price: f64,
        volume: Option<i64>,
        event_time: UtcDateTime,
    ) -> Result<Self, ValidationError> {
        if !price.is_finite() {
            return Err(ValidationError::NonFiniteValue { field: "price" });
        }
        if price <= 0.0 {
            return Err(ValidationError::NonPositiveValue { field: "price" });
        }
        let volume = volume.unwrap_or(0);
        if volume < 0 {
            return Err(ValidationError::NegativeValue { field: "volume" });
        }

        Ok(Self {
            symbol,
            price,
            volume,
            event_time,
        })
    }
}

/// A tick as stored in `stock_ticks`.
///
/// `seq` is the store-assigned ingestion sequence. It is the deterministic
/// secondary sort key used to break open/close ties between ticks sharing
/// the same `event_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedTick {
    pub seq: i64,
    pub symbol: String,
    pub price: f64,
    pub volume: i64,
    pub event_time: UtcDateTime,
}

/// A 1-minute OHLCV bar, unique per `(symbol, bucket_start)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    pub symbol: String,
    pub bucket_start: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume_sum: i64,
    pub tick_count: i64,
}

/// Outcome recorded for one aggregation run in the `etl_runs` ledger.
///
/// Only `Complete` rows participate in watermark recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Failed,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(ValidationError::InvalidRunStatus {
                value: other.to_owned(),
            }),
        }
    }
}

/// A rejected stream message preserved in the `failed_events` table.
///
/// Never mutated or replayed automatically; kept for manual inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub source: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Lossy UTF-8 copy of the raw payload bytes.
    pub payload: String,
    pub error: String,
}
