use thiserror::Error;

/// Validation errors produced while decoding and checking tick events.
///
/// Every variant is non-retryable: a message that fails validation is routed
/// to the dead-letter table, never reprocessed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is not valid JSON or is missing required fields: {detail}")]
    Undecodable { detail: String },

    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("timestamp out of representable range: {micros} microseconds")]
    TimestampOutOfRange { micros: i64 },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be positive")]
    NonPositiveValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },

    #[error("invalid run status '{value}', expected 'complete' or 'failed'")]
    InvalidRunStatus { value: String },
}
