//! Decoding of raw stream payloads into validated tick events.
//!
//! The wire shape is `{symbol, price, volume?, event_time}`. Producers that
//! emit full OHLC rows are accepted through the `close` alias for `price`;
//! any other shape divergence is the producer's responsibility to normalize.

use serde::Deserialize;

use crate::domain::{Symbol, TickEvent, UtcDateTime};
use crate::error::ValidationError;

#[derive(Debug, Deserialize)]
struct RawTick {
    symbol: String,
    #[serde(alias = "close")]
    price: f64,
    #[serde(default)]
    volume: Option<i64>,
    event_time: String,
}

/// Decode a raw payload into a validated [`TickEvent`].
///
/// Every failure mode is a typed [`ValidationError`]; callers route these to
/// the dead-letter table and move on.
pub fn decode_tick(payload: &[u8]) -> Result<TickEvent, ValidationError> {
    let raw: RawTick =
        serde_json::from_slice(payload).map_err(|err| ValidationError::Undecodable {
            detail: err.to_string(),
        })?;

    let symbol = Symbol::new(raw.symbol)?;
    let event_time = UtcDateTime::parse(&raw.event_time)?;
    TickEvent::new(symbol, raw.price, raw.volume, event_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_normalized_shape() {
        let tick = decode_tick(
            br#"{"symbol":"AAPL","price":190.5,"volume":120,"event_time":"2026-03-01T10:00:00Z"}"#,
        )
        .expect("valid payload");

        assert_eq!(tick.symbol.as_str(), "AAPL");
        assert_eq!(tick.price, 190.5);
        assert_eq!(tick.volume, 120);
        assert_eq!(tick.event_time.format_rfc3339(), "2026-03-01T10:00:00Z");
    }

    #[test]
    fn decodes_ohlc_producer_variant_via_close() {
        let tick = decode_tick(
            br#"{"symbol":"MSFT","open":299.0,"high":301.0,"low":298.5,"close":300.25,"source":"sim","event_time":"2026-03-01T10:00:00Z"}"#,
        )
        .expect("close alias accepted");
        assert_eq!(tick.price, 300.25);
        assert_eq!(tick.volume, 0);
    }

    #[test]
    fn missing_volume_defaults_to_zero() {
        let tick = decode_tick(
            br#"{"symbol":"AAPL","price":190.5,"event_time":"2026-03-01T10:00:00Z"}"#,
        )
        .expect("valid payload");
        assert_eq!(tick.volume, 0);
    }

    #[test]
    fn rejects_missing_required_field() {
        let err = decode_tick(br#"{"symbol":"AAPL","price":190.5}"#).expect_err("no event_time");
        assert!(matches!(err, ValidationError::Undecodable { .. }));
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let err = decode_tick(b"not json at all").expect_err("garbage");
        assert!(matches!(err, ValidationError::Undecodable { .. }));
    }

    #[test]
    fn rejects_invalid_symbol() {
        let err = decode_tick(
            br#"{"symbol":"AAPL123","price":190.5,"event_time":"2026-03-01T10:00:00Z"}"#,
        )
        .expect_err("digits in symbol");
        assert!(matches!(err, ValidationError::SymbolInvalidChar { .. }));
    }

    #[test]
    fn rejects_non_utc_event_time() {
        let err = decode_tick(
            br#"{"symbol":"AAPL","price":190.5,"event_time":"2026-03-01T11:00:00+01:00"}"#,
        )
        .expect_err("offset timestamp");
        assert!(matches!(err, ValidationError::TimestampNotUtc { .. }));
    }

    #[test]
    fn rejects_negative_volume() {
        let err = decode_tick(
            br#"{"symbol":"AAPL","price":190.5,"volume":-5,"event_time":"2026-03-01T10:00:00Z"}"#,
        )
        .expect_err("negative volume");
        assert!(matches!(err, ValidationError::NegativeValue { field: "volume" }));
    }
}
