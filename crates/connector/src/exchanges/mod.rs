//! Venue-specific adapters. The mappings mirror each exchange's public
//! kline/candle feeds; see the per-module docs for the frame shapes.

pub mod binance;
pub mod bybit;
pub mod gateio;
pub mod hyperliquid;
pub mod okx;

use crate::error::ParseError;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Read a number that venues serialize as either a JSON number or a
/// decimal string.
pub(crate) fn value_f64(value: &Value, field: &'static str) -> Result<f64, ParseError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or(ParseError::MissingField(field)),
        Value::String(s) => s.parse::<f64>().map_err(|_| ParseError::InvalidValue {
            field,
            value: s.clone(),
        }),
        _ => Err(ParseError::InvalidValue {
            field,
            value: value.to_string(),
        }),
    }
}

pub(crate) fn field_f64(obj: &Value, field: &'static str) -> Result<f64, ParseError> {
    let value = obj.get(field).ok_or(ParseError::MissingField(field))?;
    value_f64(value, field)
}

/// Epoch value that may arrive as number or string, in seconds or
/// milliseconds. Values above 1e12 are treated as milliseconds.
pub(crate) fn value_epoch_ms(value: &Value) -> Option<i64> {
    let numeric = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    if numeric > 1e12 {
        Some(numeric as i64)
    } else {
        Some((numeric * 1000.0) as i64)
    }
}

pub(crate) fn value_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn datetime_from_ms(ms: i64, field: &'static str) -> Result<DateTime<Utc>, ParseError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(ParseError::InvalidValue {
            field,
            value: ms.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_parse_from_both_encodings() {
        assert_eq!(value_f64(&json!("44100.5"), "o").unwrap(), 44100.5);
        assert_eq!(value_f64(&json!(44100.5), "o").unwrap(), 44100.5);
        assert!(value_f64(&json!(null), "o").is_err());
    }

    #[test]
    fn epoch_handles_seconds_and_milliseconds() {
        assert_eq!(value_epoch_ms(&json!(1_700_000_000)).unwrap(), 1_700_000_000_000);
        assert_eq!(value_epoch_ms(&json!(1_700_000_000_000i64)).unwrap(), 1_700_000_000_000);
        assert_eq!(value_epoch_ms(&json!("1700000000")).unwrap(), 1_700_000_000_000);
    }
}
