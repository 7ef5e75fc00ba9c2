//! Depth level parsing shared by the venue codecs.
//!
//! Venues send price levels as `[price, size, ...]` arrays whose elements
//! are either JSON numbers or decimal strings.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::frame::ProtocolError;
use crate::domain::order_book::PriceLevel;

/// Parse a decimal from a JSON string or number.
///
/// # Errors
///
/// Returns an error if the value is neither or does not parse.
pub fn parse_decimal(value: &Value) -> Result<Decimal, ProtocolError> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(ProtocolError::InvalidLevel(format!("not a decimal: {other}"))),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ProtocolError::InvalidLevel(format!("not a decimal: {text}")))
}

/// Parse one `[price, size, ...]` level.
///
/// # Errors
///
/// Returns an error if the level is not an array of at least two decimals.
pub fn parse_level(value: &Value) -> Result<PriceLevel, ProtocolError> {
    match value.as_array().map(Vec::as_slice) {
        Some([price, size, ..]) => Ok(PriceLevel::new(parse_decimal(price)?, parse_decimal(size)?)),
        _ => Err(ProtocolError::InvalidLevel(value.to_string())),
    }
}

/// Parse an array of levels. A missing or null field is an empty side.
///
/// # Errors
///
/// Returns an error if the value is not an array or any level is invalid.
pub fn parse_levels(value: Option<&Value>) -> Result<Vec<PriceLevel>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(levels)) => levels.iter().map(parse_level).collect(),
        Some(other) => Err(ProtocolError::InvalidFormat(format!(
            "levels must be an array, got {other}"
        ))),
    }
}

/// Parse an epoch-milliseconds timestamp from a number or numeric string.
#[must_use]
pub fn parse_timestamp_millis(value: Option<&Value>) -> Option<(u64, DateTime<Utc>)> {
    let millis = match value? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let at = DateTime::from_timestamp_millis(i64::try_from(millis).ok()?)?;
    Some((millis, at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_strings_and_numbers() {
        let level = parse_level(&json!(["7000.5", 0.25])).unwrap();
        assert_eq!(level.price, Decimal::from_str("7000.5").unwrap());
        assert_eq!(level.size, Decimal::from_str("0.25").unwrap());
    }

    #[test]
    fn parses_scientific_notation() {
        assert_eq!(
            parse_decimal(&json!("1e-8")).unwrap(),
            Decimal::from_str("0.00000001").unwrap()
        );
    }

    #[test]
    fn extra_fields_are_ignored() {
        assert!(parse_level(&json!(["1", "2", "3", "4"])).is_ok());
    }

    #[test]
    fn rejects_short_or_non_numeric_levels() {
        assert!(matches!(
            parse_level(&json!(["1"])),
            Err(ProtocolError::InvalidLevel(_))
        ));
        assert!(matches!(
            parse_level(&json!(["abc", "1"])),
            Err(ProtocolError::InvalidLevel(_))
        ));
        assert!(matches!(
            parse_levels(Some(&json!({"price": 1}))),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn missing_side_is_empty() {
        assert!(parse_levels(None).unwrap().is_empty());
        assert!(parse_levels(Some(&Value::Null)).unwrap().is_empty());
    }

    #[test]
    fn timestamp_from_number_or_string() {
        let (millis, at) = parse_timestamp_millis(Some(&json!(1_546_300_800_000_u64))).unwrap();
        assert_eq!(millis, 1_546_300_800_000);
        assert_eq!(at.timestamp(), 1_546_300_800);
        assert!(parse_timestamp_millis(Some(&json!("1546300800000"))).is_some());
        assert!(parse_timestamp_millis(Some(&json!(true))).is_none());
    }
}
