//! The fixed-point and timestamp conversion boundary.
//!
//! All monetary amounts cross this boundary at the plugin edge: decimal
//! strings become signed integers in minor units and are never handled as
//! floats. Source timestamps in unix seconds, unix milliseconds or RFC 3339
//! form normalize to a single canonical UTC representation.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use thiserror::Error;

/// Errors from amount or timestamp normalization.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The amount string is not a valid decimal number.
    #[error("unparseable amount {0:?}: {1}")]
    BadAmount(String, String),
    /// The amount does not fit the minor-unit integer range.
    #[error("amount {0:?} overflows minor units at {1} decimals")]
    AmountOverflow(String, u8),
    /// The source timestamp is out of representable range.
    #[error("unrepresentable timestamp: {0}")]
    BadTimestamp(i64),
}

/// Converts a decimal amount string to an integer in minor units, rounding
/// half away from zero: `"12.34"` at 2 decimals becomes `1234`.
pub fn minor_units(amount: &str, decimals: u8) -> Result<i64, UnitError> {
    let parsed: Decimal = amount
        .trim()
        .parse()
        .map_err(|e: rust_decimal::Error| UnitError::BadAmount(amount.into(), e.to_string()))?;
    let scale = Decimal::from(10i64.pow(u32::from(decimals)));
    parsed
        .checked_mul(scale)
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|rounded| rounded.to_i64())
        .ok_or_else(|| UnitError::AmountOverflow(amount.into(), decimals))
}

/// Normalizes a unix-seconds timestamp to UTC.
pub fn timestamp_from_unix_seconds(seconds: i64) -> Result<DateTime<Utc>, UnitError> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or(UnitError::BadTimestamp(seconds))
}

/// Normalizes a unix-milliseconds timestamp to UTC.
pub fn timestamp_from_unix_millis(millis: i64) -> Result<DateTime<Utc>, UnitError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(UnitError::BadTimestamp(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_and_fractional_amounts_scale() {
        assert_eq!(minor_units("12.34", 2).unwrap(), 1234);
        assert_eq!(minor_units("12", 2).unwrap(), 1200);
        assert_eq!(minor_units("0.01", 2).unwrap(), 1);
        assert_eq!(minor_units("1.5", 0).unwrap(), 2);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(minor_units("12.345", 2).unwrap(), 1235);
        assert_eq!(minor_units("-7.005", 2).unwrap(), -701);
        assert_eq!(minor_units("-0.004", 2).unwrap(), 0);
    }

    #[test]
    fn negative_amounts_keep_their_sign() {
        assert_eq!(minor_units("-12.34", 2).unwrap(), -1234);
    }

    #[test]
    fn garbage_amounts_are_rejected() {
        assert!(minor_units("12,34", 2).is_err());
        assert!(minor_units("", 2).is_err());
    }

    #[test]
    fn unix_seconds_and_millis_normalize_to_utc() {
        let from_secs = timestamp_from_unix_seconds(1_725_271_807).unwrap();
        let from_millis = timestamp_from_unix_millis(1_725_271_807_000).unwrap();
        assert_eq!(from_secs, from_millis);
        assert_eq!(from_secs.to_rfc3339(), "2024-09-02T10:10:07+00:00");
    }
}
