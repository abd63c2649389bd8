//! The opaque resumption token recording sync progress for one
//! (provider, account) pair.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Error returned when a stored cursor cannot be interpreted.
#[derive(Debug, Error)]
#[error("invalid cursor: {0}")]
pub struct CursorParseError(String);

/// The last durably synced position for a pair.
///
/// Semantically a block number for the chain scanner and a UTC timestamp for
/// API-based providers. Stored as TEXT and round-tripped through
/// `Display`/`FromStr` so the persistence layer can treat it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Last fully scanned block number.
    Block(u64),
    /// Timestamp of the last indexed record.
    Timestamp(DateTime<Utc>),
}

impl Cursor {
    /// Returns the block number if this is a block cursor.
    pub fn as_block(&self) -> Option<u64> {
        match self {
            Cursor::Block(number) => Some(*number),
            Cursor::Timestamp(_) => None,
        }
    }

    /// Returns the timestamp if this is a timestamp cursor.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Cursor::Block(_) => None,
            Cursor::Timestamp(ts) => Some(*ts),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Block(number) => write!(f, "{number}"),
            Cursor::Timestamp(ts) => {
                f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        }
    }
}

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            let number =
                s.parse::<u64>().map_err(|e| CursorParseError(format!("{s}: {e}")))?;
            return Ok(Cursor::Block(number));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|ts| Cursor::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|e| CursorParseError(format!("{s}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn block_cursor_round_trips() {
        let cursor = Cursor::Block(10_000);
        assert_eq!(cursor.to_string(), "10000");
        assert_eq!(cursor.to_string().parse::<Cursor>().unwrap(), cursor);
    }

    #[test]
    fn timestamp_cursor_round_trips() {
        let ts = Utc.with_ymd_and_hms(2024, 9, 2, 12, 10, 7).unwrap();
        let cursor = Cursor::Timestamp(ts);
        let parsed = cursor.to_string().parse::<Cursor>().unwrap();
        assert_eq!(parsed, cursor);
        assert_eq!(parsed.as_timestamp(), Some(ts));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("not-a-cursor".parse::<Cursor>().is_err());
        assert!("".parse::<Cursor>().is_err());
    }
}
