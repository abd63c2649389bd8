//! Where a chain scan starts when a pair has no stored cursor yet.

use std::{fmt, str::FromStr};

use serde::{
    Deserialize, Deserializer,
    de::{self, Visitor},
};

/// The starting block for a first-time scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// A concrete block number.
    Absolute(u64),
    /// A negative offset from the chain head at run start.
    Offset(i64),
    /// The chain head at run start.
    Latest,
}

impl StartPosition {
    /// Resolves the concrete starting block against the chain head.
    pub fn resolve(&self, head: u64) -> u64 {
        match self {
            StartPosition::Absolute(number) => *number,
            StartPosition::Offset(offset) => head.saturating_sub(offset.unsigned_abs()),
            StartPosition::Latest => head,
        }
    }
}

impl Default for StartPosition {
    fn default() -> Self {
        StartPosition::Latest
    }
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(StartPosition::Latest);
        }
        let value: i64 =
            s.parse().map_err(|_| format!("expected a block number, a negative offset or 'latest', got {s:?}"))?;
        if value >= 0 {
            Ok(StartPosition::Absolute(value as u64))
        } else {
            Ok(StartPosition::Offset(value))
        }
    }
}

impl<'de> Deserialize<'de> for StartPosition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StartPositionVisitor;

        impl<'de> Visitor<'de> for StartPositionVisitor {
            type Value = StartPosition;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter
                    .write_str("a positive block number, a negative offset, or the string 'latest'")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value >= 0 {
                    Ok(StartPosition::Absolute(value as u64))
                } else {
                    Ok(StartPosition::Offset(value))
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(StartPosition::Absolute(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse().map_err(|_| {
                    de::Error::invalid_value(de::Unexpected::Str(value), &self)
                })
            }
        }

        deserializer.deserialize_any(StartPositionVisitor)
    }
}
