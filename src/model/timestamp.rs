//! Lenient timestamp (de)serialization.
//!
//! The orchestration service emits Python `isoformat()` stamps, usually
//! without an offset. Those are read as UTC; everything is written back
//! out as RFC 3339.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serializer};

/// Parse an RFC 3339 stamp, falling back to a naive ISO-8601 stamp in UTC.
pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Utc.from_utc_datetime(&naive)),
    }
}

pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&value.to_rfc3339())
}

pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    parse(&raw).map_err(de::Error::custom)
}

/// Same as the parent module, for optional stamps (`null` stays `None`).
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_some(&t.to_rfc3339()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.filter(|s| !s.is_empty())
            .map(|s| parse(&s).map_err(de::Error::custom))
            .transpose()
    }
}
