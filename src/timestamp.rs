//! Wall-clock instants as reported by `/health`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

/// UTC instant serialized as RFC 3339 with millisecond precision and a `Z` suffix,
/// e.g. `2024-05-01T12:00:00.000Z`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq)]
pub struct Timestamp(DateTime<Utc>);

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let instant = DateTime::parse_from_rfc3339(&s)
            .map_err(|_| serde::de::Error::custom("timestamp must be an RFC 3339 date-time"))?;
        Ok(Timestamp(instant.with_timezone(&Utc)))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// `None` when `millis` is outside the representable range.
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    pub fn as_secs(&self) -> i64 {
        self.0.timestamp()
    }
}
