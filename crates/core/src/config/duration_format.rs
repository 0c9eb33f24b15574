//! Duration fields in configuration files, written as `30s`, `5m` or `1h 30m`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim())
        .map_err(|e| format!("invalid duration '{}': {} (expected e.g. 30s, 5m)", s, e))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    humantime::format_duration(*duration)
        .to_string()
        .serialize(serializer)
}
