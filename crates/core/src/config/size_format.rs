//! Byte-size fields: a bare number of bytes or a `KB`/`MB`/`GB` suffix (1024-based).

use serde::{Deserialize, Deserializer, Serializer};

pub fn parse_size(s: &str) -> Result<u64, String> {
    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = [("GB", 1u64 << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)]
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|d| (d.trim(), *mult)))
        .unwrap_or((upper.as_str(), 1));

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid size '{}' (expected e.g. 1048576, 512KB, 1MB)", s))
}

pub fn format_size(bytes: u64) -> String {
    match bytes {
        b if b != 0 && b % (1 << 30) == 0 => format!("{}GB", b >> 30),
        b if b != 0 && b % (1 << 20) == 0 => format!("{}MB", b >> 20),
        b if b != 0 && b % (1 << 10) == 0 => format!("{}KB", b >> 10),
        b => b.to_string(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Bytes(u64),
    Text(String),
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeRepr::deserialize(deserializer)? {
        SizeRepr::Bytes(n) => Ok(n),
        SizeRepr::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

pub fn serialize<S>(bytes: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_size(*bytes))
}
