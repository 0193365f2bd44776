use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// A byte count, written either as a plain integer or with a K/M/G suffix ("512M", "1G")
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err("memory size is empty".to_string());
        }

        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);

        if digits.is_empty() {
            return Err(format!("memory size '{}' has no digits", input));
        }

        let value: u64 = digits
            .parse()
            .map_err(|e| format!("invalid memory size '{}': {}", input, e))?;

        let multiplier = match suffix.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" => KB,
            "M" | "MB" => MB,
            "G" | "GB" => GB,
            other => return Err(format!("unknown memory unit '{}' in '{}'", other, input)),
        };

        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| format!("memory size '{}' overflows", input))
    }
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes >= GB && bytes % GB == 0 {
            write!(f, "{}G", bytes / GB)
        } else if bytes >= MB && bytes % MB == 0 {
            write!(f, "{}M", bytes / MB)
        } else if bytes >= KB && bytes % KB == 0 {
            write!(f, "{}K", bytes / KB)
        } else {
            write!(f, "{}", bytes)
        }
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(MemorySize(bytes)),
            Raw::Text(text) => MemorySize::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(MemorySize::parse("1G").unwrap().bytes(), 1073741824);
        assert_eq!(MemorySize::parse("512M").unwrap().bytes(), 536870912);
        assert_eq!(MemorySize::parse("512mb").unwrap().bytes(), 536870912);
        assert_eq!(MemorySize::parse("100K").unwrap().bytes(), 102400);
        assert_eq!(MemorySize::parse("2048").unwrap().bytes(), 2048);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MemorySize::parse("").is_err());
        assert!(MemorySize::parse("G").is_err());
        assert!(MemorySize::parse("12T").is_err());
        assert!(MemorySize::parse("99999999999999999999").is_err());
    }

    #[test]
    fn test_display_uses_largest_exact_unit() {
        assert_eq!(MemorySize::from_bytes(GB).to_string(), "1G");
        assert_eq!(MemorySize::from_bytes(512 * MB).to_string(), "512M");
        assert_eq!(MemorySize::from_bytes(1500).to_string(), "1500");
    }

    #[test]
    fn test_deserialize_integer_or_string() {
        #[derive(Deserialize)]
        struct Holder {
            limit: MemorySize,
        }

        let from_int: Holder = serde_json::from_str(r#"{"limit": 4096}"#).unwrap();
        assert_eq!(from_int.limit.bytes(), 4096);

        let from_str: Holder = serde_json::from_str(r#"{"limit": "1G"}"#).unwrap();
        assert_eq!(from_str.limit.bytes(), GB);
    }
}
