//! Human-readable byte sizes ("700G", "1.5 GiB").
//!
//! Units are binary regardless of spelling: `G`, `GB` and `GiB` all mean
//! 1024^3. This matches how the transfer tool reports progress.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;
pub const PIB: u64 = TIB * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("empty size")]
    Empty,

    #[error("invalid number in size '{0}'")]
    InvalidNumber(String),

    #[error("unknown size unit '{0}'")]
    UnknownUnit(String),
}

/// Parse a size such as `"700G"`, `"1.5 GiB"`, `"128M"` or `"42"` into bytes.
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| SizeParseError::InvalidNumber(input.to_string()))?;
    let multiplier = unit_multiplier(unit.trim())?;

    Ok((value * multiplier as f64).round() as u64)
}

fn unit_multiplier(unit: &str) -> Result<u64, SizeParseError> {
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        "p" | "pb" | "pib" => PIB,
        _ => return Err(SizeParseError::UnknownUnit(unit.to_string())),
    };
    Ok(multiplier)
}

/// Format bytes with a binary unit, two decimals.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 5] = [
        (PIB, "PiB"),
        (TIB, "TiB"),
        (GIB, "GiB"),
        (MIB, "MiB"),
        (KIB, "KiB"),
    ];

    for (scale, name) in UNITS {
        if bytes >= scale {
            return format!("{:.2} {}", bytes as f64 / scale as f64, name);
        }
    }
    format!("{} B", bytes)
}

/// Serde helper accepting either a byte count or a size string.
pub fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(bytes) => Ok(bytes),
        Raw::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!(parse_size("42"), Ok(42));
        assert_eq!(parse_size("0 B"), Ok(0));
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_size("700G"), Ok(700 * GIB));
        assert_eq!(parse_size("750GiB"), Ok(750 * GIB));
        assert_eq!(parse_size("128M"), Ok(128 * MIB));
        assert_eq!(parse_size("1 TB"), Ok(TIB));
        assert_eq!(parse_size("2k"), Ok(2 * KIB));
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_size("1.5 GiB"), Ok(GIB + GIB / 2));
        assert_eq!(parse_size("0.5K"), Ok(512));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_size("   "), Err(SizeParseError::Empty));
        assert!(matches!(
            parse_size("lots"),
            Err(SizeParseError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_size("12 parsecs"),
            Err(SizeParseError::UnknownUnit(_))
        ));
        assert!(matches!(
            parse_size("1.2.3G"),
            Err(SizeParseError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KiB");
        assert_eq!(format_size(700 * GIB), "700.00 GiB");
    }

    #[test]
    fn test_deserialize_size_both_forms() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(deserialize_with = "deserialize_size")]
            size: u64,
        }

        let text: Holder = toml::from_str(r#"size = "1G""#).unwrap();
        assert_eq!(text.size, GIB);

        let number: Holder = toml::from_str("size = 4096").unwrap();
        assert_eq!(number.size, 4096);
    }
}
