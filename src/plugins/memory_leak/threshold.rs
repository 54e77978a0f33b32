use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PluginError, Result};

static THRESHOLD_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]*)([A-Z]*)").expect("invalid threshold regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Mb,
    Gb,
    Tb,
}

impl Unit {
    pub fn multiplier(self) -> u64 {
        match self {
            Unit::Mb => 1024 * 1024,
            Unit::Gb => 1024 * 1024 * 1024,
            Unit::Tb => 1024 * 1024 * 1024 * 1024,
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "MB" => Some(Unit::Mb),
            "GB" => Some(Unit::Gb),
            "TB" => Some(Unit::Tb),
            _ => None,
        }
    }
}

/// Private anonymous memory limit per backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub value: u64,
    pub unit: Unit,
    pub bytes: u64,
    /// The configured suffix was not MB/GB/TB and GB was used instead
    pub unit_fallback: bool,
}

impl Threshold {
    /// Parse `<integer><MB|GB|TB>`, case-insensitive.
    ///
    /// An unknown suffix is tolerated: it is logged and GB is assumed. A
    /// missing or overflowing number is an error.
    pub fn parse(raw: &str) -> Result<Self> {
        let upper = raw.trim().to_uppercase();
        let caps = THRESHOLD_REGEX
            .captures(&upper)
            .ok_or_else(|| PluginError::InvalidThreshold(raw.to_string()))?;

        let digits = caps.get(1).map_or("", |m| m.as_str());
        let suffix = caps.get(2).map_or("", |m| m.as_str());

        let value: u64 = digits
            .parse()
            .map_err(|_| PluginError::InvalidThreshold(raw.to_string()))?;

        let (unit, unit_fallback) = match Unit::from_suffix(suffix) {
            Some(unit) => (unit, false),
            None => {
                tracing::warn!(
                    value = raw,
                    "Invalid unit in private_anon_mem_threshold, possible values MB, GB, TB; using GB"
                );
                (Unit::Gb, true)
            }
        };

        let bytes = value
            .checked_mul(unit.multiplier())
            .ok_or_else(|| PluginError::InvalidThreshold(raw.to_string()))?;

        Ok(Self { value, unit, bytes, unit_fallback })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_units() {
        let cases = [
            ("512MB", 512 * 1024 * 1024),
            ("1GB", 1024 * 1024 * 1024),
            ("2TB", 2 * 1024 * 1024 * 1024 * 1024),
            ("3gb", 3 * 1024 * 1024 * 1024),
            (" 7Mb ", 7 * 1024 * 1024),
        ];
        for (raw, bytes) in cases {
            let t = Threshold::parse(raw).unwrap();
            assert_eq!(t.bytes, bytes, "{}", raw);
            assert!(!t.unit_fallback);
        }
    }

    #[test]
    fn unknown_unit_falls_back_to_gb() {
        let t = Threshold::parse("5KB").unwrap();
        assert_eq!(t.unit, Unit::Gb);
        assert_eq!(t.bytes, 5 * 1024 * 1024 * 1024);
        assert!(t.unit_fallback);

        let t = Threshold::parse("2").unwrap();
        assert_eq!(t.bytes, 2 * 1024 * 1024 * 1024);
        assert!(t.unit_fallback);
    }

    #[test]
    fn missing_number_is_rejected() {
        assert!(matches!(Threshold::parse("GB"), Err(PluginError::InvalidThreshold(_))));
        assert!(Threshold::parse("").is_err());
        assert!(Threshold::parse("-1GB").is_err());
    }

    #[test]
    fn overflow_is_rejected() {
        assert!(Threshold::parse("99999999999TB").is_err());
    }
}
