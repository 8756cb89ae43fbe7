#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);

/// Wall-clock milliseconds since the Unix epoch.
///
/// Every operation receives `now` explicitly; nothing below the adapter reads the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub const MS_PER_SECOND: u64 = 1_000;
    pub const MS_PER_DAY: u64 = 24 * 60 * 60 * 1_000;

    pub fn plus_days(self, days: u32) -> Self {
        Self(self.0.saturating_add(u64::from(days).saturating_mul(Self::MS_PER_DAY)))
    }

    /// Whole seconds from `self` until `later`, or `None` when `later` is not strictly after.
    pub fn seconds_until(self, later: UnixTimeMs) -> Option<u64> {
        if later.0 <= self.0 {
            return None;
        }
        Some((later.0 - self.0) / Self::MS_PER_SECOND)
    }

    pub fn as_seconds(self) -> u64 {
        self.0 / Self::MS_PER_SECOND
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub(crate) fn validate_text(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    Ok(())
}

pub(crate) fn validate_opt_text(
    field: &'static str,
    value: &Option<String>,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if let Some(v) = value {
        validate_text(field, v, max_len)?;
    }
    Ok(())
}

pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

pub fn from_hex(field: &'static str, raw: &str) -> Result<Vec<u8>, ContractViolation> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    if raw.len() % 2 != 0 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "hex must have an even number of digits",
        });
    }
    let nibble = |c: u8| -> Result<u8, ContractViolation> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(ContractViolation::InvalidValue {
                field,
                reason: "must be hex",
            }),
        }
    };
    raw.as_bytes()
        .chunks(2)
        .map(|pair| Ok((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_common_01_hex_roundtrip_and_prefix() {
        let bytes = [0x00, 0xab, 0x7f, 0xff];
        let hex = to_hex(&bytes);
        assert_eq!(hex, "00ab7fff");
        assert_eq!(from_hex("t", &hex).unwrap(), bytes.to_vec());
        assert_eq!(from_hex("t", "0x00AB7FFF").unwrap(), bytes.to_vec());
        assert!(from_hex("t", "abc").is_err());
        assert!(from_hex("t", "zz").is_err());
    }

    #[test]
    fn at_common_02_days_and_seconds_are_exact() {
        let t = UnixTimeMs(1_700_000_000_000);
        assert_eq!(t.plus_days(30).0, 1_700_000_000_000 + 30 * 86_400_000);
        assert_eq!(t.seconds_until(UnixTimeMs(t.0 + 5_999)), Some(5));
        assert_eq!(t.seconds_until(t), None);
        assert_eq!(t.seconds_until(UnixTimeMs(t.0 - 1)), None);
    }
}
