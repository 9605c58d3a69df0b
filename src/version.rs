//! Container version value: `format.major.minor.patch`.
//!
//! The first component names the container format revision the version is
//! written for; the remaining three are the engine version stored in the
//! header. All four live in the fixed-width header fields at bytes 4..20.
//! Because the first component selects a revision, it must be 1 or 2: a
//! string such as `5.1.2.3` is rejected rather than stored as engine 5.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::header::Revision;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("expected four dot-separated components, got {0}")]
    Arity(usize),
    #[error("component {index} ({text:?}) is not a non-negative integer")]
    Component { index: usize, text: String },
    #[error("format revision {0} is not supported (expected 1 or 2)")]
    Revision(u32),
}

/// Four non-negative integers ordered component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PckVersion {
    pub format: u32,
    pub major:  u32,
    pub minor:  u32,
    pub patch:  u32,
}

impl PckVersion {
    pub fn new(format: u32, major: u32, minor: u32, patch: u32) -> Result<Self, VersionError> {
        Revision::check(format).map_err(|_| VersionError::Revision(format))?;
        Ok(Self { format, major, minor, patch })
    }

    /// The four fields in on-disk order.
    pub fn fields(&self) -> [u32; 4] {
        [self.format, self.major, self.minor, self.patch]
    }
}

impl fmt::Display for PckVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.format, self.major, self.minor, self.patch)
    }
}

impl FromStr for PckVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 4 {
            return Err(VersionError::Arity(parts.len()));
        }
        let mut fields = [0u32; 4];
        for (index, text) in parts.iter().enumerate() {
            // u32::from_str accepts a leading '+', which is not a valid component.
            let valid = !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit());
            fields[index] = valid
                .then(|| text.parse::<u32>().ok())
                .flatten()
                .ok_or_else(|| VersionError::Component { index, text: text.to_string() })?;
        }
        Self::new(fields[0], fields[1], fields[2], fields[3])
    }
}

impl Serialize for PckVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PckVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_canonical_form() {
        let v: PckVersion = "2.4.1.0".parse().unwrap();
        assert_eq!(v, PckVersion { format: 2, major: 4, minor: 1, patch: 0 });
        assert_eq!(v.to_string(), "2.4.1.0");
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_eq!("1234".parse::<PckVersion>(), Err(VersionError::Arity(1)));
        assert_eq!("123.33.2.1".parse::<PckVersion>(), Err(VersionError::Revision(123)));
        assert!(matches!("-1.0.2.1".parse::<PckVersion>(), Err(VersionError::Component { index: 0, .. })));
        assert!(matches!("+1.0.2.1".parse::<PckVersion>(), Err(VersionError::Component { index: 0, .. })));
        assert!(matches!("1..2.1".parse::<PckVersion>(), Err(VersionError::Component { index: 1, .. })));
        assert!(matches!("1.0.2.99999999999".parse::<PckVersion>(), Err(VersionError::Component { index: 3, .. })));
        assert_eq!("1.2.3.4.5".parse::<PckVersion>(), Err(VersionError::Arity(5)));
    }

    #[test]
    fn first_component_must_name_a_revision() {
        assert_eq!("5.1.2.3".parse::<PckVersion>(), Err(VersionError::Revision(5)));
        assert_eq!("0.4.2.0".parse::<PckVersion>(), Err(VersionError::Revision(0)));
        assert_eq!(PckVersion::new(5, 1, 2, 3), Err(VersionError::Revision(5)));
        assert_eq!("1.5.1.2".parse::<PckVersion>().unwrap().major, 5);
    }

    #[test]
    fn orders_component_wise() {
        let a: PckVersion = "1.3.9.9".parse().unwrap();
        let b: PckVersion = "1.4.0.0".parse().unwrap();
        let c: PckVersion = "2.0.0.0".parse().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn serializes_as_string() {
        let v: PckVersion = "1.3.5.0".parse().unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"1.3.5.0\"");
        assert_eq!(serde_json::from_str::<PckVersion>(&json).unwrap(), v);
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(format in 1u32..=2, major: u32, minor: u32, patch: u32) {
            let v = PckVersion { format, major, minor, patch };
            prop_assert_eq!(v.to_string().parse::<PckVersion>(), Ok(v));
        }

        #[test]
        fn unsupported_revisions_rejected(format in 3u32.., rest in "[0-9]{1,5}\\.[0-9]{1,5}\\.[0-9]{1,5}") {
            let text = format!("{format}.{rest}");
            prop_assert_eq!(text.parse::<PckVersion>(), Err(VersionError::Revision(format)));
        }
    }
}
