//! Relay identity digests

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TorError};

/// 20-byte SHA-1 identity digest of a relay
///
/// Ordered lexicographically by raw bytes, which is also the order of
/// the hidden-service directory ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    pub const LEN: usize = 20;

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            TorError::InvalidFingerprint(format!("expected 20 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Fingerprint of a DER-encoded RSA identity key
    pub fn of_key(der: &[u8]) -> Self {
        use sha1::{Digest, Sha1};
        Self(Sha1::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Upper-case hex, 40 characters
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// `$`-prefixed hex as used in family lines
    pub fn to_dollar_hex(&self) -> String {
        format!("${}", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = TorError;

    /// Accepts `$` prefix, spaces and either case
    fn from_str(s: &str) -> Result<Self> {
        let cleaned: String = s
            .trim()
            .trim_start_matches('$')
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if cleaned.len() != 40 {
            return Err(TorError::InvalidFingerprint(s.to_string()));
        }
        let bytes = hex::decode(&cleaned).map_err(|_| TorError::InvalidFingerprint(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "9695DFC35FFEB861329B9F1AB04C46397020CE31";

    #[test]
    fn test_parse_forms() {
        let a: Fingerprint = HEX.parse().unwrap();
        let b: Fingerprint = format!("${}", HEX.to_lowercase()).parse().unwrap();
        let c: Fingerprint = "9695 DFC3 5FFE B861 329B 9F1A B04C 4639 7020 CE31"
            .parse()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.to_string(), HEX);
        assert_eq!(a.to_dollar_hex(), format!("${}", HEX));
    }

    #[test]
    fn test_invalid() {
        assert!("1234".parse::<Fingerprint>().is_err());
        assert!("ZZ95DFC35FFEB861329B9F1AB04C46397020CE31".parse::<Fingerprint>().is_err());
        assert!(Fingerprint::from_slice(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let low = Fingerprint::new([0x00; 20]);
        let mut mid_bytes = [0x00; 20];
        mid_bytes[0] = 0x7f;
        let mid = Fingerprint::new(mid_bytes);
        let high = Fingerprint::new([0xff; 20]);
        assert!(low < mid && mid < high);
    }

    #[test]
    fn test_serde() {
        let fp: Fingerprint = HEX.parse().unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", HEX));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
