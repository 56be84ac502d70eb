//! Onion addresses and descriptor ids
//!
//! An address is the base32 form of `PUBKEY (32) | CHECKSUM (2) | VERSION (1)`
//! with `CHECKSUM = SHA3-256(".onion checksum" | PUBKEY | VERSION)[..2]`.
//!
//! Descriptors are stored under ids that rotate once per day:
//!
//! ```text
//! permanent-id   = SHA1(PUBKEY)[..10]
//! time-period    = (now + permanent-id[0] * 86400 / 256) / 86400
//! secret-id-part = SHA1(time-period (4) | replica (1))
//! descriptor-id  = SHA1(permanent-id | secret-id-part)
//! ```
//!
//! The per-service offset keeps all services from rotating at the same
//! moment.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use sha1::Sha1;
use sha2::Digest;
use sha3::Sha3_256;

use crate::error::{Result, TorError};

const VERSION: u8 = 3;
const CHECKSUM_CONTEXT: &[u8] = b".onion checksum";
const ENCODED_LEN: usize = 56;
const ONION_SUFFIX: &str = ".onion";

/// Descriptor replicas published per time period
pub const REPLICAS: u8 = 2;

const SECONDS_PER_DAY: u64 = 86_400;

fn base32_alphabet() -> base32::Alphabet {
    base32::Alphabet::Rfc4648 { padding: false }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    public_key: [u8; 32],
}

impl OnionAddress {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self {
            public_key: key.to_bytes(),
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.public_key)
            .map_err(|e| TorError::HiddenService(format!("invalid service key: {}", e)))
    }

    fn checksum(public_key: &[u8; 32]) -> [u8; 2] {
        let mut hasher = Sha3_256::new();
        hasher.update(CHECKSUM_CONTEXT);
        hasher.update(public_key);
        hasher.update([VERSION]);
        let digest = hasher.finalize();
        [digest[0], digest[1]]
    }

    /// Identity the service answers ntor handshakes with
    pub fn service_identity(&self) -> [u8; 20] {
        Sha1::digest(self.public_key).into()
    }

    pub fn permanent_id(&self) -> [u8; 10] {
        let mut id = [0u8; 10];
        id.copy_from_slice(&self.service_identity()[..10]);
        id
    }

    pub fn time_period(&self, now: u64) -> u32 {
        let offset = self.permanent_id()[0] as u64 * SECONDS_PER_DAY / 256;
        ((now + offset) / SECONDS_PER_DAY) as u32
    }

    pub fn descriptor_id(&self, replica: u8, now: u64) -> [u8; 20] {
        let mut secret = Sha1::new();
        secret.update(self.time_period(now).to_be_bytes());
        secret.update([replica]);
        let secret_id_part = secret.finalize();

        let mut id = Sha1::new();
        id.update(self.permanent_id());
        id.update(secret_id_part);
        id.finalize().into()
    }

    /// Ids of every replica for the period containing `now`
    pub fn descriptor_ids(&self, now: u64) -> Vec<[u8; 20]> {
        (0..REPLICAS).map(|r| self.descriptor_id(r, now)).collect()
    }
}

/// Lower-case base32 text form of a descriptor id
pub fn encode_descriptor_id(id: &[u8; 20]) -> String {
    base32::encode(base32_alphabet(), id).to_ascii_lowercase()
}

pub fn decode_descriptor_id(text: &str) -> Result<[u8; 20]> {
    let bytes = base32::decode(base32_alphabet(), &text.trim().to_ascii_uppercase())
        .ok_or_else(|| TorError::ParseError(format!("bad descriptor id {:?}", text)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| TorError::ParseError(format!("descriptor id {:?} is not 20 bytes", text)))
}

/// `host` without its `.onion` suffix, matched in any case
fn strip_onion_suffix(host: &str) -> Option<&str> {
    let split = host.len().checked_sub(ONION_SUFFIX.len())?;
    let suffix = host.get(split..)?;
    if suffix.eq_ignore_ascii_case(ONION_SUFFIX) {
        host.get(..split)
    } else {
        None
    }
}

/// Whether `host` names a hidden service
pub fn is_onion_host(host: &str) -> bool {
    strip_onion_suffix(host.trim().trim_end_matches('.')).is_some()
}

impl FromStr for OnionAddress {
    type Err = TorError;

    /// Accepts the bare 56 characters or a `.onion` host name, any case
    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: &str| TorError::HiddenService(format!("invalid onion address {:?}: {}", s, why));
        let label = s.trim().trim_end_matches('.');
        let label = strip_onion_suffix(label).unwrap_or(label);
        // Subdomains of an onion address name the same service
        let label = label.rsplit('.').next().unwrap_or(label);
        if label.len() != ENCODED_LEN {
            return Err(bad("wrong length"));
        }
        let raw = base32::decode(base32_alphabet(), &label.to_ascii_uppercase())
            .ok_or_else(|| bad("not base32"))?;
        if raw.len() != 35 {
            return Err(bad("wrong decoded length"));
        }
        if raw[34] != VERSION {
            return Err(bad("unsupported version"));
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&raw[..32]);
        if raw[32..34] != Self::checksum(&public_key) {
            return Err(bad("checksum mismatch"));
        }
        Ok(Self { public_key })
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = Vec::with_capacity(35);
        raw.extend_from_slice(&self.public_key);
        raw.extend_from_slice(&Self::checksum(&self.public_key));
        raw.push(VERSION);
        write!(
            f,
            "{}.onion",
            base32::encode(base32_alphabet(), &raw).to_ascii_lowercase()
        )
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn address() -> OnionAddress {
        OnionAddress::from_public_key(&SigningKey::generate(&mut OsRng).verifying_key())
    }

    #[test]
    fn test_text_form() {
        let addr = address();
        let text = addr.to_string();
        assert_eq!(text.len(), ENCODED_LEN + ".onion".len());
        assert!(text.ends_with(".onion"));
        assert_eq!(text.parse::<OnionAddress>().unwrap(), addr);
        assert_eq!(text.to_uppercase().parse::<OnionAddress>().unwrap(), addr);
        assert_eq!(format!("www.{}", text).parse::<OnionAddress>().unwrap(), addr);
    }

    #[test]
    fn test_onion_host_any_case() {
        let text = address().to_string();
        assert!(is_onion_host(&text));
        assert!(is_onion_host(&text.to_uppercase()));
        assert!(is_onion_host("www.Example.OnIoN."));
        assert!(!is_onion_host("example.com"));
        assert!(!is_onion_host("onion"));
        assert!(!is_onion_host("exampleonion"));
        assert!(!is_onion_host("caf\u{e9}.onio"));
    }

    #[test]
    fn test_checksum_detects_typos() {
        let text = address().to_string();
        let mut chars: Vec<char> = text.chars().collect();
        chars[3] = if chars[3] == 'a' { 'b' } else { 'a' };
        let typo: String = chars.into_iter().collect();
        assert!(typo.parse::<OnionAddress>().is_err());
        assert!("short.onion".parse::<OnionAddress>().is_err());
    }

    #[test]
    fn test_descriptor_ids_rotate_daily() {
        let addr = address();
        let now = 1_709_290_800;
        let ids = addr.descriptor_ids(now);
        assert_eq!(ids.len(), REPLICAS as usize);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(addr.descriptor_ids(now), ids);
        assert_ne!(addr.descriptor_ids(now + SECONDS_PER_DAY), ids);
    }

    #[test]
    fn test_descriptor_id_text() {
        let id = [0xa5; 20];
        let text = encode_descriptor_id(&id);
        assert_eq!(text.len(), 32);
        assert_eq!(decode_descriptor_id(&text).unwrap(), id);
        assert!(decode_descriptor_id("zz").is_err());
    }
}
