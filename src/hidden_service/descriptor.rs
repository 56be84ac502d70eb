//! Hidden-service descriptors
//!
//! ```text
//! hs-descriptor 1
//! descriptor-id <base32>
//! identity-key <base64 ed25519>
//! service-key <base64 x25519>
//! published YYYY-MM-DD HH:MM:SS
//! introduction-point <fingerprint> <address> <port> <base64 ntor key>
//! signature <base64>
//! ```
//!
//! The signature is made with the identity key over the text up to and
//! including `signature `. The service key is the ntor onion key clients
//! use for the rendezvous handshake.

use std::time::Duration;

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::address::{decode_descriptor_id, encode_descriptor_id, OnionAddress};
use super::protocol::RelayRef;
use crate::directory::document::{decode_base64, format_timestamp, keyword_timestamp, signed_portion};
use crate::error::{Result, TorError};

pub const DESCRIPTOR_VERSION: u32 = 1;

/// Descriptors are republished before this runs out
pub const HS_DESCRIPTOR_LIFETIME: Duration = Duration::from_secs(24 * 3600);

const SIGNATURE_MARKER: &str = "\nsignature ";

/// Tolerated clock difference for `published`
const MAX_CLOCK_SKEW: u64 = 3600;

#[derive(Debug, Clone)]
pub struct HiddenServiceDescriptor {
    pub descriptor_id: [u8; 20],
    pub identity_key: [u8; 32],
    pub service_key: [u8; 32],
    pub published: u64,
    pub introduction_points: Vec<RelayRef>,
    text: String,
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

fn key32(text: &str, what: &str) -> Result<[u8; 32]> {
    decode_base64(text)?
        .as_slice()
        .try_into()
        .map_err(|_| TorError::ParseError(format!("{} is not 32 bytes", what)))
}

impl HiddenServiceDescriptor {
    /// Build and sign a descriptor
    pub fn sign(
        identity: &SigningKey,
        service_key: [u8; 32],
        descriptor_id: [u8; 20],
        published: u64,
        introduction_points: Vec<RelayRef>,
    ) -> Self {
        let identity_key = identity.verifying_key().to_bytes();
        let mut text = format!(
            "hs-descriptor {}\n\
             descriptor-id {}\n\
             identity-key {}\n\
             service-key {}\n\
             published {}\n",
            DESCRIPTOR_VERSION,
            encode_descriptor_id(&descriptor_id),
            b64(&identity_key),
            b64(&service_key),
            format_timestamp(published),
        );
        for intro in &introduction_points {
            text.push_str(&format!(
                "introduction-point {} {} {} {}\n",
                intro.fingerprint,
                intro.address,
                intro.or_port,
                b64(&intro.ntor_onion_key)
            ));
        }
        text.push_str("signature ");
        let signature = identity.sign(text.as_bytes());
        text.push_str(&b64(&signature.to_bytes()));
        text.push('\n');

        Self {
            descriptor_id,
            identity_key,
            service_key,
            published,
            introduction_points,
            text,
        }
    }

    /// Parse a descriptor and check its signature
    pub fn parse(text: &str) -> Result<Self> {
        let bad = |what: String| TorError::ParseError(format!("hidden-service descriptor: {}", what));
        let mut descriptor_id = None;
        let mut identity_key = None;
        let mut service_key = None;
        let mut published = None;
        let mut introduction_points = Vec::new();
        let mut signature = None;

        for line in text.lines() {
            let line = line.trim();
            let (keyword, args) = line.split_once(' ').unwrap_or((line, ""));
            match keyword {
                "hs-descriptor" => {
                    if args.trim() != DESCRIPTOR_VERSION.to_string() {
                        return Err(bad(format!("unsupported version {:?}", args)));
                    }
                }
                "descriptor-id" => descriptor_id = Some(decode_descriptor_id(args)?),
                "identity-key" => identity_key = Some(key32(args, "identity-key")?),
                "service-key" => service_key = Some(key32(args, "service-key")?),
                "published" => published = Some(keyword_timestamp(line)?),
                "introduction-point" => {
                    let parts: Vec<&str> = args.split_whitespace().collect();
                    if parts.len() != 4 {
                        return Err(bad(format!("bad introduction point {:?}", line)));
                    }
                    introduction_points.push(RelayRef {
                        fingerprint: parts[0].parse()?,
                        address: parts[1]
                            .parse()
                            .map_err(|_| bad(format!("bad address {}", parts[1])))?,
                        or_port: parts[2]
                            .parse()
                            .map_err(|_| bad(format!("bad port {}", parts[2])))?,
                        ntor_onion_key: key32(parts[3], "introduction point key")?,
                    });
                }
                "signature" => signature = Some(decode_base64(args)?),
                _ => {}
            }
        }

        let identity_key = identity_key.ok_or_else(|| bad("missing identity-key".into()))?;
        let signature = signature.ok_or_else(|| bad("missing signature".into()))?;
        let signed = signed_portion(text, SIGNATURE_MARKER).ok_or_else(|| bad("no signed portion".into()))?;

        let key = VerifyingKey::from_bytes(&identity_key)
            .map_err(|e| bad(format!("identity-key: {}", e)))?;
        let signature: [u8; 64] = signature
            .as_slice()
            .try_into()
            .map_err(|_| bad("signature is not 64 bytes".into()))?;
        key.verify(signed.as_bytes(), &Signature::from_bytes(&signature))
            .map_err(|_| TorError::CertificateError("bad hidden-service descriptor signature".into()))?;

        Ok(Self {
            descriptor_id: descriptor_id.ok_or_else(|| bad("missing descriptor-id".into()))?,
            identity_key,
            service_key: service_key.ok_or_else(|| bad("missing service-key".into()))?,
            published: published.ok_or_else(|| bad("missing published".into()))?,
            introduction_points,
            text: text.to_string(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn onion_address(&self) -> OnionAddress {
        OnionAddress::from_public_key(
            &VerifyingKey::from_bytes(&self.identity_key).unwrap_or_else(|_| {
                // parse() and sign() only produce valid keys
                unreachable_key()
            }),
        )
    }

    /// Check that this descriptor belongs to `address`, is stored under
    /// one of `expected_ids` and is current at `now`
    pub fn verify_for(&self, address: &OnionAddress, expected_ids: &[[u8; 20]], now: u64) -> Result<()> {
        if &self.identity_key != address.public_key() {
            return Err(TorError::HiddenService(format!(
                "descriptor was signed by another service than {}",
                address
            )));
        }
        if !expected_ids.contains(&self.descriptor_id) {
            return Err(TorError::HiddenService(format!(
                "descriptor id {} is not current for {}",
                encode_descriptor_id(&self.descriptor_id),
                address
            )));
        }
        if self.published > now + MAX_CLOCK_SKEW {
            return Err(TorError::HiddenService("descriptor published in the future".into()));
        }
        if self.published + HS_DESCRIPTOR_LIFETIME.as_secs() <= now {
            return Err(TorError::HiddenService("descriptor expired".into()));
        }
        if self.introduction_points.is_empty() {
            return Err(TorError::HiddenService(format!(
                "{} lists no introduction points",
                address
            )));
        }
        Ok(())
    }
}

fn unreachable_key() -> VerifyingKey {
    VerifyingKey::from(&SigningKey::from_bytes(&[0u8; 32]))
}
