//! Tor certificate verification
//!
//! Certificate parsing and verification for the CERTS cell of the link
//! handshake. Checking is lenient: relay identity is ultimately proven by
//! the ntor handshake, so the channel logs a failed chain and carries on.
//!
//! Reference: tor-spec.txt Section 4.2, cert-spec.txt

use std::time::SystemTime;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::directory::router::unix_seconds;
use crate::error::{Result, TorError};

/// Certificate types as defined in Tor spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    /// Type 1: Link key certificate signed with RSA identity key (legacy)
    RsaLink = 1,
    /// Type 2: RSA1024 Identity certificate (legacy)
    RsaId = 2,
    /// Type 3: RSA1024 AUTHENTICATE cell link certificate (legacy)
    RsaAuth = 3,
    /// Type 4: Ed25519 signing key, signed with Ed25519 identity key
    Ed25519SigningKey = 4,
    /// Type 5: TLS link certificate, signed with Ed25519 signing key
    Ed25519TlsLink = 5,
    /// Type 6: Ed25519 AUTHENTICATE cell key, signed with Ed25519 signing key
    Ed25519AuthKey = 6,
    /// Type 7: Ed25519 identity, signed with RSA identity (cross-cert)
    RsaEd25519CrossCert = 7,
}

impl CertType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(CertType::RsaLink),
            2 => Some(CertType::RsaId),
            3 => Some(CertType::RsaAuth),
            4 => Some(CertType::Ed25519SigningKey),
            5 => Some(CertType::Ed25519TlsLink),
            6 => Some(CertType::Ed25519AuthKey),
            7 => Some(CertType::RsaEd25519CrossCert),
            _ => None,
        }
    }
}

/// Extension carrying the key that signed the certificate
const EXT_SIGNED_WITH_ED25519_KEY: u8 = 0x04;

/// A raw certificate from a CERTS cell
#[derive(Debug, Clone)]
pub struct Certificate {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Parsed Ed25519 certificate (Tor's tor-cert format)
///
/// Format:
/// - VERSION (1 byte): Always 0x01
/// - CERT_TYPE (1 byte): Type of this certificate
/// - EXPIRATION (4 bytes): Unix timestamp / 3600
/// - CERT_KEY_TYPE (1 byte): Type of certified key
/// - CERTIFIED_KEY (32 bytes): The key being certified
/// - N_EXTENSIONS (1 byte): Number of extensions
/// - EXTENSIONS: ExtLen (2) | ExtType (1) | ExtFlags (1) | ExtData
/// - SIGNATURE (64 bytes): Ed25519 signature over all previous bytes
#[derive(Debug, Clone)]
pub struct Ed25519Certificate {
    pub cert_type: u8,
    /// Expiration time (hours since Unix epoch)
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// Key from the signed-with-ed25519-key extension
    pub signing_key: Option<[u8; 32]>,
    raw_data: Vec<u8>,
    signature: [u8; 64],
}

impl Ed25519Certificate {
    /// Parse an Ed25519 certificate from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(TorError::CertificateError(format!(
                "Certificate too short: {} bytes, need at least 104",
                data.len()
            )));
        }

        let version = data[0];
        if version != 0x01 {
            return Err(TorError::CertificateError(format!(
                "Unknown certificate version: {}",
                version
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];

        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut signing_key = None;

        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(TorError::CertificateError("Extension header truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            let body_start = offset + 4;
            if body_start + ext_len > data.len() {
                return Err(TorError::CertificateError("Extension body truncated".into()));
            }
            if ext_type == EXT_SIGNED_WITH_ED25519_KEY && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[body_start..body_start + 32]);
                signing_key = Some(key);
            }
            offset = body_start + ext_len;
        }

        if data.len() != offset + 64 {
            return Err(TorError::CertificateError(format!(
                "Certificate length {} does not end in a signature at offset {}",
                data.len(),
                offset
            )));
        }

        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[offset..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            signing_key,
            raw_data: data[..offset].to_vec(),
            signature,
        })
    }

    /// Verify the certificate signature using the given signing key
    pub fn verify_signature(&self, signing_key: &[u8; 32]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| TorError::CertificateError(format!("Invalid signing key: {}", e)))?;

        let signature = Signature::from_bytes(&self.signature);

        verifying_key
            .verify(&self.raw_data, &signature)
            .map_err(|e| TorError::CertificateError(format!("Signature verification failed: {}", e)))
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        let now_hours = unix_seconds(now) / 3600;
        (self.expiration_hours as u64) < now_hours
    }
}

/// Parsed CERTS cell
#[derive(Debug)]
pub struct CertsCell {
    pub certificates: Vec<Certificate>,
}

impl CertsCell {
    /// Parse a CERTS cell payload
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(TorError::CertificateError("Empty CERTS cell".into()));
        }

        let n_certs = data[0] as usize;
        let mut offset = 1;
        let mut certificates = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > data.len() {
                return Err(TorError::CertificateError(format!(
                    "CERTS cell truncated at certificate {}",
                    i
                )));
            }

            let cert_type = data[offset];
            let cert_len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;

            if offset + cert_len > data.len() {
                return Err(TorError::CertificateError(format!(
                    "Certificate {} data truncated: need {} bytes, have {}",
                    i,
                    cert_len,
                    data.len() - offset
                )));
            }

            certificates.push(Certificate {
                cert_type,
                data: data[offset..offset + cert_len].to_vec(),
            });
            offset += cert_len;
        }

        Ok(Self { certificates })
    }

    pub fn get_cert(&self, cert_type: CertType) -> Option<&Certificate> {
        self.certificates
            .iter()
            .find(|c| c.cert_type == cert_type as u8)
    }

    /// Ed25519 identity claimed by the RSA cross-certificate
    pub fn cross_certified_identity(&self) -> Option<[u8; 32]> {
        let cert = self.get_cert(CertType::RsaEd25519CrossCert)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(cert.data.get(..32)?);
        Some(key)
    }

    /// Check the identity → signing key certificate
    ///
    /// Returns the verified Ed25519 identity and signing key.
    pub fn verify_ed25519_chain(&self, now: SystemTime) -> Result<([u8; 32], [u8; 32])> {
        let raw = self.get_cert(CertType::Ed25519SigningKey).ok_or_else(|| {
            TorError::CertificateError("Missing Ed25519 signing key certificate (type 4)".into())
        })?;
        let cert = Ed25519Certificate::parse(&raw.data)?;
        if cert.is_expired_at(now) {
            return Err(TorError::CertificateError(
                "Signing key certificate is expired".into(),
            ));
        }
        let identity = cert.signing_key.ok_or_else(|| {
            TorError::CertificateError("Signing key certificate names no identity".into())
        })?;
        cert.verify_signature(&identity)?;

        if let Some(claimed) = self.cross_certified_identity() {
            if claimed != identity {
                return Err(TorError::CertificateError(
                    "RSA cross-certificate names a different identity".into(),
                ));
            }
        }
        Ok((identity, cert.certified_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::time::Duration;

    fn signing_cert(identity: &SigningKey, certified: [u8; 32], expiration_hours: u32) -> Vec<u8> {
        let mut data = vec![0x01, CertType::Ed25519SigningKey as u8];
        data.extend_from_slice(&expiration_hours.to_be_bytes());
        data.push(0x01);
        data.extend_from_slice(&certified);
        data.push(1);
        data.extend_from_slice(&32u16.to_be_bytes());
        data.push(EXT_SIGNED_WITH_ED25519_KEY);
        data.push(0);
        data.extend_from_slice(identity.verifying_key().as_bytes());
        let signature = identity.sign(&data);
        data.extend_from_slice(&signature.to_bytes());
        data
    }

    fn certs_payload(certs: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut payload = vec![certs.len() as u8];
        for (cert_type, data) in certs {
            payload.push(*cert_type);
            payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
            payload.extend_from_slice(data);
        }
        payload
    }

    #[test]
    fn test_parse_empty_certs_cell() {
        assert!(CertsCell::parse(&[]).is_err());
        let cell = CertsCell::parse(&[0u8]).unwrap();
        assert_eq!(cell.certificates.len(), 0);
    }

    #[test]
    fn test_cert_type_parsing() {
        assert_eq!(CertType::from_u8(4), Some(CertType::Ed25519SigningKey));
        assert_eq!(CertType::from_u8(7), Some(CertType::RsaEd25519CrossCert));
        assert_eq!(CertType::from_u8(99), None);
    }

    #[test]
    fn test_valid_chain_verifies() {
        let identity = SigningKey::generate(&mut OsRng);
        let now = SystemTime::now();
        let hours = (unix_seconds(now) / 3600) as u32 + 24;
        let cert = signing_cert(&identity, [7u8; 32], hours);

        let mut cross = identity.verifying_key().as_bytes().to_vec();
        cross.extend_from_slice(&[0u8; 8]);
        let cell = CertsCell::parse(&certs_payload(&[(4, cert), (7, cross)])).unwrap();

        let (id, signing) = cell.verify_ed25519_chain(now).unwrap();
        assert_eq!(&id, identity.verifying_key().as_bytes());
        assert_eq!(signing, [7u8; 32]);
    }

    #[test]
    fn test_expired_and_tampered_chains_fail() {
        let identity = SigningKey::generate(&mut OsRng);
        let now = SystemTime::now();
        let hours = (unix_seconds(now) / 3600) as u32;

        let expired = signing_cert(&identity, [7u8; 32], hours - 2);
        let cell = CertsCell::parse(&certs_payload(&[(4, expired)])).unwrap();
        assert!(cell.verify_ed25519_chain(now).is_err());

        let mut tampered = signing_cert(&identity, [7u8; 32], hours + 2);
        tampered[10] ^= 1;
        let cell = CertsCell::parse(&certs_payload(&[(4, tampered)])).unwrap();
        assert!(cell.verify_ed25519_chain(now).is_err());

        let later = now + Duration::from_secs(3 * 3600);
        let ok = signing_cert(&identity, [7u8; 32], hours + 2);
        let cell = CertsCell::parse(&certs_payload(&[(4, ok)])).unwrap();
        assert!(cell.verify_ed25519_chain(later).is_err());
    }

    #[test]
    fn test_truncated_certificate_rejected() {
        let payload = [1u8, 4, 0, 50, 1, 2, 3];
        assert!(CertsCell::parse(&payload).is_err());
    }
}
