//! Directory authorities, their key certificates and consensus signatures
//!
//! A consensus is trusted when at least [`MIN_AUTHORITY_SIGNATURES`] known
//! authorities signed it. Each signature is checked with the authority's
//! current signing key, which in turn comes from a key certificate signed
//! by the authority's long-term identity key.
//!
//! Reference: dir-spec.txt Sections 3.1 and 3.4.1

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::document::{keyword_timestamp, read_pem_block, signed_portion};
use super::fingerprint::Fingerprint;
use crate::error::{Result, TorError};

/// Tor directory authority information
#[derive(Debug, Clone)]
pub struct DirectoryAuthority {
    pub name: &'static str,
    /// Hex v3 identity (SHA-1 of the authority's v3 identity key)
    pub v3ident: &'static str,
    /// Hex relay identity fingerprint
    pub fingerprint: &'static str,
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
}

impl DirectoryAuthority {
    pub fn dir_address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.address), self.dir_port)
    }
}

/// Hardcoded directory authorities
///
/// From Tor source code (`src/app/config/auth_dirs.inc`).
pub const DIRECTORY_AUTHORITIES: &[DirectoryAuthority] = &[
    DirectoryAuthority {
        name: "moria1",
        v3ident: "F533C81CEF0BC0267857C99B2F471ADF249FA232",
        fingerprint: "1A25C6358DB91342AA51720A5038B72742732498",
        address: Ipv4Addr::new(128, 31, 0, 39),
        or_port: 9201,
        dir_port: 9231,
    },
    DirectoryAuthority {
        name: "tor26",
        v3ident: "2F3DF9CA0E5D36F2685A2DA67184EB8DCB8CBA8C",
        fingerprint: "FAA4BCA4A6AC0CB4CAD70CA1FA51C2A1B4D2AD10",
        address: Ipv4Addr::new(217, 196, 147, 77),
        or_port: 443,
        dir_port: 80,
    },
    DirectoryAuthority {
        name: "dizum",
        v3ident: "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58",
        fingerprint: "7EA6EAD6FD83083C538F44038BBFA077587DD755",
        address: Ipv4Addr::new(45, 66, 35, 11),
        or_port: 443,
        dir_port: 80,
    },
    DirectoryAuthority {
        name: "gabelmoo",
        v3ident: "ED03BB616EB2F60BEC80151114BB25CEF515B226",
        fingerprint: "F2044413DAC2E02E3D6BCF4735A19BCA1DE97281",
        address: Ipv4Addr::new(131, 188, 40, 189),
        or_port: 443,
        dir_port: 80,
    },
    DirectoryAuthority {
        name: "dannenberg",
        v3ident: "0232AF901C31A04EE9848595AF9BB7620D4C5B2E",
        fingerprint: "7BE683E65D48141321C5ED92F075C55364AC7123",
        address: Ipv4Addr::new(193, 23, 244, 244),
        or_port: 443,
        dir_port: 80,
    },
    DirectoryAuthority {
        name: "maatuska",
        v3ident: "49015F787433103580E3B66A1707A00E60F2D15B",
        fingerprint: "BD6A829255CB08E66FBE7D3748363586E46B3810",
        address: Ipv4Addr::new(171, 25, 193, 9),
        or_port: 80,
        dir_port: 443,
    },
    DirectoryAuthority {
        name: "longclaw",
        v3ident: "23D15D965BC35114467363C165C4F724B64B4F66",
        fingerprint: "74A910646BCEEFBCD2E874FC1DC997430F968145",
        address: Ipv4Addr::new(199, 58, 81, 140),
        or_port: 443,
        dir_port: 80,
    },
    DirectoryAuthority {
        name: "bastet",
        v3ident: "27102BC123E7AF1D4741AE047E160C91ADC76B21",
        fingerprint: "24E2F139121D4394C54B5BCC368B3B411857C413",
        address: Ipv4Addr::new(204, 13, 164, 118),
        or_port: 443,
        dir_port: 80,
    },
    DirectoryAuthority {
        name: "faravahar",
        v3ident: "70849B868D606BAECFB6128C5E3D782029AA394F",
        fingerprint: "E3E42D35F801C9D5AB23584E0025D56FE2B33396",
        address: Ipv4Addr::new(216, 218, 219, 41),
        or_port: 443,
        dir_port: 80,
    },
];

/// Minimum number of directory authority signatures required
pub const MIN_AUTHORITY_SIGNATURES: usize = 5;

/// Look up a hardcoded authority by v3 identity
pub fn authority_by_v3ident(v3ident: &Fingerprint) -> Option<&'static DirectoryAuthority> {
    let hex = v3ident.to_hex();
    DIRECTORY_AUTHORITIES.iter().find(|a| a.v3ident == hex)
}

/// A parsed `directory-signature` block
#[derive(Debug, Clone)]
pub struct DirectorySignature {
    /// "sha1" or "sha256"
    pub algorithm: String,
    /// v3 identity of the signing authority
    pub identity: Fingerprint,
    pub signing_key_digest: Fingerprint,
    pub signature: Vec<u8>,
}

/// Parse every signature block from a consensus document
///
/// Malformed blocks are skipped.
pub fn parse_signatures(text: &str) -> Vec<DirectorySignature> {
    let mut signatures = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let line = line.trim();
        if !line.starts_with("directory-signature ") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        // Format: directory-signature [algorithm] identity signing-key-digest
        let (algorithm, identity, digest) = match parts.len() {
            3 => ("sha1", parts[1], parts[2]),
            n if n >= 4 => (parts[1], parts[2], parts[3]),
            _ => continue,
        };
        let signature = match read_pem_block(&mut lines) {
            Ok(sig) => sig,
            Err(e) => {
                log::debug!("Skipping malformed signature block: {}", e);
                continue;
            }
        };
        match (identity.parse(), digest.parse()) {
            (Ok(identity), Ok(signing_key_digest)) => signatures.push(DirectorySignature {
                algorithm: algorithm.to_string(),
                identity,
                signing_key_digest,
                signature,
            }),
            _ => log::debug!("Skipping signature with bad identity {}", identity),
        }
    }

    signatures
}

/// One authority's signing key, certified by its identity key
#[derive(Debug, Clone)]
pub struct AuthorityKeyCertificate {
    /// v3 identity
    pub fingerprint: Fingerprint,
    pub published: u64,
    pub expires: u64,
    pub signing_key: RsaPublicKey,
    /// SHA-1 of the DER signing key
    pub signing_key_digest: Fingerprint,
}

impl AuthorityKeyCertificate {
    /// Parse and verify one `dir-key-certificate-version 3` document
    pub fn parse(text: &str) -> Result<Self> {
        let mut fingerprint = None;
        let mut published = None;
        let mut expires = None;
        let mut identity_der = None;
        let mut signing_der = None;
        let mut certification = None;

        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let line = line.trim();
            let keyword = line.split_whitespace().next().unwrap_or("");
            match keyword {
                "fingerprint" => {
                    fingerprint = line
                        .split_whitespace()
                        .nth(1)
                        .map(str::parse::<Fingerprint>)
                        .transpose()?;
                }
                "dir-key-published" => published = Some(keyword_timestamp(line)?),
                "dir-key-expires" => expires = Some(keyword_timestamp(line)?),
                "dir-identity-key" => identity_der = Some(read_pem_block(&mut lines)?),
                "dir-signing-key" => signing_der = Some(read_pem_block(&mut lines)?),
                "dir-key-crosscert" => {
                    read_pem_block(&mut lines)?;
                }
                "dir-key-certification" => {
                    certification = Some(read_pem_block(&mut lines)?);
                    break;
                }
                _ => {}
            }
        }

        let missing = |what: &str| TorError::CertificateError(format!("missing {}", what));
        let fingerprint: Fingerprint = fingerprint.ok_or_else(|| missing("fingerprint"))?;
        let identity_der = identity_der.ok_or_else(|| missing("dir-identity-key"))?;
        let signing_der = signing_der.ok_or_else(|| missing("dir-signing-key"))?;
        let certification = certification.ok_or_else(|| missing("dir-key-certification"))?;

        if Fingerprint::of_key(&identity_der) != fingerprint {
            return Err(TorError::CertificateError(format!(
                "identity key does not match fingerprint {}",
                fingerprint
            )));
        }

        let identity_key = RsaPublicKey::from_pkcs1_der(&identity_der)
            .map_err(|e| TorError::CertificateError(format!("identity key: {}", e)))?;
        let signing_key = RsaPublicKey::from_pkcs1_der(&signing_der)
            .map_err(|e| TorError::CertificateError(format!("signing key: {}", e)))?;

        let signed = signed_portion(text, "\ndir-key-certification\n")
            .ok_or_else(|| missing("signed portion"))?;
        let digest = Sha1::digest(signed.trim_start().as_bytes());
        identity_key
            .verify(Pkcs1v15Sign::new_unprefixed(), &digest, &certification)
            .map_err(|_| {
                TorError::CertificateError(format!("bad certification for {}", fingerprint))
            })?;

        Ok(Self {
            fingerprint,
            published: published.ok_or_else(|| missing("dir-key-published"))?,
            expires: expires.ok_or_else(|| missing("dir-key-expires"))?,
            signing_key,
            signing_key_digest: Fingerprint::of_key(&signing_der),
        })
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        self.published <= now && now < self.expires
    }
}

/// Certificates of the known authorities, by v3 identity
#[derive(Debug, Clone, Default)]
pub struct AuthorityKeyCertificates {
    certs: HashMap<Fingerprint, AuthorityKeyCertificate>,
}

impl AuthorityKeyCertificates {
    /// Parse a concatenation of certificates (`/tor/keys/all`)
    ///
    /// Certificates that fail to parse or verify, or that belong to an
    /// unknown authority, are logged and skipped.
    pub fn parse(text: &str) -> Self {
        let mut certs = HashMap::new();
        let starts: Vec<usize> = text
            .match_indices("dir-key-certificate-version")
            .map(|(i, _)| i)
            .collect();

        for (n, start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(text.len());
            match AuthorityKeyCertificate::parse(&text[*start..end]) {
                Ok(cert) if authority_by_v3ident(&cert.fingerprint).is_some() => {
                    // Keep the most recently published cert per authority
                    let newer = certs
                        .get(&cert.fingerprint)
                        .map_or(true, |old: &AuthorityKeyCertificate| old.published < cert.published);
                    if newer {
                        certs.insert(cert.fingerprint, cert);
                    }
                }
                Ok(cert) => log::debug!("Ignoring certificate of unknown authority {}", cert.fingerprint),
                Err(e) => log::warn!("Skipping authority key certificate: {}", e),
            }
        }

        log::debug!("Parsed {} authority key certificates", certs.len());
        Self { certs }
    }

    pub fn from_certificates(certs: impl IntoIterator<Item = AuthorityKeyCertificate>) -> Self {
        Self {
            certs: certs.into_iter().map(|c| (c.fingerprint, c)).collect(),
        }
    }

    pub fn get(&self, v3ident: &Fingerprint) -> Option<&AuthorityKeyCertificate> {
        self.certs.get(v3ident)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Whether enough certificates remain valid until `min_valid_until`
    pub fn is_valid(&self, now: u64, min_valid_until: u64) -> bool {
        self.certs
            .values()
            .filter(|c| c.is_valid_at(now) && c.expires >= min_valid_until)
            .count()
            >= MIN_AUTHORITY_SIGNATURES
    }
}

/// Check the signatures of a consensus document
///
/// Returns the number of known authorities with a valid signature, or
/// an error if fewer than [`MIN_AUTHORITY_SIGNATURES`] verified.
pub fn verify_consensus_signatures(
    text: &str,
    signatures: &[DirectorySignature],
    certs: &AuthorityKeyCertificates,
    now: u64,
) -> Result<usize> {
    let signed = signed_portion(text, "\ndirectory-signature ").ok_or_else(|| {
        TorError::ConsensusError("no directory-signature found".into())
    })?;
    let sha1_digest = Sha1::digest(signed.as_bytes()).to_vec();
    let sha256_digest = Sha256::digest(signed.as_bytes()).to_vec();

    let mut verified: Vec<&str> = Vec::new();
    for sig in signatures {
        let authority = match authority_by_v3ident(&sig.identity) {
            Some(a) => a,
            None => {
                log::debug!("Unknown signer {}", sig.identity);
                continue;
            }
        };
        if verified.contains(&authority.name) {
            continue;
        }
        let cert = match certs.get(&sig.identity) {
            Some(c) if c.signing_key_digest == sig.signing_key_digest && c.is_valid_at(now) => c,
            _ => {
                log::debug!("No usable key certificate for {}", authority.name);
                continue;
            }
        };
        let digest = match sig.algorithm.as_str() {
            "sha256" => &sha256_digest,
            _ => &sha1_digest,
        };
        match cert
            .signing_key
            .verify(Pkcs1v15Sign::new_unprefixed(), digest, &sig.signature)
        {
            Ok(()) => verified.push(authority.name),
            Err(_) => log::warn!("Invalid consensus signature from {}", authority.name),
        }
    }

    log::debug!(
        "Authority signatures: {}/{} ({:?})",
        verified.len(),
        MIN_AUTHORITY_SIGNATURES,
        verified
    );

    if verified.len() >= MIN_AUTHORITY_SIGNATURES {
        Ok(verified.len())
    } else {
        Err(TorError::ConsensusError(format!(
            "insufficient authority signatures: got {}, need {}",
            verified.len(),
            MIN_AUTHORITY_SIGNATURES
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorities_are_well_formed() {
        for auth in DIRECTORY_AUTHORITIES {
            assert!(auth.v3ident.parse::<Fingerprint>().is_ok(), "{}", auth.name);
            assert!(auth.fingerprint.parse::<Fingerprint>().is_ok(), "{}", auth.name);
            assert!(auth.dir_port != 0);
        }
        assert!(DIRECTORY_AUTHORITIES.len() >= MIN_AUTHORITY_SIGNATURES);
    }

    #[test]
    fn test_parse_signatures() {
        let doc = format!(
            "network-status-version 3\n\
             directory-footer\n\
             directory-signature sha256 {} {}\n\
             -----BEGIN SIGNATURE-----\n\
             AAECAwQ=\n\
             -----END SIGNATURE-----\n\
             directory-signature {} {}\n\
             -----BEGIN SIGNATURE-----\n\
             BQYH\n\
             -----END SIGNATURE-----\n",
            DIRECTORY_AUTHORITIES[0].v3ident,
            "0000000000000000000000000000000000000001",
            DIRECTORY_AUTHORITIES[1].v3ident,
            "0000000000000000000000000000000000000002",
        );
        let sigs = parse_signatures(&doc);
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].algorithm, "sha256");
        assert_eq!(sigs[0].signature, vec![0, 1, 2, 3, 4]);
        assert_eq!(sigs[1].algorithm, "sha1");
        assert_eq!(sigs[1].signature, vec![5, 6, 7]);
    }

    #[test]
    fn test_unsigned_consensus_rejected() {
        let certs = AuthorityKeyCertificates::default();
        let result = verify_consensus_signatures("network-status-version 3\n", &[], &certs, 0);
        assert!(matches!(result, Err(TorError::ConsensusError(_))));
    }

    #[test]
    fn test_signatures_without_certs_rejected() {
        let doc = "network-status-version 3\ndirectory-signature sha256 A B\n";
        let sigs: Vec<DirectorySignature> = DIRECTORY_AUTHORITIES
            .iter()
            .map(|a| DirectorySignature {
                algorithm: "sha256".into(),
                identity: a.v3ident.parse().unwrap(),
                signing_key_digest: Fingerprint::new([0; 20]),
                signature: vec![1; 256],
            })
            .collect();
        let certs = AuthorityKeyCertificates::default();
        assert!(verify_consensus_signatures(doc, &sigs, &certs, 0).is_err());
    }

    #[test]
    fn test_garbage_certificates_skipped() {
        let certs = AuthorityKeyCertificates::parse(
            "dir-key-certificate-version 3\nfingerprint nothex\n\
             dir-key-certificate-version 3\nfingerprint 0000000000000000000000000000000000000000\n",
        );
        assert!(certs.is_empty());
        assert!(!certs.is_valid(0, 0));
    }
}
