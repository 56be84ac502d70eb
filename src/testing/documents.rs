//! Signed directory documents for simulated relays

use std::net::IpAddr;

use base64::Engine;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::{Digest, Sha1};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::directory::document::format_timestamp;
use crate::directory::fingerprint::Fingerprint;
use crate::error::{Result, TorError};

/// Identity and onion keys of one simulated relay
pub struct RelayKeys {
    signing: RsaPrivateKey,
    signing_der: Vec<u8>,
    pub fingerprint: Fingerprint,
    pub ntor_secret: StaticSecret,
}

impl RelayKeys {
    /// Fresh keys; the RSA identity is 512 bits to keep tests fast
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let signing = RsaPrivateKey::new(&mut rng, 512)
            .map_err(|e| TorError::Crypto(format!("RSA key generation: {}", e)))?;
        let signing_der = signing
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| TorError::Crypto(format!("RSA key encoding: {}", e)))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            fingerprint: Fingerprint::of_key(&signing_der),
            signing,
            signing_der,
            ntor_secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        })
    }

    pub fn ntor_public(&self) -> PublicKey {
        PublicKey::from(&self.ntor_secret)
    }
}

/// What a simulated relay announces about itself
#[derive(Debug, Clone)]
pub struct RelaySpec {
    pub nickname: String,
    pub address: IpAddr,
    pub or_port: u16,
    pub dir_port: u16,
    /// Consensus flags, space separated
    pub flags: String,
    /// Exit policy lines, first match wins
    pub policy: Vec<String>,
    pub family: Vec<Fingerprint>,
    pub bandwidth: u32,
}

impl RelaySpec {
    pub fn new(nickname: &str, address: IpAddr) -> Self {
        Self {
            nickname: nickname.to_string(),
            address,
            or_port: 9001,
            dir_port: 0,
            flags: "Fast Running Stable Valid".into(),
            policy: vec!["reject *:*".into()],
            family: Vec::new(),
            bandwidth: 1_000_000,
        }
    }

    pub fn flags(mut self, flags: &str) -> Self {
        self.flags = flags.to_string();
        self
    }

    pub fn policy(mut self, lines: &[&str]) -> Self {
        self.policy = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn dir_port(mut self, port: u16) -> Self {
        self.dir_port = port;
        self
    }

    pub fn family(mut self, members: &[Fingerprint]) -> Self {
        self.family = members.to_vec();
        self
    }

    pub fn bandwidth(mut self, bandwidth: u32) -> Self {
        self.bandwidth = bandwidth;
        self
    }
}

pub fn pem(label: &str, der: &[u8]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

/// A server descriptor signed with `keys`, plus its digest
pub fn signed_descriptor(spec: &RelaySpec, keys: &RelayKeys, published: u64) -> Result<(String, [u8; 20])> {
    let mut text = format!(
        "router {} {} {} 0 {}\n\
         platform Tor 0.4.8.10 on Linux\n\
         published {}\n\
         fingerprint {}\n\
         uptime 86400\n\
         bandwidth {} {} {}\n",
        spec.nickname,
        spec.address,
        spec.or_port,
        spec.dir_port,
        format_timestamp(published),
        keys.fingerprint,
        spec.bandwidth,
        spec.bandwidth.saturating_mul(2),
        spec.bandwidth,
    );
    if !spec.family.is_empty() {
        let members: Vec<String> = spec.family.iter().map(|f| f.to_dollar_hex()).collect();
        text.push_str(&format!("family {}\n", members.join(" ")));
    }
    text.push_str("signing-key\n");
    text.push_str(&pem("RSA PUBLIC KEY", &keys.signing_der));
    text.push_str(&format!("ntor-onion-key {}\n", b64(keys.ntor_public().as_bytes())));
    if spec.flags.split_whitespace().any(|f| f == "HSDir") {
        text.push_str("hidden-service-dir\n");
    }
    for line in &spec.policy {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str("router-signature\n");

    let digest: [u8; 20] = Sha1::digest(text.as_bytes()).into();
    let signature = keys
        .signing
        .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
        .map_err(|e| TorError::Crypto(format!("descriptor signature: {}", e)))?;
    text.push_str(&pem("SIGNATURE", &signature));
    Ok((text, digest))
}

/// One consensus entry
pub struct ConsensusEntry<'a> {
    pub spec: &'a RelaySpec,
    pub fingerprint: Fingerprint,
    pub descriptor_digest: [u8; 20],
    pub published: u64,
}

/// An unsigned `ns` consensus valid for three hours from `valid_after`
pub fn consensus(entries: &[ConsensusEntry<'_>], valid_after: u64) -> String {
    let mut text = format!(
        "network-status-version 3\n\
         vote-status consensus\n\
         consensus-method 28\n\
         valid-after {}\n\
         fresh-until {}\n\
         valid-until {}\n\
         known-flags Authority BadExit Exit Fast Guard HSDir Running Stable V2Dir Valid\n",
        format_timestamp(valid_after),
        format_timestamp(valid_after + 3600),
        format_timestamp(valid_after + 3 * 3600),
    );
    for entry in entries {
        text.push_str(&format!(
            "r {} {} {} {} {} {} {}\n",
            entry.spec.nickname,
            b64(entry.fingerprint.as_bytes()),
            b64(&entry.descriptor_digest),
            format_timestamp(entry.published),
            entry.spec.address,
            entry.spec.or_port,
            entry.spec.dir_port,
        ));
        text.push_str(&format!("s {}\n", entry.spec.flags));
        text.push_str(&format!("w Bandwidth={}\n", entry.spec.bandwidth / 1000));
    }
    text.push_str("directory-footer\n");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::consensus::DirectoryConsensus;
    use crate::directory::descriptor::parse_descriptor;

    #[test]
    fn test_descriptor_and_consensus_agree() {
        let keys = RelayKeys::generate().unwrap();
        let spec = RelaySpec::new("sim0", "10.10.0.1".parse().unwrap())
            .flags("Exit Fast Running Valid HSDir")
            .policy(&["accept *:443", "reject *:*"])
            .dir_port(9030);
        let published = 1_709_290_800;
        let (text, digest) = signed_descriptor(&spec, &keys, published).unwrap();

        let router = parse_descriptor(&text).unwrap();
        assert_eq!(router.fingerprint, keys.fingerprint);
        assert_eq!(router.descriptor_digest, digest);
        assert_eq!(router.ntor_onion_key, Some(*keys.ntor_public().as_bytes()));
        assert!(router.exit_policy_accepts(None, 443));
        assert!(!router.exit_policy_accepts(None, 80));

        let entries = [ConsensusEntry {
            spec: &spec,
            fingerprint: keys.fingerprint,
            descriptor_digest: digest,
            published,
        }];
        let parsed = DirectoryConsensus::parse(&consensus(&entries, published)).unwrap();
        let status = &parsed.routers[&keys.fingerprint];
        assert_eq!(status.descriptor_digest, digest);
        assert!(status.flags.hs_dir && status.flags.exit);
        assert!(!parsed.needs_to_be_refreshed(published + 60));
    }
}
