//! Network status consensus
//!
//! Parses the `ns`-flavoured consensus document: one `r`/`s`/`w`/`p`
//! block per router, validity times in the preamble and authority
//! signatures in the footer.

use std::collections::HashMap;
use std::net::IpAddr;

use super::authority::{self, AuthorityKeyCertificates, DirectorySignature};
use super::document::{decode_base64, keyword_timestamp, parse_timestamp};
use super::exit_policy::ExitPolicy;
use super::fingerprint::Fingerprint;
use super::router::RouterFlags;
use crate::error::{Result, TorError};

/// One router entry of the consensus
#[derive(Debug, Clone)]
pub struct RouterStatusDescription {
    pub nickname: String,
    pub fingerprint: Fingerprint,
    /// SHA-1 of the router's current server descriptor
    pub descriptor_digest: [u8; 20],
    pub published: u64,
    pub address: IpAddr,
    pub or_port: u16,
    pub dir_port: u16,
    pub flags: RouterFlags,
    /// Consensus weight from the `w` line
    pub bandwidth: u64,
    /// Port summary from the `p` line
    pub port_summary: Option<ExitPolicy>,
}

impl RouterStatusDescription {
    pub fn descriptor_digest_hex(&self) -> String {
        hex::encode_upper(self.descriptor_digest)
    }

    /// Parse an `r` line
    /// Format: r nickname identity digest published-date published-time IP ORPort DirPort
    fn parse_r_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return Err(TorError::ParseError(format!("invalid r line: {}", line)));
        }

        let fingerprint = Fingerprint::from_slice(&decode_base64(parts[2])?)?;
        let digest = decode_base64(parts[3])?;
        let descriptor_digest: [u8; 20] = digest
            .as_slice()
            .try_into()
            .map_err(|_| TorError::ParseError("descriptor digest is not 20 bytes".into()))?;
        let published = parse_timestamp(parts[4], parts[5])?;
        let address: IpAddr = parts[6]
            .parse()
            .map_err(|_| TorError::ParseError(format!("invalid address {}", parts[6])))?;
        let or_port = parts[7]
            .parse()
            .map_err(|_| TorError::ParseError("invalid OR port".into()))?;
        let dir_port = parts[8]
            .parse()
            .map_err(|_| TorError::ParseError("invalid dir port".into()))?;

        Ok(Self {
            nickname: parts[1].to_string(),
            fingerprint,
            descriptor_digest,
            published,
            address,
            or_port,
            dir_port,
            flags: RouterFlags::default(),
            bandwidth: 0,
            port_summary: None,
        })
    }
}

/// Parsed consensus document
#[derive(Debug, Clone)]
pub struct DirectoryConsensus {
    pub valid_after: u64,
    pub fresh_until: u64,
    pub valid_until: u64,
    pub routers: HashMap<Fingerprint, RouterStatusDescription>,
    pub signatures: Vec<DirectorySignature>,
    /// The document as received, kept for caching and signature checks
    pub text: String,
}

impl DirectoryConsensus {
    /// Parse a consensus document
    ///
    /// Entries with malformed `r` lines are skipped; a malformed
    /// preamble rejects the whole document.
    pub fn parse(text: &str) -> Result<Self> {
        let mut valid_after = None;
        let mut fresh_until = None;
        let mut valid_until = None;
        let mut routers = HashMap::new();
        let mut current: Option<RouterStatusDescription> = None;
        let mut skipped = 0usize;

        let flush = |entry: Option<RouterStatusDescription>,
                         routers: &mut HashMap<Fingerprint, RouterStatusDescription>| {
            if let Some(entry) = entry {
                routers.insert(entry.fingerprint, entry);
            }
        };

        for line in text.lines() {
            let line = line.trim();
            let keyword = line.split_whitespace().next().unwrap_or("");
            match keyword {
                "network-status-version" => {
                    if line.split_whitespace().nth(1) != Some("3") {
                        return Err(TorError::ConsensusError(format!(
                            "unsupported consensus version: {}",
                            line
                        )));
                    }
                }
                "valid-after" => valid_after = Some(keyword_timestamp(line)?),
                "fresh-until" => fresh_until = Some(keyword_timestamp(line)?),
                "valid-until" => valid_until = Some(keyword_timestamp(line)?),
                "r" => {
                    flush(current.take(), &mut routers);
                    match RouterStatusDescription::parse_r_line(line) {
                        Ok(entry) => current = Some(entry),
                        Err(e) => {
                            skipped += 1;
                            log::debug!("Skipping consensus entry: {}", e);
                        }
                    }
                }
                "s" => {
                    if let Some(entry) = current.as_mut() {
                        entry.flags = RouterFlags::from_string(&line[1..]);
                    }
                }
                "w" => {
                    if let Some(entry) = current.as_mut() {
                        entry.bandwidth = line
                            .split_whitespace()
                            .find_map(|part| part.strip_prefix("Bandwidth="))
                            .and_then(|bw| bw.parse().ok())
                            .unwrap_or(0);
                    }
                }
                "p" => {
                    if let Some(entry) = current.as_mut() {
                        entry.port_summary = ExitPolicy::from_port_summary(&line[1..]).ok();
                    }
                }
                "directory-footer" => {
                    flush(current.take(), &mut routers);
                    break;
                }
                _ => {}
            }
        }
        flush(current.take(), &mut routers);

        let missing = |what: &str| TorError::ConsensusError(format!("missing {}", what));
        let consensus = Self {
            valid_after: valid_after.ok_or_else(|| missing("valid-after"))?,
            fresh_until: fresh_until.ok_or_else(|| missing("fresh-until"))?,
            valid_until: valid_until.ok_or_else(|| missing("valid-until"))?,
            routers,
            signatures: authority::parse_signatures(text),
            text: text.to_string(),
        };

        if consensus.valid_after > consensus.fresh_until
            || consensus.fresh_until > consensus.valid_until
        {
            return Err(TorError::ConsensusError("inconsistent validity times".into()));
        }
        if skipped > 0 {
            log::warn!("Skipped {} malformed consensus entries", skipped);
        }
        log::debug!(
            "Parsed consensus with {} routers, {} signatures",
            consensus.routers.len(),
            consensus.signatures.len()
        );
        Ok(consensus)
    }

    /// Not expired at `now`
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.valid_after <= now && now < self.valid_until
    }

    /// A newer consensus should be fetched once the fresh period is over
    pub fn needs_to_be_refreshed(&self, now: u64) -> bool {
        now >= self.fresh_until || !self.is_valid_at(now)
    }

    /// Number of entries flagged Running
    pub fn running_count(&self) -> usize {
        self.routers.values().filter(|r| r.flags.running).count()
    }

    pub fn verify_signatures(&self, certs: &AuthorityKeyCertificates, now: u64) -> Result<usize> {
        authority::verify_consensus_signatures(&self.text, &self.signatures, certs, now)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::Engine;

    pub(crate) fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
    }

    pub(crate) fn sample_consensus() -> String {
        format!(
            "network-status-version 3\n\
             vote-status consensus\n\
             valid-after 2024-03-01 12:00:00\n\
             fresh-until 2024-03-01 13:00:00\n\
             valid-until 2024-03-01 15:00:00\n\
             r alpha {} {} 2024-03-01 10:00:00 10.0.0.1 9001 9030\n\
             s Fast Guard Running Stable V2Dir Valid\n\
             w Bandwidth=5000\n\
             p reject 1-65535\n\
             r beta {} {} 2024-03-01 10:00:00 10.0.1.1 443 0\n\
             s Exit Fast Running Valid\n\
             w Bandwidth=200\n\
             p accept 80,443\n\
             r broken !!! ??? 2024-03-01 10:00:00 10.0.2.1 443 0\n\
             s Running\n\
             directory-footer\n\
             directory-signature sha256 {} {}\n\
             -----BEGIN SIGNATURE-----\n\
             AAAA\n\
             -----END SIGNATURE-----\n",
            b64(&[1u8; 20]),
            b64(&[0xaa; 20]),
            b64(&[2u8; 20]),
            b64(&[0xbb; 20]),
            authority::DIRECTORY_AUTHORITIES[0].v3ident,
            "0000000000000000000000000000000000000000",
        )
    }

    #[test]
    fn test_parse_consensus() {
        let consensus = DirectoryConsensus::parse(&sample_consensus()).unwrap();
        assert_eq!(consensus.routers.len(), 2);
        assert_eq!(consensus.signatures.len(), 1);
        assert_eq!(consensus.running_count(), 2);

        let alpha = &consensus.routers[&Fingerprint::new([1; 20])];
        assert_eq!(alpha.nickname, "alpha");
        assert_eq!(alpha.descriptor_digest, [0xaa; 20]);
        assert_eq!(alpha.dir_port, 9030);
        assert!(alpha.flags.guard && alpha.flags.v2_dir);
        assert_eq!(alpha.bandwidth, 5000);
        assert!(!alpha.port_summary.as_ref().unwrap().accepts_port(443));

        let beta = &consensus.routers[&Fingerprint::new([2; 20])];
        assert!(beta.flags.exit);
        assert!(beta.port_summary.as_ref().unwrap().accepts_port(443));
    }

    #[test]
    fn test_freshness() {
        let consensus = DirectoryConsensus::parse(&sample_consensus()).unwrap();
        let after = consensus.valid_after;
        assert!(consensus.is_valid_at(after));
        assert!(!consensus.needs_to_be_refreshed(after + 60));
        assert!(consensus.needs_to_be_refreshed(consensus.fresh_until));
        assert!(!consensus.is_valid_at(consensus.valid_until));
        assert!(!consensus.is_valid_at(after - 1));
    }

    #[test]
    fn test_rejects_missing_preamble() {
        let text = "network-status-version 3\nvalid-after 2024-03-01 12:00:00\n";
        assert!(DirectoryConsensus::parse(text).is_err());
        assert!(DirectoryConsensus::parse("network-status-version 2\n").is_err());
    }
}
