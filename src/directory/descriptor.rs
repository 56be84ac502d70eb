//! Router server descriptors
//!
//! A descriptor is trusted through two links: its RSA signature must
//! verify with the signing key it carries (whose SHA-1 is the router's
//! fingerprint), and its SHA-1 digest must equal the digest the signed
//! consensus lists for that fingerprint. The second check happens when
//! the directory merges descriptors with the consensus.

use std::net::IpAddr;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};

use super::document::{decode_base64, keyword_timestamp, read_pem_block, signed_portion};
use super::exit_policy::ExitPolicy;
use super::fingerprint::Fingerprint;
use super::router::{Router, DESCRIPTOR_LIFETIME};
use crate::error::{Result, TorError};

const SIGNED_END: &str = "\nrouter-signature\n";

/// Parse and verify one descriptor starting with its `router` line
pub fn parse_descriptor(text: &str) -> Result<Router> {
    let text = text.trim_start();
    let bad = |what: String| TorError::ParseError(format!("descriptor: {}", what));

    let mut lines = text.lines();
    let first = lines.next().unwrap_or("");
    let parts: Vec<&str> = first.split_whitespace().collect();
    if parts.len() < 6 || parts[0] != "router" {
        return Err(bad(format!("bad router line {:?}", first)));
    }
    let nickname = parts[1];
    let address: IpAddr = parts[2]
        .parse()
        .map_err(|_| bad(format!("bad address {}", parts[2])))?;
    let or_port: u16 = parts[3].parse().map_err(|_| bad("bad OR port".into()))?;
    let socks_port: u16 = parts[4].parse().map_err(|_| bad("bad SOCKS port".into()))?;
    let dir_port: u16 = parts[5].parse().map_err(|_| bad("bad dir port".into()))?;

    let mut router = Router::new(nickname, address, or_port, Fingerprint::new([0; 20]));
    router.socks_port = socks_port;
    router.dir_port = dir_port;

    let mut declared_fingerprint = None;
    let mut signing_der = None;
    let mut signature = None;
    let mut policy = ExitPolicy::reject_all();

    while let Some(line) = lines.next() {
        let line = line.trim();
        let (keyword, args) = line.split_once(' ').unwrap_or((line, ""));
        match keyword {
            "platform" => router.platform = args.to_string(),
            "published" => router.published = keyword_timestamp(line)?,
            "fingerprint" => declared_fingerprint = Some(args.parse::<Fingerprint>()?),
            "uptime" => router.uptime = args.trim().parse().unwrap_or(0),
            "bandwidth" => {
                let bw: Vec<u32> = args
                    .split_whitespace()
                    .filter_map(|s| s.parse().ok())
                    .collect();
                if bw.len() != 3 {
                    return Err(bad(format!("bad bandwidth line {:?}", line)));
                }
                router.bandwidth_avg = bw[0];
                router.bandwidth_burst = bw[1];
                router.bandwidth_observed = bw[2];
            }
            "family" => {
                // Nickname-only entries cannot be resolved without a lookup; keep the digests
                router.family = args
                    .split_whitespace()
                    .filter_map(|member| member.split(['=', '~']).next())
                    .filter_map(|member| member.parse::<Fingerprint>().ok())
                    .collect();
            }
            "contact" => router.contact = args.to_string(),
            "onion-key" => router.onion_key = read_pem_block(&mut lines)?,
            "signing-key" => signing_der = Some(read_pem_block(&mut lines)?),
            "ntor-onion-key" => {
                let key = decode_base64(args)?;
                router.ntor_onion_key = Some(
                    key.as_slice()
                        .try_into()
                        .map_err(|_| bad("ntor-onion-key is not 32 bytes".into()))?,
                );
            }
            "identity-ed25519" | "onion-key-crosscert" | "ntor-onion-key-crosscert" => {
                read_pem_block(&mut lines)?;
            }
            "accept" | "reject" | "accept6" | "reject6" => policy.push(line.parse()?),
            "hidden-service-dir" => router.flags.hs_dir = true,
            "router-signature" => {
                signature = Some(read_pem_block(&mut lines)?);
                break;
            }
            _ => {}
        }
    }

    let signing_der = signing_der.ok_or_else(|| bad("missing signing-key".into()))?;
    let signature = signature.ok_or_else(|| bad("missing router-signature".into()))?;

    router.fingerprint = Fingerprint::of_key(&signing_der);
    if let Some(declared) = declared_fingerprint {
        if declared != router.fingerprint {
            return Err(bad(format!(
                "fingerprint {} does not match signing key",
                declared
            )));
        }
    }

    let signed = signed_portion(text, SIGNED_END).ok_or_else(|| bad("no signed portion".into()))?;
    let digest: [u8; 20] = Sha1::digest(signed.as_bytes()).into();
    let signing_key = RsaPublicKey::from_pkcs1_der(&signing_der)
        .map_err(|e| bad(format!("signing key: {}", e)))?;
    signing_key
        .verify(Pkcs1v15Sign::new_unprefixed(), &digest, &signature)
        .map_err(|_| {
            TorError::CertificateError(format!("bad descriptor signature for {}", nickname))
        })?;

    router.signing_key = signing_der;
    router.descriptor_digest = digest;
    router.exit_policy = policy;
    router.valid_until = router.published + DESCRIPTOR_LIFETIME.as_secs();
    router.reset_ranking();
    Ok(router)
}

/// Split a concatenation of descriptors into one slice per descriptor
pub fn split_descriptors(text: &str) -> Vec<&str> {
    let mut starts: Vec<usize> = text.match_indices("\nrouter ").map(|(i, _)| i + 1).collect();
    if text.starts_with("router ") {
        starts.insert(0, 0);
    }
    starts
        .iter()
        .enumerate()
        .map(|(n, start)| {
            let end = starts.get(n + 1).copied().unwrap_or(text.len());
            &text[*start..end]
        })
        .collect()
}

/// Parse many descriptors using up to `workers` blocking tasks
///
/// Descriptors that fail to parse or verify are skipped.
pub async fn parse_descriptors(text: &str, workers: usize) -> Vec<Router> {
    let blocks = split_descriptors(text);
    let total = blocks.len();
    if total == 0 {
        return Vec::new();
    }

    let workers = workers.clamp(1, total);
    let per_worker = total.div_ceil(workers);
    let tasks: Vec<_> = blocks
        .chunks(per_worker)
        .map(|chunk| {
            let owned: Vec<String> = chunk.iter().map(|s| s.to_string()).collect();
            tokio::task::spawn_blocking(move || {
                owned
                    .iter()
                    .filter_map(|block| match parse_descriptor(block) {
                        Ok(router) => Some(router),
                        Err(e) => {
                            log::debug!("Skipping descriptor: {}", e);
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut routers = Vec::with_capacity(total);
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(parsed) => routers.extend(parsed),
            Err(e) => log::warn!("Descriptor worker failed: {}", e),
        }
    }

    if routers.len() < total {
        log::warn!("Skipped {} of {} descriptors", total - routers.len(), total);
    }
    routers
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::Engine;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::RsaPrivateKey;

    fn pem(label: &str, der: &[u8]) -> String {
        let body = base64::engine::general_purpose::STANDARD.encode(der);
        let mut out = format!("-----BEGIN {}-----\n", label);
        for chunk in body.as_bytes().chunks(64) {
            out.push_str(std::str::from_utf8(chunk).unwrap());
            out.push('\n');
        }
        out.push_str(&format!("-----END {}-----\n", label));
        out
    }

    /// Build a signed descriptor with a fresh 512-bit key
    pub(crate) fn signed_descriptor(nickname: &str, address: &str, body: &str) -> (String, Fingerprint) {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 512).unwrap();
        let der = key.to_public_key().to_pkcs1_der().unwrap().as_bytes().to_vec();
        let fingerprint = Fingerprint::of_key(&der);

        let mut text = format!(
            "router {} {} 9001 0 9030\n\
             published 2024-03-01 10:00:00\n\
             fingerprint {}\n\
             bandwidth 1000000 2000000 900000\n\
             signing-key\n{}\
             {}\
             router-signature\n",
            nickname,
            address,
            fingerprint,
            pem("RSA PUBLIC KEY", &der),
            body
        );
        let digest = Sha1::digest(text.as_bytes());
        let sig = key.sign(Pkcs1v15Sign::new_unprefixed(), &digest).unwrap();
        text.push_str(&pem("SIGNATURE", &sig));
        (text, fingerprint)
    }

    #[test]
    fn test_parse_descriptor() {
        let (text, fingerprint) = signed_descriptor(
            "alpha",
            "10.1.2.3",
            "family $0101010101010101010101010101010101010101 somenick\n\
             ntor-onion-key AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA\n\
             hidden-service-dir\n\
             reject *:25\n\
             accept *:*\n",
        );
        let router = parse_descriptor(&text).unwrap();
        assert_eq!(router.nickname, "alpha");
        assert_eq!(router.fingerprint, fingerprint);
        assert_eq!(router.dir_port, 9030);
        assert_eq!(router.bandwidth_avg, 1_000_000);
        assert_eq!(router.family.len(), 1);
        assert!(router.flags.hs_dir);
        assert_eq!(router.ntor_onion_key.unwrap()[0], 1);
        assert!(router.exit_policy_accepts(None, 443));
        assert!(!router.exit_policy_accepts(None, 25));
        assert_eq!(router.valid_until, router.published + DESCRIPTOR_LIFETIME.as_secs());

        let signed = signed_portion(&text, SIGNED_END).unwrap();
        let digest: [u8; 20] = Sha1::digest(signed.as_bytes()).into();
        assert_eq!(router.descriptor_digest, digest);
    }

    #[test]
    fn test_tampered_descriptor_rejected() {
        let (text, _) = signed_descriptor("alpha", "10.1.2.3", "accept *:*\n");
        let tampered = text.replace("accept *:*", "accept *:2");
        assert!(parse_descriptor(&tampered).is_err());
    }

    #[tokio::test]
    async fn test_parallel_parse_skips_failures() {
        let mut all = String::new();
        for i in 0..4 {
            let (text, _) = signed_descriptor(&format!("r{}", i), &format!("10.0.{}.1", i), "accept *:*\n");
            all.push_str(&text);
        }
        all.push_str("router broken 10.9.9.9 9001 0 0\nplatform x\n");

        assert_eq!(split_descriptors(&all).len(), 5);
        let routers = parse_descriptors(&all, 2).await;
        assert_eq!(routers.len(), 4);
    }
}
