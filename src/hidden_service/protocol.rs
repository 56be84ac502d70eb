//! Wire bodies of the rendezvous protocol cells
//!
//! ```text
//! ESTABLISH_INTRO      AUTH_KEY (32) | SIG (64)
//! INTRODUCE1 / 2       AUTH_KEY (32) | RP | COOKIE (20) | HANDSHAKE (84)
//! RENDEZVOUS1          COOKIE (20) | HANDSHAKE_INFO (64)
//! RENDEZVOUS2          HANDSHAKE_INFO (64)
//! INTRODUCE_ACK        STATUS (2)
//! RP                   ID (20) | ATYPE (1) | ADDR (4 or 16) | PORT (2) | NTOR_KEY (32)
//! ```
//!
//! SIG is the service identity key's signature over a fixed context
//! string followed by AUTH_KEY.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::directory::fingerprint::Fingerprint;
use crate::directory::router::Router;
use crate::error::{Result, TorError};
use crate::protocol::ntor::{CLIENT_HANDSHAKE_LEN, SERVER_HANDSHAKE_LEN};

const ESTABLISH_INTRO_CONTEXT: &[u8] = b"tor-netlib establish-intro v1";

pub const COOKIE_LEN: usize = 20;

pub const INTRODUCE_ACK_SUCCESS: u16 = 0;
pub const INTRODUCE_ACK_UNKNOWN_SERVICE: u16 = 1;

fn truncated(what: &str) -> TorError {
    TorError::ProtocolError(format!("{} truncated", what))
}

pub fn establish_intro_body(identity: &SigningKey) -> Vec<u8> {
    let auth_key = identity.verifying_key().to_bytes();
    let mut message = ESTABLISH_INTRO_CONTEXT.to_vec();
    message.extend_from_slice(&auth_key);
    let signature = identity.sign(&message);

    let mut body = auth_key.to_vec();
    body.extend_from_slice(&signature.to_bytes());
    body
}

/// Check an ESTABLISH_INTRO body and return its AUTH_KEY
pub fn verify_establish_intro(body: &[u8]) -> Result<[u8; 32]> {
    if body.len() < 96 {
        return Err(truncated("ESTABLISH_INTRO"));
    }
    let mut auth_key = [0u8; 32];
    auth_key.copy_from_slice(&body[..32]);
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&body[32..96]);

    let key = VerifyingKey::from_bytes(&auth_key)
        .map_err(|e| TorError::CertificateError(format!("bad AUTH_KEY: {}", e)))?;
    let mut message = ESTABLISH_INTRO_CONTEXT.to_vec();
    message.extend_from_slice(&auth_key);
    key.verify(&message, &Signature::from_bytes(&sig))
        .map_err(|_| TorError::CertificateError("bad ESTABLISH_INTRO signature".into()))?;
    Ok(auth_key)
}

/// Enough about a relay to extend a circuit to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRef {
    pub fingerprint: Fingerprint,
    pub address: IpAddr,
    pub or_port: u16,
    pub ntor_onion_key: [u8; 32],
}

impl RelayRef {
    pub fn from_router(router: &Router) -> Result<Self> {
        let ntor_onion_key = router.ntor_onion_key.ok_or_else(|| {
            TorError::HiddenService(format!("{} has no ntor onion key", router.nickname))
        })?;
        Ok(Self {
            fingerprint: router.fingerprint,
            address: router.address,
            or_port: router.or_port,
            ntor_onion_key,
        })
    }

    /// A router value that circuits can extend to
    pub fn to_router(&self) -> Router {
        let mut router = Router::new(
            &format!("${}", self.fingerprint.to_hex()),
            self.address,
            self.or_port,
            self.fingerprint,
        );
        router.ntor_onion_key = Some(self.ntor_onion_key);
        router
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.fingerprint.as_bytes());
        match self.address {
            IpAddr::V4(v4) => {
                out.push(4);
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.push(6);
                out.extend_from_slice(&v6.octets());
            }
        }
        out.extend_from_slice(&self.or_port.to_be_bytes());
        out.extend_from_slice(&self.ntor_onion_key);
    }

    /// Parse from the start of `data`; returns the bytes consumed
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let fingerprint = Fingerprint::from_slice(data.get(..20).ok_or_else(|| truncated("relay"))?)?;
        let (address, mut pos) = match data.get(20) {
            Some(4) => {
                let b = data.get(21..25).ok_or_else(|| truncated("relay"))?;
                (IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])), 25)
            }
            Some(6) => {
                let b = data.get(21..37).ok_or_else(|| truncated("relay"))?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                (IpAddr::V6(Ipv6Addr::from(octets)), 37)
            }
            _ => return Err(TorError::ProtocolError("bad relay address type".into())),
        };
        let port = data.get(pos..pos + 2).ok_or_else(|| truncated("relay"))?;
        let or_port = u16::from_be_bytes([port[0], port[1]]);
        pos += 2;
        let mut ntor_onion_key = [0u8; 32];
        ntor_onion_key.copy_from_slice(data.get(pos..pos + 32).ok_or_else(|| truncated("relay"))?);
        pos += 32;
        Ok((
            Self {
                fingerprint,
                address,
                or_port,
                ntor_onion_key,
            },
            pos,
        ))
    }
}

/// Body of INTRODUCE1, relayed unchanged as INTRODUCE2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroduceBody {
    pub auth_key: [u8; 32],
    pub rendezvous_point: RelayRef,
    pub cookie: [u8; COOKIE_LEN],
    /// ntor client handshake addressed to the service
    pub handshake: Vec<u8>,
}

impl IntroduceBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 75 + COOKIE_LEN + CLIENT_HANDSHAKE_LEN);
        out.extend_from_slice(&self.auth_key);
        self.rendezvous_point.encode(&mut out);
        out.extend_from_slice(&self.cookie);
        out.extend_from_slice(&self.handshake);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut auth_key = [0u8; 32];
        auth_key.copy_from_slice(data.get(..32).ok_or_else(|| truncated("INTRODUCE"))?);
        let (rendezvous_point, used) = RelayRef::parse(&data[32..])?;
        let mut pos = 32 + used;
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(
            data.get(pos..pos + COOKIE_LEN)
                .ok_or_else(|| truncated("INTRODUCE"))?,
        );
        pos += COOKIE_LEN;
        let handshake = data
            .get(pos..pos + CLIENT_HANDSHAKE_LEN)
            .ok_or_else(|| truncated("INTRODUCE"))?
            .to_vec();
        Ok(Self {
            auth_key,
            rendezvous_point,
            cookie,
            handshake,
        })
    }
}

pub fn rendezvous1_body(cookie: &[u8; COOKIE_LEN], handshake_info: &[u8]) -> Vec<u8> {
    let mut out = cookie.to_vec();
    out.extend_from_slice(handshake_info);
    out
}

/// Split RENDEZVOUS1 into cookie and handshake info
pub fn parse_rendezvous1(data: &[u8]) -> Result<([u8; COOKIE_LEN], Vec<u8>)> {
    if data.len() < COOKIE_LEN + SERVER_HANDSHAKE_LEN {
        return Err(truncated("RENDEZVOUS1"));
    }
    let mut cookie = [0u8; COOKIE_LEN];
    cookie.copy_from_slice(&data[..COOKIE_LEN]);
    Ok((cookie, data[COOKIE_LEN..COOKIE_LEN + SERVER_HANDSHAKE_LEN].to_vec()))
}

pub fn introduce_ack_status(data: &[u8]) -> u16 {
    match data {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => INTRODUCE_ACK_SUCCESS,
    }
}
