//! ntor handshake implementation
//!
//! Implements the ntor (ntor1) key exchange protocol used by Tor for circuit creation.
//! Based on X25519 Elliptic Curve Diffie-Hellman.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html
//! - ntor paper: https://www.torproject.org/svn/trunk/doc/spec/proposals/216-ntor-handshake.txt
//!
//! Security: Uses constant-time comparison for AUTH verification to prevent timing attacks.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::crypto::CircuitKeys;
use crate::error::{Result, TorError};

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// CREATE2 handshake type for ntor
pub const HANDSHAKE_TYPE_NTOR: u16 = 0x0002;

/// Length of the client handshake: ID (20) | B (32) | X (32)
pub const CLIENT_HANDSHAKE_LEN: usize = 84;

/// Length of the server reply: Y (32) | AUTH (32)
pub const SERVER_HANDSHAKE_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], input: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| TorError::Crypto("HMAC key rejected".into()))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().into())
}

/// KEY_SEED and AUTH from the shared secret_input, computed the same way
/// on both ends
fn derive(
    mut secret_input: Vec<u8>,
    id: &[u8; 20],
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Result<([u8; 32], [u8; 32])> {
    secret_input.extend_from_slice(id);
    secret_input.extend_from_slice(b.as_bytes());
    secret_input.extend_from_slice(x.as_bytes());
    secret_input.extend_from_slice(y.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = hmac(T_KEY, &secret_input)?;
    let verify = hmac(T_VERIFY, &secret_input)?;
    secret_input.zeroize();

    // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
    let mut auth_input = Vec::with_capacity(32 + 20 + 32 * 3 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(id);
    auth_input.extend_from_slice(b.as_bytes());
    auth_input.extend_from_slice(y.as_bytes());
    auth_input.extend_from_slice(x.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");
    let auth = hmac(T_MAC, &auth_input)?;

    Ok((key_seed, auth))
}

/// Reject obviously broken RNG output (all zeros, all ones, repeated patterns)
fn validate_entropy(bytes: &[u8]) -> Result<()> {
    if bytes.iter().all(|&b| b == 0) || bytes.iter().all(|&b| b == 0xFF) {
        return Err(TorError::EntropyError("degenerate key material".into()));
    }
    let unique_bytes: std::collections::HashSet<u8> = bytes.iter().copied().collect();
    if unique_bytes.len() < 8 {
        return Err(TorError::EntropyError(format!(
            "low entropy key ({} unique bytes)",
            unique_bytes.len()
        )));
    }
    Ok(())
}

/// Client side of one ntor handshake
///
/// SECURITY: the ephemeral secret is zeroized on drop by x25519-dalek.
pub struct NtorHandshake {
    client_secret: StaticSecret,
    client_public: PublicKey,
    relay_identity: [u8; 20],
    relay_onion_key: PublicKey,
}

impl NtorHandshake {
    /// Start a handshake with the relay identified by `relay_identity`
    /// whose ntor onion key is `relay_onion_key`
    pub fn new(relay_identity: &[u8; 20], relay_onion_key: &PublicKey) -> Result<Self> {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        validate_entropy(client_public.as_bytes())?;

        Ok(Self {
            client_secret,
            client_public,
            relay_identity: *relay_identity,
            relay_onion_key: *relay_onion_key,
        })
    }

    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// CREATE2 / EXTEND2 handshake data: ID | B | X (84 bytes)
    pub fn handshake_data(&self) -> Vec<u8> {
        Self::create_handshake_data(&self.client_public, &self.relay_identity, &self.relay_onion_key)
    }

    pub fn create_handshake_data(
        client_public: &PublicKey,
        relay_identity_fingerprint: &[u8; 20],
        relay_onion_key: &PublicKey,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(CLIENT_HANDSHAKE_LEN);
        data.extend_from_slice(relay_identity_fingerprint);
        data.extend_from_slice(relay_onion_key.as_bytes());
        data.extend_from_slice(client_public.as_bytes());
        data
    }

    /// Complete the handshake with the server reply `Y | AUTH`
    ///
    /// Tor spec: secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
    pub fn complete(self, reply: &[u8]) -> Result<CircuitKeys> {
        let (server_public, server_auth) = parse_server_handshake(reply)?;

        let yx = self.client_secret.diffie_hellman(&server_public);
        let bx = self.client_secret.diffie_hellman(&self.relay_onion_key);
        if !yx.was_contributory() || !bx.was_contributory() {
            return Err(TorError::HandshakeFailed("non-contributory DH result".into()));
        }

        let mut secret_input = Vec::with_capacity(256);
        secret_input.extend_from_slice(yx.as_bytes());
        secret_input.extend_from_slice(bx.as_bytes());

        let (mut key_seed, auth) = derive(
            secret_input,
            &self.relay_identity,
            &self.relay_onion_key,
            &self.client_public,
            &server_public,
        )?;

        // SECURITY: constant-time AUTH comparison
        let auth_valid: bool = auth.ct_eq(&server_auth).into();
        if !auth_valid {
            key_seed.zeroize();
            log::warn!("ntor server AUTH verification failed");
            return Err(TorError::AuthVerificationFailed(
                "server AUTH verification failed".into(),
            ));
        }

        let keys = CircuitKeys::derive_from_secret(&key_seed);
        key_seed.zeroize();
        keys
    }
}

/// Split `Y | AUTH`
pub fn parse_server_handshake(payload: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if payload.len() < SERVER_HANDSHAKE_LEN {
        return Err(TorError::ProtocolError("ntor reply too short".into()));
    }
    let mut y = [0u8; 32];
    y.copy_from_slice(&payload[0..32]);
    let mut auth = [0u8; 32];
    auth.copy_from_slice(&payload[32..64]);
    Ok((PublicKey::from(y), auth))
}

/// Server side of the ntor handshake
///
/// Used by hidden services answering introductions, and by relays.
pub struct NtorServer {
    identity: [u8; 20],
    onion_secret: StaticSecret,
    onion_key: PublicKey,
}

impl NtorServer {
    pub fn new(identity: [u8; 20], onion_secret: StaticSecret) -> Self {
        let onion_key = PublicKey::from(&onion_secret);
        Self {
            identity,
            onion_secret,
            onion_key,
        }
    }

    pub fn identity(&self) -> &[u8; 20] {
        &self.identity
    }

    /// Public key B clients use in their handshake
    pub fn onion_key(&self) -> &PublicKey {
        &self.onion_key
    }

    /// Answer a client handshake `ID | B | X`
    ///
    /// Returns the reply `Y | AUTH` and the circuit keys (client view:
    /// forward is client to server).
    pub fn respond(&self, client_handshake: &[u8]) -> Result<(Vec<u8>, CircuitKeys)> {
        if client_handshake.len() < CLIENT_HANDSHAKE_LEN {
            return Err(TorError::ProtocolError("ntor handshake too short".into()));
        }
        if client_handshake[0..20] != self.identity {
            return Err(TorError::HandshakeFailed("handshake for another identity".into()));
        }
        if client_handshake[20..52] != *self.onion_key.as_bytes() {
            return Err(TorError::HandshakeFailed("handshake for another onion key".into()));
        }
        let mut x = [0u8; 32];
        x.copy_from_slice(&client_handshake[52..84]);
        let client_public = PublicKey::from(x);

        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret);
        validate_entropy(server_public.as_bytes())?;

        let xy = server_secret.diffie_hellman(&client_public);
        let xb = self.onion_secret.diffie_hellman(&client_public);
        if !xy.was_contributory() || !xb.was_contributory() {
            return Err(TorError::HandshakeFailed("non-contributory DH result".into()));
        }

        let mut secret_input = Vec::with_capacity(256);
        secret_input.extend_from_slice(xy.as_bytes());
        secret_input.extend_from_slice(xb.as_bytes());

        let (mut key_seed, auth) = derive(
            secret_input,
            &self.identity,
            &self.onion_key,
            &client_public,
            &server_public,
        )?;
        let keys = CircuitKeys::derive_from_secret(&key_seed);
        key_seed.zeroize();

        let mut reply = Vec::with_capacity(SERVER_HANDSHAKE_LEN);
        reply.extend_from_slice(server_public.as_bytes());
        reply.extend_from_slice(&auth);
        Ok((reply, keys?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> NtorServer {
        NtorServer::new([0x11; 20], StaticSecret::random_from_rng(OsRng))
    }

    #[test]
    fn test_create_handshake_data() {
        let relay = server();
        let handshake = NtorHandshake::new(relay.identity(), relay.onion_key()).unwrap();
        let data = handshake.handshake_data();

        assert_eq!(data.len(), CLIENT_HANDSHAKE_LEN);
        assert_eq!(&data[0..20], relay.identity());
        assert_eq!(&data[20..52], relay.onion_key().as_bytes());
        assert_eq!(&data[52..84], handshake.client_public_key().as_bytes());
    }

    #[test]
    fn test_full_handshake_agrees_on_keys() {
        let relay = server();
        let client = NtorHandshake::new(relay.identity(), relay.onion_key()).unwrap();
        let (reply, server_keys) = relay.respond(&client.handshake_data()).unwrap();
        assert_eq!(reply.len(), SERVER_HANDSHAKE_LEN);

        let client_keys = client.complete(&reply).unwrap();
        assert_eq!(client_keys.forward_key, server_keys.forward_key);
        assert_eq!(client_keys.backward_key, server_keys.backward_key);
        assert_eq!(client_keys.forward_digest, server_keys.forward_digest);
    }

    #[test]
    fn test_bad_auth_rejected() {
        let relay = server();
        let client = NtorHandshake::new(relay.identity(), relay.onion_key()).unwrap();
        let (mut reply, _) = relay.respond(&client.handshake_data()).unwrap();
        reply[40] ^= 0x80;
        assert!(matches!(
            client.complete(&reply),
            Err(TorError::AuthVerificationFailed(_))
        ));
    }

    #[test]
    fn test_wrong_onion_key_detected() {
        let relay = server();
        let other = server();
        let client = NtorHandshake::new(relay.identity(), other.onion_key()).unwrap();
        assert!(relay.respond(&client.handshake_data()).is_err());
    }

    #[test]
    fn test_entropy_validation() {
        assert!(validate_entropy(&[0u8; 32]).is_err());
        assert!(validate_entropy(&[0xFF; 32]).is_err());
        assert!(validate_entropy(&[1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3, 1]).is_err());
        let good: Vec<u8> = (0..32).collect();
        assert!(validate_entropy(&good).is_ok());
    }

    #[test]
    fn test_short_reply_rejected() {
        assert!(parse_server_handshake(&[0u8; 63]).is_err());
    }
}
