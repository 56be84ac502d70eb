//! Tor Protocol Cryptography
//!
//! Implements Tor-spec-compliant crypto for circuit communication:
//! - AES-128-CTR stream encryption, one keystream per hop and direction
//! - SHA-1 running digests (Tor spec requirement)
//! - HKDF-SHA256 key derivation
//! - Onion encryption (layered encryption through multiple hops)
//!
//! Every hop keeps its cipher and digest state for the whole life of the
//! circuit; cells must be processed in order in each direction.
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::cell::{Cell, RelayCell};
use crate::error::{Result, TorError};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// Circuit keys for one hop
///
/// SECURITY: Keys are automatically zeroized when dropped to prevent
/// memory leakage of sensitive cryptographic material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward encryption key (client → relay)
    pub forward_key: [u8; 16],
    /// Backward encryption key (relay → client)
    pub backward_key: [u8; 16],
    /// Forward digest seed
    pub forward_digest: [u8; 20],
    /// Backward digest seed
    pub backward_digest: [u8; 20],
}

impl CircuitKeys {
    /// Derive circuit keys from KEY_SEED using Tor's KDF
    ///
    /// ```text
    /// K = HKDF-SHA256-Expand(KEY_SEED, m_expand)
    /// Output: Df (20) | Db (20) | Kf (16) | Kb (16) = 72 bytes
    /// ```
    pub fn derive_from_secret(key_seed: &[u8]) -> Result<Self> {
        const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

        // KEY_SEED is already an HMAC-SHA256 output, so it serves as the PRK
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::Crypto("Invalid PRK length".into()))?;

        let mut okm = [0u8; 72];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| TorError::Crypto("Key derivation failed".into()))?;

        let mut keys = Self {
            forward_digest: [0u8; 20],
            backward_digest: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        okm.zeroize();

        Ok(keys)
    }

    /// The same keys seen from the other end of the hop
    ///
    /// A hidden service joins a rendezvous circuit as the responder, so
    /// its forward direction is the client's backward one.
    pub fn swapped(&self) -> Self {
        Self {
            forward_key: self.backward_key,
            backward_key: self.forward_key,
            forward_digest: self.backward_digest,
            backward_digest: self.forward_digest,
        }
    }
}

/// Cipher and running digest state of one hop
struct HopCrypto {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl HopCrypto {
    fn new(keys: &CircuitKeys) -> Self {
        let iv = [0u8; 16];
        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);
        Self {
            forward_cipher: Aes128Ctr::new(&keys.forward_key.into(), &iv.into()),
            backward_cipher: Aes128Ctr::new(&keys.backward_key.into(), &iv.into()),
            forward_digest,
            backward_digest,
        }
    }
}

/// Serialize `cell` with a zeroed digest, fold it into `digest` and
/// insert the first four bytes of the running digest
fn seal(cell: &RelayCell, digest: &mut Sha1) -> Result<Vec<u8>> {
    let mut payload = cell.to_bytes()?;
    payload[1..3].fill(0);
    payload[RelayCell::DIGEST_OFFSET..RelayCell::DIGEST_OFFSET + 4].fill(0);
    digest.update(&payload);
    let running = digest.clone().finalize();
    payload[RelayCell::DIGEST_OFFSET..RelayCell::DIGEST_OFFSET + 4].copy_from_slice(&running[..4]);
    Ok(payload)
}

/// Check a decrypted payload against `digest`
///
/// The digest is only advanced when the cell is recognized.
fn recognize(payload: &[u8], digest: &mut Sha1) -> bool {
    if payload[1] != 0 || payload[2] != 0 {
        return false;
    }
    let mut received = [0u8; 4];
    received.copy_from_slice(&payload[RelayCell::DIGEST_OFFSET..RelayCell::DIGEST_OFFSET + 4]);

    let mut candidate = digest.clone();
    candidate.update(&payload[..RelayCell::DIGEST_OFFSET]);
    candidate.update([0u8; 4]);
    candidate.update(&payload[RelayCell::DIGEST_OFFSET + 4..]);
    let computed = candidate.clone().finalize();

    if bool::from(computed[..4].ct_eq(&received)) {
        *digest = candidate;
        true
    } else {
        false
    }
}

fn check_payload_len(payload: &[u8]) -> Result<()> {
    if payload.len() != Cell::PAYLOAD_SIZE {
        return Err(TorError::ProtocolError(format!(
            "relay payload must be {} bytes, got {}",
            Cell::PAYLOAD_SIZE,
            payload.len()
        )));
    }
    Ok(())
}

/// Onion Crypto Engine (client side)
///
/// Hops are ordered from the first relay outward. Each hop adds or
/// removes one layer of encryption.
#[derive(Default)]
pub struct OnionCrypto {
    hops: Vec<HopCrypto>,
}

impl OnionCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hop once its handshake completed
    pub fn add_hop(&mut self, keys: &CircuitKeys) {
        self.hops.push(HopCrypto::new(keys));
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Encrypt a relay cell addressed to `target_hop`
    ///
    /// The target's forward digest covers the cell; then every layer from
    /// the target back to the first hop is applied.
    pub fn encrypt_outbound(&mut self, cell: &RelayCell, target_hop: usize) -> Result<Vec<u8>> {
        if target_hop >= self.hops.len() {
            return Err(TorError::Internal(format!(
                "hop {} out of range ({} hops)",
                target_hop,
                self.hops.len()
            )));
        }

        let mut payload = seal(cell, &mut self.hops[target_hop].forward_digest)?;
        for hop in self.hops[..=target_hop].iter_mut().rev() {
            hop.forward_cipher.apply_keystream(&mut payload);
        }
        Ok(payload)
    }

    /// Decrypt an inbound relay payload in place
    ///
    /// Layers are removed from the first hop outward until one hop
    /// recognizes the cell. Returns that hop's index with the parsed cell.
    /// A cell no hop recognizes means the crypto state is out of sync and
    /// the circuit must be torn down.
    pub fn decrypt_inbound(&mut self, payload: &mut [u8]) -> Result<(usize, RelayCell)> {
        check_payload_len(payload)?;
        for (index, hop) in self.hops.iter_mut().enumerate() {
            hop.backward_cipher.apply_keystream(payload);
            if recognize(payload, &mut hop.backward_digest) {
                return Ok((index, RelayCell::from_bytes(payload)?));
            }
        }
        Err(TorError::DigestMismatch)
    }
}

/// Relay-side crypto of one hop
///
/// What the relay at a given position does with cells passing through
/// it: the mirror image of one [`OnionCrypto`] hop.
pub struct RelayCrypto {
    hop: HopCrypto,
}

impl RelayCrypto {
    pub fn new(keys: &CircuitKeys) -> Self {
        Self {
            hop: HopCrypto::new(keys),
        }
    }

    /// Remove this hop's layer from an outbound payload
    ///
    /// Returns the cell when it is addressed to this hop; otherwise the
    /// payload should be passed on to the next hop.
    pub fn process_outbound(&mut self, payload: &mut [u8]) -> Result<Option<RelayCell>> {
        check_payload_len(payload)?;
        self.hop.forward_cipher.apply_keystream(payload);
        if recognize(payload, &mut self.hop.forward_digest) {
            Ok(Some(RelayCell::from_bytes(payload)?))
        } else {
            Ok(None)
        }
    }

    /// Originate an inbound cell at this hop
    pub fn originate_inbound(&mut self, cell: &RelayCell) -> Result<Vec<u8>> {
        let mut payload = seal(cell, &mut self.hop.backward_digest)?;
        self.hop.backward_cipher.apply_keystream(&mut payload);
        Ok(payload)
    }

    /// Add this hop's layer to an inbound payload from a later hop
    pub fn relay_inbound(&mut self, payload: &mut [u8]) -> Result<()> {
        check_payload_len(payload)?;
        self.hop.backward_cipher.apply_keystream(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::RelayCommand;

    fn keys(n: usize) -> Vec<CircuitKeys> {
        (0..n)
            .map(|i| CircuitKeys::derive_from_secret(&[i as u8 + 1; 32]).unwrap())
            .collect()
    }

    fn setup(n: usize) -> (OnionCrypto, Vec<RelayCrypto>) {
        let keys = keys(n);
        let mut client = OnionCrypto::new();
        for k in &keys {
            client.add_hop(k);
        }
        let relays = keys.iter().map(RelayCrypto::new).collect();
        (client, relays)
    }

    #[test]
    fn test_key_derivation() {
        let keys = CircuitKeys::derive_from_secret(&[7u8; 32]).unwrap();
        assert_ne!(keys.forward_key, keys.backward_key);
        assert_ne!(keys.forward_digest, keys.backward_digest);

        let again = CircuitKeys::derive_from_secret(&[7u8; 32]).unwrap();
        assert_eq!(keys.forward_key, again.forward_key);

        let swapped = keys.swapped();
        assert_eq!(swapped.forward_key, keys.backward_key);
        assert_eq!(swapped.backward_digest, keys.forward_digest);
    }

    #[test]
    fn test_onion_layering_all_hop_counts() {
        for hops in 1..=crate::config::MAX_ROUTE_LENGTH {
            let (mut client, mut relays) = setup(hops);
            for target in 0..hops {
                // Outbound: each relay peels one layer until the target recognizes it
                let cell = RelayCell::new(RelayCommand::Data, 7, vec![target as u8; 100]);
                let mut payload = client.encrypt_outbound(&cell, target).unwrap();
                for (i, relay) in relays.iter_mut().enumerate().take(target + 1) {
                    let seen = relay.process_outbound(&mut payload).unwrap();
                    if i == target {
                        let seen = seen.expect("target recognizes the cell");
                        assert_eq!(seen.data, cell.data);
                        assert_eq!(seen.stream_id, 7);
                    } else {
                        assert!(seen.is_none());
                    }
                }

                // Inbound: the target originates, earlier relays add layers
                let reply = RelayCell::new(RelayCommand::Data, 7, b"reply".to_vec());
                let mut payload = relays[target].originate_inbound(&reply).unwrap();
                for relay in relays[..target].iter_mut().rev() {
                    relay.relay_inbound(&mut payload).unwrap();
                }
                let (origin, decoded) = client.decrypt_inbound(&mut payload).unwrap();
                assert_eq!(origin, target);
                assert_eq!(decoded.data, b"reply");
            }
        }
    }

    #[test]
    fn test_running_digest_spans_cells() {
        let (mut client, mut relays) = setup(3);
        for round in 0..20u8 {
            let reply = RelayCell::new(RelayCommand::Sendme, 0, vec![round]);
            let mut payload = relays[2].originate_inbound(&reply).unwrap();
            relays[1].relay_inbound(&mut payload).unwrap();
            relays[0].relay_inbound(&mut payload).unwrap();
            let (origin, decoded) = client.decrypt_inbound(&mut payload).unwrap();
            assert_eq!(origin, 2);
            assert_eq!(decoded.data, vec![round]);
        }
    }

    #[test]
    fn test_bit_flip_rejected() {
        let (mut client, mut relays) = setup(3);
        let reply = RelayCell::new(RelayCommand::Data, 3, vec![0x55; 200]);
        let mut payload = relays[2].originate_inbound(&reply).unwrap();
        relays[1].relay_inbound(&mut payload).unwrap();
        relays[0].relay_inbound(&mut payload).unwrap();

        payload[40] ^= 0x01;
        assert!(matches!(
            client.decrypt_inbound(&mut payload),
            Err(TorError::DigestMismatch)
        ));
    }

    #[test]
    fn test_replayed_cell_rejected() {
        let (mut client, mut relays) = setup(1);
        let reply = RelayCell::new(RelayCommand::Data, 1, vec![1, 2, 3]);
        let payload = relays[0].originate_inbound(&reply).unwrap();

        let mut first = payload.clone();
        assert!(client.decrypt_inbound(&mut first).is_ok());
        let mut replay = payload;
        assert!(client.decrypt_inbound(&mut replay).is_err());
    }

    #[test]
    fn test_target_out_of_range() {
        let (mut client, _) = setup(2);
        let cell = RelayCell::new(RelayCommand::Data, 1, vec![]);
        assert!(client.encrypt_outbound(&cell, 2).is_err());
    }

    #[test]
    fn test_swapped_keys_talk_to_each_other() {
        let k = CircuitKeys::derive_from_secret(&[9u8; 32]).unwrap();
        let mut client = OnionCrypto::new();
        client.add_hop(&k);
        let mut service = OnionCrypto::new();
        service.add_hop(&k.swapped());

        let cell = RelayCell::new(RelayCommand::Begin, 1, b":80\0".to_vec());
        let mut payload = client.encrypt_outbound(&cell, 0).unwrap();
        let (hop, seen) = service.decrypt_inbound(&mut payload).unwrap();
        assert_eq!(hop, 0);
        assert_eq!(seen.command, RelayCommand::Begin);

        let reply = RelayCell::new(RelayCommand::Connected, 1, vec![]);
        let mut payload = service.encrypt_outbound(&reply, 0).unwrap();
        let (_, seen) = client.decrypt_inbound(&mut payload).unwrap();
        assert_eq!(seen.command, RelayCommand::Connected);
    }
}
