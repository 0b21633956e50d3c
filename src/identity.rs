//! # Peer Identity
//!
//! - [`Keypair`]: Ed25519 signing keypair used to author and sign messages
//! - [`PeerId`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! A peer is identified by its **Ed25519 public key**. Because the key is
//! embedded in the id, a message author can always be checked against the
//! signature without an external key lookup.
//!
//! `PeerId` has a total order (byte-wise), which the router uses as an
//! explicit tie-breaker wherever a selection must be deterministic.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a peer id from an arbitrary byte slice; `None` unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// First 8 bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Whether the id is a usable Ed25519 public key.
    pub fn is_valid(&self) -> bool {
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Deterministic test/demo id; not a valid public key in general.
    pub fn from_seed(seed: u64) -> Self {
        let hash = blake3::hash(&seed.to_be_bytes());
        Self(*hash.as_bytes())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<PeerId> for [u8; 32] {
    fn from(peer: PeerId) -> Self {
        peer.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().short())
            .finish_non_exhaustive()
    }
}

/// Initial value for a node's outbound sequence counter (wall-clock nanoseconds,
/// so sequence numbers keep increasing across restarts with the same key).
pub(crate) fn initial_seqno() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.peer_id(), kp2.peer_id());
        assert!(kp1.peer_id().is_valid());
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate();
        let message = b"hello world";

        let signature = kp.sign(message);
        assert!(kp.verify(message, &signature));
        assert!(!kp.verify(b"wrong message", &signature));
    }

    #[test]
    fn test_hex_roundtrip_and_length_check() {
        let id = Keypair::generate().peer_id();
        assert_eq!(PeerId::from_hex(&id.to_hex()).expect("valid hex"), id);
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_slice(&[0u8; 31]).is_none());
    }

    #[test]
    fn test_secret_key_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(kp.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_seed_ids_are_distinct_and_ordered() {
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        assert_ne!(a, b);
        assert_eq!(a.cmp(&b), a.as_bytes().cmp(b.as_bytes()));
    }
}
