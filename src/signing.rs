//! # Message Signing
//!
//! Authored messages carry an Ed25519 signature over a canonical encoding.
//!
//! ## Canonical Bytes
//!
//! `MESSAGE_SIGNATURE_DOMAIN || bincode(message with signature and key cleared)`
//!
//! Domain separation ensures a message signature can never be replayed as any
//! other kind of signed object.
//!
//! ## Signature Policies
//!
//! | Policy | Outbound | Inbound |
//! |--------|----------|---------|
//! | `StrictSign` (required) | author + seqno + signature | signature required and verified |
//! | `LaxSign` (optional) | author + seqno + signature | verified when present |
//! | `StrictNoSign` (disabled) | anonymous | any signature or author info rejected |

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::identity::{Keypair, PeerId};
use crate::messages::{Message, encoded_len};

/// Domain separation prefix for message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"meshsub-message-v1:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    #[default]
    StrictSign,
    LaxSign,
    StrictNoSign,
}

impl SignaturePolicy {
    /// Whether outbound messages are authored and signed.
    pub fn must_sign(self) -> bool {
        matches!(self, SignaturePolicy::StrictSign | SignaturePolicy::LaxSign)
    }

    /// Whether inbound messages must carry a valid signature.
    pub fn must_verify(self) -> bool {
        matches!(self, SignaturePolicy::StrictSign)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// The message has no author to verify against.
    MissingAuthor,
    /// The explicit key does not belong to the declared author.
    AuthorMismatch,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::MissingAuthor => write!(f, "signed message has no author"),
            SignatureError::AuthorMismatch => write!(f, "signing key does not match author"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Canonical bytes covered by a message signature.
pub fn signing_bytes(message: &Message) -> Vec<u8> {
    let unsigned = Message {
        signature: None,
        key: None,
        ..message.clone()
    };
    let mut out = Vec::with_capacity(MESSAGE_SIGNATURE_DOMAIN.len() + encoded_len(&unsigned));
    out.extend_from_slice(MESSAGE_SIGNATURE_DOMAIN);
    // Serializing plain data into a Vec cannot fail.
    if let Ok(encoded) = bincode::serialize(&unsigned) {
        out.extend_from_slice(&encoded);
    }
    out
}

/// Sign `message` in place as its author.
///
/// The key field stays empty: the author id is itself the public key.
pub fn sign_message(keypair: &Keypair, message: &mut Message) {
    message.from = Some(keypair.peer_id());
    message.signature = None;
    message.key = None;
    let bytes = signing_bytes(message);
    message.signature = Some(keypair.sign(&bytes).to_bytes().to_vec());
}

/// Verify the signature on `message` against its declared author.
pub fn verify_message(message: &Message) -> Result<(), SignatureError> {
    let signature = match message.signature.as_deref() {
        None | Some([]) => return Err(SignatureError::Missing),
        Some(sig) => sig,
    };
    let author = message.from.ok_or(SignatureError::MissingAuthor)?;

    let key_bytes: &[u8] = match message.key.as_deref() {
        Some(key) => {
            if PeerId::from_slice(key) != Some(author) {
                return Err(SignatureError::AuthorMismatch);
            }
            key
        }
        None => author.as_bytes(),
    };

    let verifying_key =
        VerifyingKey::try_from(key_bytes).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(&signing_bytes(message), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            data: b"payload".to_vec(),
            topic: "blocks".into(),
            seqno: Some(42),
            ..Message::default()
        }
    }

    #[test]
    fn sign_then_verify() {
        let kp = Keypair::generate();
        let mut msg = message();
        sign_message(&kp, &mut msg);

        assert_eq!(msg.from, Some(kp.peer_id()));
        assert!(msg.key.is_none());
        assert!(verify_message(&msg).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let kp = Keypair::generate();
        let mut msg = message();
        sign_message(&kp, &mut msg);
        msg.data.push(0);

        assert_eq!(verify_message(&msg), Err(SignatureError::VerificationFailed));
    }

    #[test]
    fn spoofed_author_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut msg = message();
        sign_message(&kp, &mut msg);
        msg.from = Some(other.peer_id());

        assert_eq!(verify_message(&msg), Err(SignatureError::VerificationFailed));
    }

    #[test]
    fn explicit_key_must_match_author() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut msg = message();
        sign_message(&kp, &mut msg);

        msg.key = Some(kp.public_key_bytes().to_vec());
        assert!(verify_message(&msg).is_ok());

        msg.key = Some(other.public_key_bytes().to_vec());
        assert_eq!(verify_message(&msg), Err(SignatureError::AuthorMismatch));
    }

    #[test]
    fn missing_and_malformed_signatures() {
        let kp = Keypair::generate();
        let mut msg = message();
        msg.from = Some(kp.peer_id());
        assert_eq!(verify_message(&msg), Err(SignatureError::Missing));

        msg.signature = Some(vec![1, 2, 3]);
        assert_eq!(verify_message(&msg), Err(SignatureError::InvalidLength));

        let mut anon = message();
        anon.signature = Some(vec![0u8; 64]);
        assert_eq!(verify_message(&anon), Err(SignatureError::MissingAuthor));
    }

    #[test]
    fn policy_flags() {
        assert!(SignaturePolicy::StrictSign.must_sign());
        assert!(SignaturePolicy::StrictSign.must_verify());
        assert!(SignaturePolicy::LaxSign.must_sign());
        assert!(!SignaturePolicy::LaxSign.must_verify());
        assert!(!SignaturePolicy::StrictNoSign.must_sign());
    }
}
