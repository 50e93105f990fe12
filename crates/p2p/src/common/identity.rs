//! Node identity: the keypair a node authenticates sessions with.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{self, ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use dexd_types::PubKey;

/// Length of a session nonce.
pub const NONCE_SIZE: usize = 32;

/// An error constructing a node key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: {0}")]
    Secret(#[from] secp256k1::Error),
}

/// The daemon's long-lived identity keypair. The public half is the node's
/// identity on the overlay network; the secret half signs session nonces
/// during the handshake.
#[derive(Clone)]
pub struct NodeKey {
    secret: SecretKey,
    pub_key: PubKey,
}

impl NodeKey {
    /// Build a key from 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(bytes)?;
        let public = PublicKey::from_secret_key(&secp, &secret);

        let pub_key = PubKey::try_from(public.serialize().as_slice())
            .expect("compressed secp256k1 points are 33 bytes");

        Ok(Self { secret, pub_key })
    }

    /// Generate a fresh key from the given entropy source.
    pub fn generate(rng: &mut fastrand::Rng) -> Self {
        loop {
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);

            if let Ok(key) = Self::from_secret_bytes(&bytes) {
                return key;
            }
        }
    }

    /// The node's public identity.
    pub fn pub_key(&self) -> PubKey {
        self.pub_key
    }

    /// Sign a session nonce, proving possession of the identity key.
    pub fn sign(&self, nonce: &[u8]) -> Vec<u8> {
        let secp = Secp256k1::new();
        let digest = sha256::Hash::hash(nonce);
        let msg = Message::from_slice(digest.as_byte_array()).expect("sha256 digests are 32 bytes");

        secp.sign_ecdsa(&msg, &self.secret)
            .serialize_compact()
            .to_vec()
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret half.
        write!(f, "NodeKey({})", self.pub_key)
    }
}

/// Verify that `pub_key` signed `nonce`. Returns `false` for invalid keys,
/// malformed signatures, and verification failures alike.
pub fn verify(pub_key: &PubKey, nonce: &[u8], signature: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();

    let Ok(public) = PublicKey::from_slice(pub_key.as_bytes()) else {
        return false;
    };
    let Ok(sig) = ecdsa::Signature::from_compact(signature) else {
        return false;
    };
    let digest = sha256::Hash::hash(nonce);
    let msg = Message::from_slice(digest.as_byte_array()).expect("sha256 digests are 32 bytes");

    secp.verify_ecdsa(&msg, &sig, &public).is_ok()
}
