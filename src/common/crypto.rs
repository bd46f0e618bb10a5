use ed25519_dalek::{ed25519, Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

pub type Digest = [u8; 64];

pub const SIGNATURE_SIZE: usize = 64;

/// Produces signatures with the local operator's share key.
///
/// Kept behind a trait so a remote signer (or a failing one in tests) can stand in for the
/// in-process key.
pub trait Signer: Send + Sync {
    fn sign_digest(&self, digest: &Digest) -> Result<[u8; SIGNATURE_SIZE], CryptoError>;
}

pub struct Keypair {
    pubkey: Pubkey,
    dalek_signer: SigningKey,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Pubkey {
    pub key: [u8; 32],
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Builds a keypair from raw secret bytes. Used for reproducible committees.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(dalek_signer: SigningKey) -> Self {
        let pubkey = Pubkey::from(&dalek_signer.verifying_key().to_bytes());
        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn sign(&self, digest: &Digest) -> [u8; SIGNATURE_SIZE] {
        self.dalek_signer.sign(digest).to_bytes()
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey.clone()
    }
}

impl Signer for Keypair {
    fn sign_digest(&self, digest: &Digest) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        Ok(self.sign(digest))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("pubkey", &self.pubkey).finish()
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for Pubkey {
    fn from(bytes: &[u8; 32]) -> Self {
        Pubkey { key: *bytes }
    }
}

impl std::fmt::Display for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.key))
    }
}

impl Pubkey {
    /// Strict ed25519 verification of a single 64-byte signature over `digest`.
    pub fn verify(&self, digest: &Digest, sig: &[u8]) -> Result<(), CryptoError> {
        let bytes: [u8; SIGNATURE_SIZE] =
            sig.try_into().map_err(|_| CryptoError::MalformedSignature {
                expected: SIGNATURE_SIZE,
                actual: sig.len(),
            })?;
        let dalek_sig = ed25519::Signature::from_bytes(&bytes);
        let dalek_pubkey =
            VerifyingKey::from_bytes(&self.key).map_err(|_| CryptoError::InvalidPublicKey)?;
        dalek_pubkey
            .verify_strict(digest, &dalek_sig)
            .map_err(|_| CryptoError::BadSignature)
    }
}
