// Post-quantum signature schemes
// SLH-DSA (SPHINCS+) with keys generated from a wallet-derived seed

use fips205::slh_dsa_sha2_128f;
use fips205::traits::{SerDes, Signer, Verifier};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

use super::hd_derivation::DerivationError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PqError {
    #[error("Post-quantum signer is not initialized")]
    NotInitialized,

    #[error("Keypair generation failed: {0}")]
    KeypairGenerationFailed(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Signing timed out after {0:?}")]
    SigningTimeout(Duration),

    #[error("Keypair is degraded; strong signing unavailable")]
    DegradedKeypair,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Seed rejected: {0}")]
    Derivation(#[from] DerivationError),
}

/// A post-quantum signature algorithm
///
/// Implementations must be deterministic in key generation: the same seed
/// yields the same keypair.
pub trait SignatureScheme: Send + Sync {
    /// Human-readable algorithm name
    fn algorithm(&self) -> &'static str;

    /// Generate (public, secret) key bytes from a 32-byte seed
    fn keypair_from_seed(&self, seed: &[u8; 32]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), PqError>;

    fn sign(&self, secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, PqError>;

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// SLH-DSA-SHA2-128f (SPHINCS+-SHA2-128f-simple)
#[derive(Debug, Default, Clone, Copy)]
pub struct Sphincs128f;

impl Sphincs128f {
    pub const PUBLIC_KEY_LEN: usize = slh_dsa_sha2_128f::PK_LEN;
    pub const SECRET_KEY_LEN: usize = slh_dsa_sha2_128f::SK_LEN;
    pub const SIGNATURE_LEN: usize = slh_dsa_sha2_128f::SIG_LEN;
}

/// Empty context string for all signatures
const CONTEXT: &[u8] = b"";

impl SignatureScheme for Sphincs128f {
    fn algorithm(&self) -> &'static str {
        "SPHINCS+-SHA2-128f-simple"
    }

    fn keypair_from_seed(&self, seed: &[u8; 32]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), PqError> {
        let mut rng = ChaCha20Rng::from_seed(*seed);
        let (public, secret) = slh_dsa_sha2_128f::try_keygen_with_rng(&mut rng)
            .map_err(|e| PqError::KeypairGenerationFailed(e.to_string()))?;

        Ok((
            public.into_bytes().to_vec(),
            Zeroizing::new(secret.into_bytes().to_vec()),
        ))
    }

    fn sign(&self, secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, PqError> {
        let bytes: [u8; slh_dsa_sha2_128f::SK_LEN] = secret_key
            .try_into()
            .map_err(|_| PqError::InvalidKey(format!("secret key must be {} bytes", Self::SECRET_KEY_LEN)))?;
        let secret = slh_dsa_sha2_128f::PrivateKey::try_from_bytes(&bytes)
            .map_err(|e| PqError::InvalidKey(e.to_string()))?;

        // deterministic variant: no randomness at signing time
        let signature = secret
            .try_sign(message, CONTEXT, false)
            .map_err(|e| PqError::SigningFailed(e.to_string()))?;

        Ok(signature.to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; slh_dsa_sha2_128f::PK_LEN]>::try_from(public_key) else {
            return false;
        };
        let Ok(signature) = <[u8; slh_dsa_sha2_128f::SIG_LEN]>::try_from(signature) else {
            return false;
        };
        let Ok(public) = slh_dsa_sha2_128f::PublicKey::try_from_bytes(&key_bytes) else {
            return false;
        };

        public.verify(message, &signature, CONTEXT)
    }
}
