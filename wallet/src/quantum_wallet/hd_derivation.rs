//! Post-quantum key material derivation
//!
//! The post-quantum keypair is recoverable from the same BIP39 seed as the
//! classical keys. Hash-based signature schemes have no algebraic child-key
//! derivation, so the seed is expanded with domain-separated hashing instead:
//!
//! - SHA3-512 over the seed and a domain tag seeds the scheme's key generator
//! - a SHA-256 chain over the seed yields the degraded fallback keypair
//!
//! No system entropy is mixed in; the same seed always yields the same keys.

use sha2::Sha256;
use sha3::{Digest, Sha3_512};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Domain tag for the strong keypair seed
const PQ_KEYGEN_DOMAIN: &[u8] = b"qproof-wallet/pq-keygen/v1";

/// Domain tag for the fallback keypair chain
const FALLBACK_DOMAIN: &[u8] = b"qproof-wallet/pq-fallback/v1";

/// Rounds of the fallback keypair hash chain
const FALLBACK_KEY_ROUNDS: usize = 2048;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("Insufficient entropy: {0}")]
    InsufficientEntropy(String),

    #[error("Low quality entropy detected: {0}")]
    LowQualityEntropy(String),
}

/// Minimum seed length accepted for post-quantum derivation
pub const MIN_SEED_BYTES: usize = 32;

/// Reject seeds with obvious signs of a broken generator
pub fn validate_entropy_quality(entropy: &[u8]) -> Result<(), DerivationError> {
    if entropy.is_empty() {
        return Err(DerivationError::InsufficientEntropy("Empty seed".to_string()));
    }

    // at most 1/8 zero or 0xFF bytes
    let max_repeats = entropy.len() / 8;
    let zeros = entropy.iter().filter(|&&b| b == 0).count();
    if zeros > max_repeats {
        return Err(DerivationError::LowQualityEntropy(format!(
            "Too many zero bytes: {} of {}",
            zeros,
            entropy.len()
        )));
    }
    let ones = entropy.iter().filter(|&&b| b == 0xFF).count();
    if ones > max_repeats {
        return Err(DerivationError::LowQualityEntropy(format!(
            "Too many 0xFF bytes: {} of {}",
            ones,
            entropy.len()
        )));
    }

    if entropy.len() > 1 && entropy.iter().all(|&b| b == entropy[0]) {
        return Err(DerivationError::LowQualityEntropy(
            "All bytes identical".to_string(),
        ));
    }

    Ok(())
}

/// Expands a wallet seed into post-quantum key material
pub struct PqSeedExpander {
    seed: Zeroizing<Vec<u8>>,
}

impl PqSeedExpander {
    pub fn from_seed(seed: &[u8]) -> Result<Self, DerivationError> {
        if seed.len() < MIN_SEED_BYTES {
            return Err(DerivationError::InsufficientEntropy(format!(
                "Seed too short: {} bytes < {} required",
                seed.len(),
                MIN_SEED_BYTES
            )));
        }
        validate_entropy_quality(seed)?;

        Ok(Self {
            seed: Zeroizing::new(seed.to_vec()),
        })
    }

    /// 32-byte seed for the signature scheme's deterministic key generator
    pub fn keygen_seed(&self) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha3_512::new();
        hasher.update(&*self.seed);
        hasher.update(PQ_KEYGEN_DOMAIN);
        let mut digest = hasher.finalize();

        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&digest[..32]);
        digest.as_mut_slice().zeroize();
        out
    }

    /// Fallback (public, secret) key bytes from an iterated SHA-256 chain
    pub fn fallback_keypair(&self) -> ([u8; 32], Zeroizing<[u8; 32]>) {
        let mut state: [u8; 32] = Sha256::new()
            .chain_update(&*self.seed)
            .chain_update(FALLBACK_DOMAIN)
            .finalize()
            .into();

        for round in 0..FALLBACK_KEY_ROUNDS {
            state = Sha256::new()
                .chain_update(state)
                .chain_update((round as u32).to_le_bytes())
                .finalize()
                .into();
        }

        let secret: [u8; 32] = Sha256::new()
            .chain_update(state)
            .chain_update(b"-private")
            .finalize()
            .into();
        let public: [u8; 32] = Sha256::new()
            .chain_update(secret)
            .chain_update(b"-public")
            .finalize()
            .into();
        state.zeroize();

        (public, Zeroizing::new(secret))
    }
}
