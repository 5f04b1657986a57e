// Post-quantum keypair management
// Seed-derived keypairs with a hash-based degraded fallback

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use super::hd_derivation::PqSeedExpander;
use super::scheme::{PqError, SignatureScheme};

/// Whether the keypair belongs to the real post-quantum scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrength {
    Strong,
    /// Hash-derived stand-in used when scheme key generation fails
    Degraded,
}

/// Post-quantum keypair
///
/// The secret key is zeroized on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct PqKeypair {
    public_key: Vec<u8>,
    secret_key: Zeroizing<Vec<u8>>,
    strength: KeyStrength,
}

impl fmt::Debug for PqKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PqKeypair")
            .field("public_key", &hex::encode(&self.public_key))
            .field("secret_key", &"<redacted>")
            .field("strength", &self.strength)
            .finish()
    }
}

impl PartialEq for PqKeypair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
            && *self.secret_key == *other.secret_key
            && self.strength == other.strength
    }
}

impl Eq for PqKeypair {}

impl PqKeypair {
    /// Derive the wallet's keypair from its seed
    ///
    /// Scheme key-generation failure is not fatal: a degraded keypair is
    /// derived from the seed instead and the failure is returned alongside.
    pub fn derive(
        scheme: &dyn SignatureScheme,
        seed: &[u8],
    ) -> Result<(Self, Option<PqError>), PqError> {
        let expander = PqSeedExpander::from_seed(seed)?;

        match scheme.keypair_from_seed(&expander.keygen_seed()) {
            Ok((public_key, secret_key)) => Ok((
                Self {
                    public_key,
                    secret_key,
                    strength: KeyStrength::Strong,
                },
                None,
            )),
            Err(err) => {
                tracing::debug!(
                    algorithm = scheme.algorithm(),
                    error = %err,
                    "post-quantum key generation failed, using degraded keypair"
                );
                Ok((Self::degraded(&expander), Some(err)))
            }
        }
    }

    fn degraded(expander: &PqSeedExpander) -> Self {
        let (public, secret) = expander.fallback_keypair();
        Self {
            public_key: public.to_vec(),
            secret_key: Zeroizing::new(secret.to_vec()),
            strength: KeyStrength::Degraded,
        }
    }

    /// Rebuild a keypair from persisted bytes
    pub fn from_parts(
        public_key: Vec<u8>,
        secret_key: Vec<u8>,
        strength: KeyStrength,
    ) -> Result<Self, PqError> {
        if public_key.is_empty() || secret_key.is_empty() {
            return Err(PqError::InvalidKey("empty key material".to_string()));
        }
        Ok(Self {
            public_key,
            secret_key: Zeroizing::new(secret_key),
            strength,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }

    pub(crate) fn secret_key_owned(&self) -> Zeroizing<Vec<u8>> {
        self.secret_key.clone()
    }

    pub fn strength(&self) -> KeyStrength {
        self.strength
    }

    pub fn is_degraded(&self) -> bool {
        self.strength == KeyStrength::Degraded
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    pub fn secret_key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&*self.secret_key))
    }
}
