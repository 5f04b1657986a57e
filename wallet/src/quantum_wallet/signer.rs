//! Post-quantum signer with bounded signing time
//!
//! Hash-based signatures are slow on mobile hardware. Signing runs on the
//! blocking pool and races a timer; whichever finishes first decides the
//! result. A scheme signature that arrives after the timer fired lands in a
//! dropped channel and is discarded, so a late result never overrides the
//! fallback that was already returned.
//!
//! The fallback is a hash chain over the public key, message and time. It
//! keeps the wallet functional but is NOT a signature: anyone holding the
//! public key can produce one, and verification only checks its shape.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::hd_derivation::validate_entropy_quality;
use super::keypair::PqKeypair;
use super::scheme::{PqError, SignatureScheme, Sphincs128f};
use super::signature::{PqSignature, FALLBACK_SIGNATURE_LEN};

/// Signer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerState {
    Uninitialized,
    Ready,
    /// Keypair came from the hash fallback; every signature is a fallback
    Degraded,
}

/// Result of a signing request
#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub signature: PqSignature,
    /// Why the scheme signature was not used, when it was not
    pub fallback_reason: Option<PqError>,
}

pub struct PqSigner {
    scheme: Arc<dyn SignatureScheme>,
    keypair: Option<PqKeypair>,
    timeout: Duration,
    fallback_rounds: u32,
}

impl PqSigner {
    pub fn new(scheme: Arc<dyn SignatureScheme>, timeout: Duration, fallback_rounds: u32) -> Self {
        Self {
            scheme,
            keypair: None,
            timeout,
            fallback_rounds: fallback_rounds.max(1),
        }
    }

    /// SPHINCS+ signer with the given limits
    pub fn sphincs(timeout: Duration, fallback_rounds: u32) -> Self {
        Self::new(Arc::new(Sphincs128f), timeout, fallback_rounds)
    }

    pub fn scheme(&self) -> &dyn SignatureScheme {
        self.scheme.as_ref()
    }

    pub fn state(&self) -> SignerState {
        match &self.keypair {
            None => SignerState::Uninitialized,
            Some(keypair) if keypair.is_degraded() => SignerState::Degraded,
            Some(_) => SignerState::Ready,
        }
    }

    /// Derive the keypair from the wallet seed
    ///
    /// Returns the key-generation failure when the signer came up degraded.
    pub fn initialize(&mut self, seed: &[u8]) -> Result<Option<PqError>, PqError> {
        let (keypair, failure) = PqKeypair::derive(self.scheme.as_ref(), seed)?;
        tracing::debug!(
            algorithm = self.scheme.algorithm(),
            degraded = keypair.is_degraded(),
            "post-quantum keypair ready"
        );
        self.keypair = Some(keypair);
        Ok(failure)
    }

    /// Install a previously persisted keypair
    pub fn restore(&mut self, keypair: PqKeypair) {
        self.keypair = Some(keypair);
    }

    pub fn keypair(&self) -> Option<&PqKeypair> {
        self.keypair.as_ref()
    }

    pub fn public_key(&self) -> Option<&[u8]> {
        self.keypair.as_ref().map(|k| k.public_key())
    }

    /// Sign `message`, falling back to the hash chain on timeout or failure
    ///
    /// Only an uninitialized signer is an error.
    pub async fn sign(&self, message: &[u8]) -> Result<SignOutcome, PqError> {
        let keypair = self.keypair.as_ref().ok_or(PqError::NotInitialized)?;

        if keypair.is_degraded() {
            return Ok(SignOutcome {
                signature: self.fallback(keypair, message),
                fallback_reason: Some(PqError::DegradedKeypair),
            });
        }

        match self.sign_with_deadline(keypair, message).await {
            Ok(bytes) => Ok(SignOutcome {
                signature: PqSignature::Strong(bytes),
                fallback_reason: None,
            }),
            Err(reason) => {
                tracing::debug!(error = %reason, "post-quantum signing fell back to hash chain");
                Ok(SignOutcome {
                    signature: self.fallback(keypair, message),
                    fallback_reason: Some(reason),
                })
            }
        }
    }

    async fn sign_with_deadline(&self, keypair: &PqKeypair, message: &[u8]) -> Result<Vec<u8>, PqError> {
        let (sender, receiver) = oneshot::channel();
        let scheme = Arc::clone(&self.scheme);
        let secret = keypair.secret_key_owned();
        let message = message.to_vec();

        tokio::task::spawn_blocking(move || {
            // receiver is gone once the deadline passed
            let _ = sender.send(scheme.sign(&secret, &message));
        });

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PqError::SigningFailed(
                "signing task ended without a result".to_string(),
            )),
            Err(_) => Err(PqError::SigningTimeout(self.timeout)),
        }
    }

    fn fallback(&self, keypair: &PqKeypair, message: &[u8]) -> PqSignature {
        let timestamp = chrono::Utc::now().timestamp_millis();
        PqSignature::Fallback(fallback_hash_chain(
            keypair.public_key(),
            message,
            timestamp,
            self.fallback_rounds,
        ))
    }

    /// Verify against the stored public key
    pub fn verify(&self, message: &[u8], signature: &PqSignature) -> bool {
        match self.public_key() {
            Some(public_key) => verify_with_key(self.scheme.as_ref(), public_key, message, signature),
            None => false,
        }
    }
}

/// Iterated SHA-256 over public key, message and timestamp
pub fn fallback_hash_chain(public_key: &[u8], message: &[u8], timestamp_ms: i64, rounds: u32) -> Vec<u8> {
    let mut digest: [u8; 32] = Sha256::new()
        .chain_update(public_key)
        .chain_update(message)
        .chain_update(timestamp_ms.to_le_bytes())
        .finalize()
        .into();

    for _ in 1..rounds {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(public_key)
            .finalize()
            .into();
    }

    digest.to_vec()
}

/// Verify `signature` over `message` for `public_key`
///
/// Strong signatures are checked cryptographically. Fallback signatures only
/// pass a structural check; a `true` result for them proves nothing.
pub fn verify_with_key(
    scheme: &dyn SignatureScheme,
    public_key: &[u8],
    message: &[u8],
    signature: &PqSignature,
) -> bool {
    match signature {
        PqSignature::Strong(bytes) => scheme.verify(public_key, message, bytes),
        PqSignature::Fallback(bytes) => {
            bytes.len() == FALLBACK_SIGNATURE_LEN
                && !public_key.is_empty()
                && validate_entropy_quality(bytes).is_ok()
        }
    }
}
