// Quantum proof records
// A balance attestation bound to a chain tip, signed classically and post-quantum

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::signature::PqSignature;

/// Prefix of the message covered by the classical signature
pub const CLASSICAL_MESSAGE_PREFIX: &str = "quantum-proof:";

/// Chain tip the proof refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReference {
    pub height: u64,
    pub hash: String,
}

impl BlockReference {
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }
}

/// Source of the current chain tip
#[async_trait]
pub trait BlockOracle: Send + Sync {
    async fn current_block(&self) -> Result<BlockReference, String>;
}

/// Serialized form both signatures commit to; field order is fixed
#[derive(Serialize)]
struct ProofPayload<'a> {
    btc_address: &'a str,
    balance: &'a str,
    block: &'a BlockReference,
    timestamp: &'a str,
}

/// Canonical JSON of the signed payload
pub fn canonical_payload(
    btc_address: &str,
    balance: &str,
    block: &BlockReference,
    timestamp: &str,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ProofPayload {
        btc_address,
        balance,
        block,
        timestamp,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantumProof {
    /// Creation time in milliseconds, unique per wallet
    pub id: String,
    pub btc_address: String,
    /// Balance in satoshis, as a decimal string
    pub balance: String,
    pub block: BlockReference,
    /// RFC 3339 creation time
    pub timestamp: String,
    /// BIP137 signature over the prefixed payload
    pub btc_signature: String,
    pub pq_signature: PqSignature,
    /// Hex of the post-quantum public key
    pub pq_pubkey: String,
}

impl QuantumProof {
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        canonical_payload(&self.btc_address, &self.balance, &self.block, &self.timestamp)
    }

    /// Message the classical signature covers
    pub fn classical_message(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{}{}", CLASSICAL_MESSAGE_PREFIX, self.payload()?))
    }

    pub fn is_strong(&self) -> bool {
        self.pq_signature.is_strong()
    }

    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
