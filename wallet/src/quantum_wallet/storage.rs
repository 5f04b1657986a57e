// Wallet persistence
// JSON record with the mnemonic, proof list and post-quantum key material

use bitcoin::Network;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroize;

use super::proof::QuantumProof;

/// Wallet type tag written to every record
pub const WALLET_TYPE: &str = "quantumProof";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn default_network() -> Network {
    Network::Bitcoin
}

/// Persisted wallet state
///
/// The record holds the mnemonic and the post-quantum secret key in plain
/// hex. Hosts must store it in encrypted storage.
#[derive(Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    #[serde(rename = "type")]
    pub wallet_type: String,

    /// BIP39 mnemonic
    pub secret: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub passphrase: String,

    #[serde(default = "default_network")]
    pub network: Network,

    #[serde(default)]
    pub next_free_address_index: u32,

    #[serde(default)]
    pub next_free_change_index: u32,

    /// Unreadable proof lists load as empty
    #[serde(rename = "_qProofs", default, deserialize_with = "lenient_proofs")]
    pub proofs: Vec<QuantumProof>,

    #[serde(rename = "_pqPublicKey", default, skip_serializing_if = "String::is_empty")]
    pub pq_public_key: String,

    #[serde(rename = "_pqPrivateKey", default, skip_serializing_if = "String::is_empty")]
    pub pq_private_key: String,

    #[serde(rename = "_pqDegraded", default)]
    pub pq_degraded: bool,
}

impl fmt::Debug for WalletRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletRecord")
            .field("wallet_type", &self.wallet_type)
            .field("network", &self.network)
            .field("proofs", &self.proofs.len())
            .field("pq_public_key", &self.pq_public_key)
            .field("pq_degraded", &self.pq_degraded)
            .finish_non_exhaustive()
    }
}

impl Drop for WalletRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
        self.passphrase.zeroize();
        self.pq_private_key.zeroize();
    }
}

fn lenient_proofs<'de, D>(deserializer: D) -> Result<Vec<QuantumProof>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "discarding unreadable proof list");
        Vec::new()
    }))
}

impl WalletRecord {
    pub fn from_json(text: &str) -> Result<Self, PersistenceError> {
        let record: Self = serde_json::from_str(text)
            .map_err(|e| PersistenceError::SerializationError(e.to_string()))?;
        if record.wallet_type != WALLET_TYPE {
            return Err(PersistenceError::SerializationError(format!(
                "unexpected wallet type '{}'",
                record.wallet_type
            )));
        }
        Ok(record)
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::SerializationError(e.to_string()))
    }

    /// Decoded (public, secret) post-quantum key bytes, if both are present
    pub fn pq_key_bytes(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, PersistenceError> {
        if self.pq_public_key.is_empty() || self.pq_private_key.is_empty() {
            return Ok(None);
        }
        let decode = |field: &str, text: &str| {
            hex::decode(text)
                .map_err(|e| PersistenceError::SerializationError(format!("{}: {}", field, e)))
        };
        Ok(Some((
            decode("_pqPublicKey", &self.pq_public_key)?,
            decode("_pqPrivateKey", &self.pq_private_key)?,
        )))
    }
}

/// File-backed record storage
pub struct WalletStorage;

impl WalletStorage {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<WalletRecord, PersistenceError> {
        let text = std::fs::read_to_string(path)?;
        WalletRecord::from_json(&text)
    }

    /// Write through a sibling temp file so a crash never leaves a torn record
    pub fn save<P: AsRef<Path>>(path: P, record: &WalletRecord) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, record.to_json()?)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> String {
        r#"{"type":"quantumProof","secret":"abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"}"#
            .to_string()
    }

    #[test]
    fn test_minimal_record_defaults() {
        let record = WalletRecord::from_json(&minimal()).unwrap();
        assert!(record.proofs.is_empty());
        assert!(record.pq_key_bytes().unwrap().is_none());
        assert_eq!(record.network, Network::Bitcoin);
        assert!(!record.pq_degraded);
    }

    #[test]
    fn test_malformed_proofs_load_empty() {
        let text = r#"{"type":"quantumProof","secret":"x","_qProofs":[{"id":1}]}"#;
        let record = WalletRecord::from_json(text).unwrap();
        assert!(record.proofs.is_empty());

        let text = r#"{"type":"quantumProof","secret":"x","_qProofs":"nonsense"}"#;
        assert!(WalletRecord::from_json(text).unwrap().proofs.is_empty());
    }

    #[test]
    fn test_malformed_record_is_serialization_error() {
        assert!(matches!(
            WalletRecord::from_json("{not json"),
            Err(PersistenceError::SerializationError(_))
        ));
        assert!(matches!(
            WalletRecord::from_json(r#"{"type":"quantumProof"}"#),
            Err(PersistenceError::SerializationError(_))
        ));
        assert!(matches!(
            WalletRecord::from_json(r#"{"type":"legacy","secret":"x"}"#),
            Err(PersistenceError::SerializationError(_))
        ));
    }

    #[test]
    fn test_bad_key_hex_rejected() {
        let text = r#"{"type":"quantumProof","secret":"x","_pqPublicKey":"zz","_pqPrivateKey":"00"}"#;
        let record = WalletRecord::from_json(text).unwrap();
        assert!(matches!(
            record.pq_key_bytes(),
            Err(PersistenceError::SerializationError(_))
        ));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let record = WalletRecord::from_json(&minimal()).unwrap();
        assert!(!format!("{:?}", record).contains("abandon"));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let record = WalletRecord::from_json(&minimal()).unwrap();
        WalletStorage::save(&path, &record).unwrap();

        let loaded = WalletStorage::load(&path).unwrap();
        assert_eq!(loaded.secret, record.secret);
        assert!(!path.with_extension("tmp").exists());
    }
}
