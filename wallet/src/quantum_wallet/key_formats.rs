// Post-quantum public key encodings
// Hex, Base58 and a bech32m "bc" string with witness version 16

use bech32::{self, u5, FromBase32, ToBase32, Variant};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const PQ_HRP: &str = "bc";

/// Witness version carried by the post-quantum key string (bech32 symbol 's')
const PQ_WITNESS_VERSION: u8 = 16;

#[derive(Error, Debug)]
pub enum KeyFormatError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Bech32 encoding error: {0}")]
    Bech32Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyFormats {
    pub hex: String,
    pub base58: String,
    pub bc1s_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub algorithm: String,
    pub public_key_size: usize,
    pub quantum_resistant: bool,
}

/// Everything a host needs to display or export the post-quantum key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqKeyExport {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formats: Option<PublicKeyFormats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<PublicKeyInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PqKeyExport {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            available: false,
            formats: None,
            info: None,
            message: Some(message.into()),
        }
    }

    pub fn new(public_key: &[u8], algorithm: &str, quantum_resistant: bool) -> Result<Self, KeyFormatError> {
        Ok(Self {
            available: true,
            formats: Some(PublicKeyFormats {
                hex: hex::encode(public_key),
                base58: bs58::encode(public_key).into_string(),
                bc1s_address: bc1s_address(public_key)?,
            }),
            info: Some(PublicKeyInfo {
                algorithm: algorithm.to_string(),
                public_key_size: public_key.len(),
                quantum_resistant,
            }),
            message: None,
        })
    }
}

/// Bech32m string committing to SHA-256 of the public key
pub fn bc1s_address(public_key: &[u8]) -> Result<String, KeyFormatError> {
    let version = u5::try_from_u8(PQ_WITNESS_VERSION)
        .map_err(|e| KeyFormatError::Bech32Error(e.to_string()))?;

    let digest = Sha256::digest(public_key);
    let mut data = vec![version];
    data.extend(digest.to_base32());

    bech32::encode(PQ_HRP, data, Variant::Bech32m).map_err(|e| KeyFormatError::Bech32Error(e.to_string()))
}

/// Recover the key hash from a bc1s string
pub fn decode_bc1s_address(address: &str) -> Result<[u8; 32], KeyFormatError> {
    let (hrp, data, variant) =
        bech32::decode(address).map_err(|e| KeyFormatError::Bech32Error(e.to_string()))?;

    if hrp != PQ_HRP {
        return Err(KeyFormatError::InvalidFormat(format!(
            "Invalid prefix: expected '{}', got '{}'",
            PQ_HRP, hrp
        )));
    }
    if variant != Variant::Bech32m {
        return Err(KeyFormatError::InvalidFormat(
            "Invalid Bech32 variant: must use Bech32m".to_string(),
        ));
    }
    match data.first() {
        Some(version) if version.to_u8() == PQ_WITNESS_VERSION => {}
        _ => {
            return Err(KeyFormatError::InvalidFormat(
                "Missing post-quantum version symbol".to_string(),
            ))
        }
    }

    let decoded = Vec::<u8>::from_base32(&data[1..])
        .map_err(|e| KeyFormatError::Bech32Error(e.to_string()))?;
    decoded.try_into().map_err(|bytes: Vec<u8>| {
        KeyFormatError::InvalidFormat(format!(
            "Invalid hash length: expected 32 bytes, got {}",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bc1s_prefix_and_roundtrip() {
        let public_key = [0x5au8; 32];
        let address = bc1s_address(&public_key).unwrap();
        assert!(address.starts_with("bc1s"));

        let hash = decode_bc1s_address(&address).unwrap();
        assert_eq!(hash.as_slice(), Sha256::digest(public_key).as_slice());
    }

    #[test]
    fn test_classical_address_is_not_bc1s() {
        let result = decode_bc1s_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
        assert!(matches!(result, Err(KeyFormatError::InvalidFormat(_))));
    }

    #[test]
    fn test_export_fields() {
        let export = PqKeyExport::new(&[1, 2, 3], "SPHINCS+-SHA2-128f-simple", true).unwrap();
        let formats = export.formats.unwrap();
        assert_eq!(formats.hex, "010203");
        assert_eq!(formats.base58, "Ldp");
        let info = export.info.unwrap();
        assert_eq!(info.public_key_size, 3);
        assert!(info.quantum_resistant);
    }

    #[test]
    fn test_unavailable_carries_message() {
        let export = PqKeyExport::unavailable("not ready");
        assert!(!export.available);
        let json = serde_json::to_value(&export).unwrap();
        assert!(json.get("formats").is_none());
        assert_eq!(json["message"], "not ready");
    }
}
