// Tagged post-quantum signatures
// Wire format: "sphincs_<hex>" for the real scheme, "fallback_<hex>" for the hash chain

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const STRONG_PREFIX: &str = "sphincs_";
pub const FALLBACK_PREFIX: &str = "fallback_";

/// Length of a fallback hash-chain signature
pub const FALLBACK_SIGNATURE_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureParseError {
    #[error("Unknown signature tag: {0}")]
    UnknownTag(String),

    #[error("Invalid signature hex: {0}")]
    InvalidHex(String),
}

/// A post-quantum signature, tagged by how it was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PqSignature {
    /// Produced by the post-quantum scheme
    Strong(Vec<u8>),
    /// Hash-chain stand-in; not a cryptographic signature
    Fallback(Vec<u8>),
}

impl PqSignature {
    pub fn is_strong(&self) -> bool {
        matches!(self, PqSignature::Strong(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            PqSignature::Strong(bytes) | PqSignature::Fallback(bytes) => bytes,
        }
    }
}

impl fmt::Display for PqSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PqSignature::Strong(bytes) => write!(f, "{}{}", STRONG_PREFIX, hex::encode(bytes)),
            PqSignature::Fallback(bytes) => write!(f, "{}{}", FALLBACK_PREFIX, hex::encode(bytes)),
        }
    }
}

impl FromStr for PqSignature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decode = |body: &str| {
            hex::decode(body).map_err(|e| SignatureParseError::InvalidHex(e.to_string()))
        };

        if let Some(body) = s.strip_prefix(STRONG_PREFIX) {
            Ok(PqSignature::Strong(decode(body)?))
        } else if let Some(body) = s.strip_prefix(FALLBACK_PREFIX) {
            Ok(PqSignature::Fallback(decode(body)?))
        } else {
            let tag: String = s.chars().take_while(|c| *c != '_').take(16).collect();
            Err(SignatureParseError::UnknownTag(tag))
        }
    }
}

impl TryFrom<String> for PqSignature {
    type Error = SignatureParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PqSignature> for String {
    fn from(signature: PqSignature) -> Self {
        signature.to_string()
    }
}
