use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bip39::{Language, Mnemonic};
use bitcoin::{
    bip32::{DerivationPath, Xpriv},
    hashes::Hash,
    secp256k1::{
        ecdsa::{RecoverableSignature, RecoveryId},
        All, Message, PublicKey as SecpPublicKey, Secp256k1, SecretKey,
    },
    sign_message::signed_msg_hash,
    Address, Network, PublicKey,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Highest non-hardened child index
pub const MAX_NORMAL_INDEX: u32 = 0x7FFF_FFFF;

/// BIP137 header base for P2WPKH signatures
const SEGWIT_HEADER_BASE: u8 = 39;

#[derive(Error, Debug)]
pub enum HdError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Invalid derivation index: {0}")]
    InvalidIndex(u32),
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),
    #[error("Address error: {0}")]
    Address(String),
    #[error("No signing key for address: {0}")]
    KeyNotFound(String),
    #[error("Invalid message signature: {0}")]
    InvalidSignature(String),
}

/// BIP44-style chain within the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    External,
    Change,
}

impl Chain {
    fn index(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Change => 1,
        }
    }
}

/// Caller-maintained address counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub next_free_address_index: u32,
    pub next_free_change_index: u32,
}

impl AccountState {
    pub fn new(next_free_address_index: u32, next_free_change_index: u32) -> Self {
        Self {
            next_free_address_index,
            next_free_change_index,
        }
    }

    fn next_free(&self, chain: Chain) -> u32 {
        match chain {
            Chain::External => self.next_free_address_index,
            Chain::Change => self.next_free_change_index,
        }
    }
}

/// BIP84 native segwit keychain derived from a BIP39 mnemonic
#[derive(Clone)]
pub struct HdKeychain {
    mnemonic: Zeroizing<String>,
    passphrase: Zeroizing<String>,
    seed: Zeroizing<Vec<u8>>,
    master: Xpriv,
    network: Network,
    secp: Secp256k1<All>,
}

impl fmt::Debug for HdKeychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdKeychain")
            .field("network", &self.network)
            .field("mnemonic", &"<redacted>")
            .finish()
    }
}

impl HdKeychain {
    /// Create a keychain with a fresh 12-word mnemonic from OS entropy
    pub fn generate(network: Network) -> Result<Self, HdError> {
        // 128 bits of entropy for a 12-word mnemonic
        let mut entropy = [0u8; 16];
        OsRng.fill_bytes(&mut entropy);

        let mnemonic = Mnemonic::from_entropy(&entropy)
            .map_err(|e| HdError::InvalidMnemonic(e.to_string()));
        entropy.zeroize();

        Self::from_mnemonic(&mnemonic?.to_string(), "", network)
    }

    pub fn from_mnemonic(phrase: &str, passphrase: &str, network: Network) -> Result<Self, HdError> {
        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase.trim())
            .map_err(|e| HdError::InvalidMnemonic(e.to_string()))?;

        let seed = Zeroizing::new(mnemonic.to_seed(passphrase).to_vec());
        let master = Xpriv::new_master(network, &seed)
            .map_err(|e| HdError::KeyDerivation(e.to_string()))?;

        Ok(Self {
            mnemonic: Zeroizing::new(mnemonic.to_string()),
            passphrase: Zeroizing::new(passphrase.to_string()),
            seed,
            master,
            network,
            secp: Secp256k1::new(),
        })
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// BIP39 seed bytes
    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn coin_type(&self) -> u32 {
        match self.network {
            Network::Bitcoin => 0,
            _ => 1,
        }
    }

    pub fn derivation_path(&self, chain: Chain, index: u32) -> Result<DerivationPath, HdError> {
        if index > MAX_NORMAL_INDEX {
            return Err(HdError::InvalidIndex(index));
        }
        DerivationPath::from_str(&format!(
            "m/84'/{}'/0'/{}/{}",
            self.coin_type(),
            chain.index(),
            index
        ))
        .map_err(|e| HdError::KeyDerivation(e.to_string()))
    }

    pub fn private_key(&self, chain: Chain, index: u32) -> Result<SecretKey, HdError> {
        let path = self.derivation_path(chain, index)?;
        let child = self
            .master
            .derive_priv(&self.secp, &path)
            .map_err(|e| HdError::KeyDerivation(e.to_string()))?;
        Ok(child.private_key)
    }

    pub fn public_key(&self, chain: Chain, index: u32) -> Result<PublicKey, HdError> {
        let secret = self.private_key(chain, index)?;
        Ok(PublicKey::new(SecpPublicKey::from_secret_key(
            &self.secp, &secret,
        )))
    }

    pub fn address(&self, chain: Chain, index: u32) -> Result<Address, HdError> {
        let public_key = self.public_key(chain, index)?;
        Address::p2wpkh(&public_key, self.network).map_err(|e| HdError::Address(e.to_string()))
    }

    pub fn external_address(&self, index: u32) -> Result<Address, HdError> {
        self.address(Chain::External, index)
    }

    pub fn change_address(&self, index: u32) -> Result<Address, HdError> {
        self.address(Chain::Change, index)
    }

    /// Locate the key for `address` within the used range plus `gap_limit`
    pub fn find_key(
        &self,
        address: &str,
        account: &AccountState,
        gap_limit: u32,
    ) -> Result<(SecretKey, PublicKey), HdError> {
        let wanted = parse_address(address, self.network)?;

        for chain in [Chain::External, Chain::Change] {
            let end = account.next_free(chain).saturating_add(gap_limit).min(MAX_NORMAL_INDEX);
            for index in 0..=end {
                if self.address(chain, index)? == wanted {
                    let secret = self.private_key(chain, index)?;
                    let public = PublicKey::new(SecpPublicKey::from_secret_key(&self.secp, &secret));
                    return Ok((secret, public));
                }
            }
        }

        Err(HdError::KeyNotFound(address.to_string()))
    }

    /// Sign `message` with the key behind `address` (BIP137, base64)
    pub fn sign_message(
        &self,
        message: &str,
        address: &str,
        account: &AccountState,
        gap_limit: u32,
    ) -> Result<String, HdError> {
        let (secret, _) = self.find_key(address, account, gap_limit)?;

        let digest = Message::from_digest(signed_msg_hash(message).to_byte_array());
        let signature = self.secp.sign_ecdsa_recoverable(&digest, &secret);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut encoded = [0u8; 65];
        encoded[0] = SEGWIT_HEADER_BASE + recovery_id.to_i32() as u8;
        encoded[1..].copy_from_slice(&compact);

        Ok(BASE64.encode(encoded))
    }
}

pub fn parse_address(address: &str, network: Network) -> Result<Address, HdError> {
    Address::from_str(address.trim())
        .map_err(|e| HdError::Address(format!("{}: {}", address, e)))?
        .require_network(network)
        .map_err(|e| HdError::Address(format!("{}: {}", address, e)))
}

/// Verify a BIP137 signed message against `address`
///
/// Compressed keys are accepted for any single-key address type they control,
/// matching signers that always use the legacy header range.
pub fn verify_message(
    message: &str,
    address: &str,
    signature: &str,
    network: Network,
) -> Result<bool, HdError> {
    let wanted = parse_address(address, network)?;

    let bytes = BASE64
        .decode(signature.trim())
        .map_err(|e| HdError::InvalidSignature(e.to_string()))?;
    if bytes.len() != 65 {
        return Err(HdError::InvalidSignature(format!(
            "expected 65 bytes, got {}",
            bytes.len()
        )));
    }

    let header = bytes[0];
    if !(27..=42).contains(&header) {
        return Err(HdError::InvalidSignature(format!("bad header byte {}", header)));
    }
    let compressed = header >= 31;
    let recovery_id = RecoveryId::from_i32(((header - 27) & 3) as i32)
        .map_err(|e| HdError::InvalidSignature(e.to_string()))?;
    let signature = RecoverableSignature::from_compact(&bytes[1..], recovery_id)
        .map_err(|e| HdError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    let digest = Message::from_digest(signed_msg_hash(message).to_byte_array());
    let recovered = match secp.recover_ecdsa(&digest, &signature) {
        Ok(key) => key,
        Err(_) => return Ok(false),
    };

    let mut public_key = PublicKey::new(recovered);
    public_key.compressed = compressed;

    if Address::p2pkh(&public_key, network) == wanted {
        return Ok(true);
    }
    if !compressed {
        return Ok(false);
    }
    let segwit = Address::p2wpkh(&public_key, network).map_err(|e| HdError::Address(e.to_string()))?;
    let nested = Address::p2shwpkh(&public_key, network).map_err(|e| HdError::Address(e.to_string()))?;
    Ok(segwit == wanted || nested == wanted)
}
