// Spendable outputs and payment targets
// Read-only inputs to coin selection and transaction building

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtxoError {
    #[error("Invalid txid: {0}")]
    InvalidTxid(String),

    #[error("UTXO source unavailable: {0}")]
    SourceUnavailable(String),
}

/// Unspent transaction output as reported by the wallet's UTXO source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Transaction ID (hex, display byte order)
    pub txid: String,

    /// Output index in transaction
    pub vout: u32,

    /// Amount in satoshis
    pub value: u64,

    /// Address that owns this UTXO
    pub address: String,

    /// Number of confirmations, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,

    /// Frozen outputs are reported with `include_frozen` but never selected
    #[serde(default)]
    pub frozen: bool,
}

impl Utxo {
    pub fn new(txid: impl Into<String>, vout: u32, value: u64, address: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            vout,
            value,
            address: address.into(),
            confirmations: None,
            frozen: false,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = Some(confirmations);
        self
    }

    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// Get outpoint as string
    pub fn outpoint_string(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }

    pub fn outpoint(&self) -> Result<OutPoint, UtxoError> {
        let txid = Txid::from_str(&self.txid)
            .map_err(|e| UtxoError::InvalidTxid(format!("{}: {}", self.txid, e)))?;
        Ok(OutPoint::new(txid, self.vout))
    }

    /// Unconfirmed means the source explicitly reported zero confirmations
    pub fn is_unconfirmed(&self) -> bool {
        self.confirmations == Some(0)
    }
}

/// Value of a payment target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetValue {
    /// Fixed amount in satoshis
    Amount(u64),
    /// Absorb whatever remains after fee and the other targets
    SendAll,
}

/// Payment destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub address: String,
    pub value: TargetValue,
}

impl Target {
    pub fn amount(address: impl Into<String>, value: u64) -> Self {
        Self {
            address: address.into(),
            value: TargetValue::Amount(value),
        }
    }

    pub fn send_all(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            value: TargetValue::SendAll,
        }
    }

    pub fn is_send_all(&self) -> bool {
        matches!(self.value, TargetValue::SendAll)
    }

    pub fn fixed_value(&self) -> Option<u64> {
        match self.value {
            TargetValue::Amount(v) => Some(v),
            TargetValue::SendAll => None,
        }
    }
}

/// Collaborator that reports the wallet's spendable outputs
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn get_utxo(&self, include_frozen: bool) -> Result<Vec<Utxo>, UtxoError>;
}

/// Fixed UTXO list, useful for hosts that already hold a snapshot
#[derive(Debug, Clone, Default)]
pub struct StaticUtxoSource {
    utxos: Vec<Utxo>,
}

impl StaticUtxoSource {
    pub fn new(utxos: Vec<Utxo>) -> Self {
        Self { utxos }
    }
}

#[async_trait]
impl UtxoSource for StaticUtxoSource {
    async fn get_utxo(&self, include_frozen: bool) -> Result<Vec<Utxo>, UtxoError> {
        Ok(self
            .utxos
            .iter()
            .filter(|u| include_frozen || !u.frozen)
            .cloned()
            .collect())
    }
}

/// Sum of spendable (non-frozen) values
pub fn spendable_balance(utxos: &[Utxo]) -> u64 {
    utxos
        .iter()
        .filter(|u| !u.frozen)
        .fold(0u64, |acc, u| acc.saturating_add(u.value))
}
