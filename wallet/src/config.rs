use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::transaction::{BuilderConfig, CoinSelectionStrategy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Largest accepted dust threshold (satoshis)
pub const MAX_DUST_THRESHOLD: u64 = 100_000;

/// Largest accepted address gap limit
pub const MAX_GAP_LIMIT: u32 = 10_000;

/// Wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Network used for address derivation and validation
    pub network: Network,

    /// Outputs at or below this value are dust (satoshis)
    pub dust_threshold: u64,

    /// Coin selection strategy
    pub coin_selection: CoinSelectionStrategy,

    /// Upper bound on a single post-quantum signing operation
    pub pq_sign_timeout_ms: u64,

    /// Rounds of the hash-chain used by the fallback signer
    pub fallback_hash_rounds: u32,

    /// Addresses scanned past the next free index when looking up signing keys
    pub gap_limit: u32,

    /// Maximum transaction size in virtual bytes
    pub max_tx_vbytes: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            dust_threshold: 546,
            coin_selection: CoinSelectionStrategy::BranchAndBound,
            pq_sign_timeout_ms: 30_000,
            fallback_hash_rounds: 1_000,
            gap_limit: 20,
            max_tx_vbytes: 100_000,
        }
    }
}

impl WalletConfig {
    /// Parse configuration from TOML; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pq_sign_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pq_sign_timeout_ms must be positive".to_string(),
            ));
        }
        if self.fallback_hash_rounds == 0 {
            return Err(ConfigError::Invalid(
                "fallback_hash_rounds must be positive".to_string(),
            ));
        }
        if self.dust_threshold > MAX_DUST_THRESHOLD {
            return Err(ConfigError::Invalid(format!(
                "dust_threshold {} exceeds {}",
                self.dust_threshold, MAX_DUST_THRESHOLD
            )));
        }
        if self.gap_limit > MAX_GAP_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "gap_limit {} exceeds {}",
                self.gap_limit, MAX_GAP_LIMIT
            )));
        }
        if self.max_tx_vbytes == 0 {
            return Err(ConfigError::Invalid(
                "max_tx_vbytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pq_sign_timeout(&self) -> Duration {
        Duration::from_millis(self.pq_sign_timeout_ms)
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            network: self.network,
            dust_threshold: self.dust_threshold,
            coin_selection: self.coin_selection,
            max_tx_vbytes: self.max_tx_vbytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WalletConfig::default();
        assert_eq!(config.dust_threshold, 546);
        assert_eq!(config.pq_sign_timeout(), Duration::from_secs(30));
        assert_eq!(config.network, Network::Bitcoin);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WalletConfig::from_toml_str(
            r#"
            network = "testnet"
            coin_selection = "largest_first"
            pq_sign_timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.coin_selection, CoinSelectionStrategy::LargestFirst);
        assert_eq!(config.pq_sign_timeout_ms, 500);
        assert_eq!(config.gap_limit, 20);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = WalletConfig::from_toml_str("pq_sign_timeout_ms = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_out_of_range_limits_rejected() {
        assert!(WalletConfig::from_toml_str("dust_threshold = 100000").is_ok());
        assert!(matches!(
            WalletConfig::from_toml_str("dust_threshold = 100001"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            WalletConfig::from_toml_str("gap_limit = 2147483647"),
            Err(ConfigError::Invalid(_))
        ));

        let config = WalletConfig {
            dust_threshold: u64::MAX,
            ..WalletConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.toml");
        std::fs::write(&path, "dust_threshold = 1000\n").unwrap();

        let config = WalletConfig::load(&path).unwrap();
        assert_eq!(config.dust_threshold, 1000);
    }
}
