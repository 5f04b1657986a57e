//! Fee tiers, the cached fee oracle and fee precalculation
//!
//! Precalculation runs coin selection once per tier so a host can show the
//! absolute fee for each choice. When the funds cannot cover every target,
//! one retry is made with the first target sending everything and the rest
//! collapsed to the dust minimum; there is never a second retry.

use async_trait::async_trait;
use bitcoin::{Network, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::events::{EventListener, WalletEvent};
use crate::hdwallet::parse_address;
use crate::transaction::{CoinSelector, SelectionError, SelectionTarget};
use crate::utxo::{Target, TargetValue, Utxo};

/// Storage key of the last good oracle response
pub const FEE_CACHE_KEY: &str = "NetworkTransactionFee";

/// Value of placeholder targets used only for sizing
pub const PLACEHOLDER_VALUE: u64 = 546;

/// Mainnet address standing in for missing or invalid targets
pub const PLACEHOLDER_ADDRESS: &str = "36JxaUrpDzkEerkTf1FzwHNE1Hb7cCjgJV";

#[derive(Error, Debug)]
pub enum FeeError {
    #[error("Fee oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Fee storage error: {0}")]
    Storage(String),
}

/// Recommended fee rates in sat/vbyte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFees {
    pub slow_fee: u64,
    pub medium_fee: u64,
    pub fastest_fee: u64,
}

impl Default for NetworkFees {
    fn default() -> Self {
        Self {
            slow_fee: 1,
            medium_fee: 2,
            fastest_fee: 3,
        }
    }
}

impl NetworkFees {
    pub fn is_valid(&self) -> bool {
        self.slow_fee > 0 && self.medium_fee > 0 && self.fastest_fee > 0
    }
}

#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn recommended_fees(&self) -> Result<NetworkFees, FeeError>;
}

/// Host-provided string storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, FeeError>;
    async fn set_item(&self, key: &str, value: String) -> Result<(), FeeError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, FeeError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), FeeError> {
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// Oracle responses persisted so a stale value survives outages
pub struct FeeCache<S> {
    store: S,
}

impl<S: KeyValueStore> FeeCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Last persisted fees, or the defaults
    pub async fn cached(&self) -> NetworkFees {
        let stored = match self.store.get_item(FEE_CACHE_KEY).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::debug!(error = %e, "fee cache read failed");
                None
            }
        };

        stored
            .and_then(|text| serde_json::from_str::<NetworkFees>(&text).ok())
            .filter(NetworkFees::is_valid)
            .unwrap_or_default()
    }

    /// Ask the oracle, persisting a good answer; on failure serve the cache
    pub async fn refresh(&self, oracle: &dyn FeeOracle) -> NetworkFees {
        match oracle.recommended_fees().await {
            Ok(fees) if fees.is_valid() => {
                match serde_json::to_string(&fees) {
                    Ok(text) => {
                        if let Err(e) = self.store.set_item(FEE_CACHE_KEY, text).await {
                            tracing::debug!(error = %e, "fee cache write failed");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "fee encoding failed"),
                }
                fees
            }
            Ok(fees) => {
                tracing::debug!(?fees, "oracle returned zero fee rate, using cache");
                self.cached().await
            }
            Err(e) => {
                tracing::debug!(error = %e, "fee oracle unavailable, using cache");
                self.cached().await
            }
        }
    }
}

/// Absolute fee in satoshis per tier; `None` when the tier cannot be funded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePrecalc {
    pub current: Option<u64>,
    pub slow: Option<u64>,
    pub medium: Option<u64>,
    pub fastest: Option<u64>,
}

impl FeePrecalc {
    /// Fastest tier rate that can still be funded, or the fastest rate if none can
    pub fn recommended_rate(&self, fees: &NetworkFees) -> u64 {
        if self.fastest.is_some() {
            fees.fastest_fee
        } else if self.medium.is_some() {
            fees.medium_fee
        } else if self.slow.is_some() {
            fees.slow_fee
        } else {
            fees.fastest_fee
        }
    }
}

/// Inputs to [`precalculate_fees`]
pub struct PrecalcRequest<'a> {
    pub utxos: &'a [Utxo],
    pub targets: &'a [Target],
    pub change_script: &'a ScriptBuf,
    pub network: Network,
    pub allows_unconfirmed: bool,
}

/// Fee for every tier plus the caller's current rate
pub fn precalculate_fees(
    selector: &CoinSelector,
    request: &PrecalcRequest<'_>,
    fees: &NetworkFees,
    current_rate: u64,
    listener: &dyn EventListener,
) -> FeePrecalc {
    let targets = sizing_targets(request);

    let tier = |name: &str, rate: u64| -> Option<u64> {
        match fee_with_retry(selector, request, &targets, rate) {
            Ok(fee) => Some(fee),
            Err(e) => {
                tracing::debug!(tier = name, fee_rate = rate, error = %e, "fee tier unavailable");
                listener.on_event(&WalletEvent::FeeTierUnavailable {
                    tier: name.to_string(),
                    reason: e.to_string(),
                });
                None
            }
        }
    };

    FeePrecalc {
        current: tier("current", current_rate),
        slow: tier("slow", fees.slow_fee),
        medium: tier("medium", fees.medium_fee),
        fastest: tier("fastest", fees.fastest_fee),
    }
}

fn fee_with_retry(
    selector: &CoinSelector,
    request: &PrecalcRequest<'_>,
    targets: &[SelectionTarget],
    fee_rate: u64,
) -> Result<u64, SelectionError> {
    let select = |targets: &[SelectionTarget]| {
        selector
            .select(
                request.utxos,
                targets,
                request.change_script,
                fee_rate,
                request.allows_unconfirmed,
            )
            .map(|s| s.fee)
    };

    match select(targets) {
        Err(SelectionError::InsufficientFunds { .. }) => select(&degraded_targets(targets)),
        other => other,
    }
}

/// First target absorbs everything, the rest shrink to the dust minimum
fn degraded_targets(targets: &[SelectionTarget]) -> Vec<SelectionTarget> {
    targets
        .iter()
        .enumerate()
        .map(|(index, target)| SelectionTarget {
            script_pubkey: target.script_pubkey.clone(),
            value: if index == 0 {
                TargetValue::SendAll
            } else {
                TargetValue::Amount(PLACEHOLDER_VALUE)
            },
        })
        .collect()
}

/// Targets used for sizing, with placeholders for anything unusable
fn sizing_targets(request: &PrecalcRequest<'_>) -> Vec<SelectionTarget> {
    let placeholder = placeholder_script(request.network, request.change_script);
    let script = |address: &str| {
        parse_address(address, request.network)
            .map(|a| a.script_pubkey())
            .unwrap_or_else(|_| placeholder.clone())
    };

    if let Some(send_all) = request.targets.iter().find(|t| t.is_send_all()) {
        return vec![SelectionTarget {
            script_pubkey: script(&send_all.address),
            value: TargetValue::SendAll,
        }];
    }

    let targets: Vec<SelectionTarget> = request
        .targets
        .iter()
        .filter_map(|t| t.fixed_value().filter(|v| *v > 0).map(|v| (t, v)))
        .map(|(t, value)| SelectionTarget {
            script_pubkey: script(&t.address),
            value: TargetValue::Amount(value),
        })
        .collect();

    if targets.is_empty() {
        vec![SelectionTarget {
            script_pubkey: placeholder,
            value: TargetValue::Amount(PLACEHOLDER_VALUE),
        }]
    } else {
        targets
    }
}

/// Placeholder address script on mainnet, the wallet's own change script elsewhere
fn placeholder_script(network: Network, change_script: &ScriptBuf) -> ScriptBuf {
    match network {
        Network::Bitcoin => parse_address(PLACEHOLDER_ADDRESS, network)
            .map(|a| a.script_pubkey())
            .unwrap_or_else(|_| change_script.clone()),
        _ => change_script.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NoopListener, RecordingListener};
    use crate::transaction::CoinSelectionStrategy;
    use bitcoin::hashes::Hash;
    use bitcoin::WPubkeyHash;

    const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
    const RECIPIENT: &str = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";

    fn change() -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::all_zeros())
    }

    fn selector() -> CoinSelector {
        CoinSelector::new(CoinSelectionStrategy::LargestFirst, 546)
    }

    fn utxos(values: &[u64]) -> Vec<Utxo> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Utxo::new(TXID, i as u32, *v, RECIPIENT))
            .collect()
    }

    struct FixedOracle(Option<NetworkFees>);

    #[async_trait]
    impl FeeOracle for FixedOracle {
        async fn recommended_fees(&self) -> Result<NetworkFees, FeeError> {
            self.0.ok_or_else(|| FeeError::Unavailable("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cache_serves_defaults_then_last_good_value() {
        let cache = FeeCache::new(MemoryStore::new());
        assert_eq!(cache.cached().await, NetworkFees::default());

        let fresh = NetworkFees {
            slow_fee: 5,
            medium_fee: 10,
            fastest_fee: 20,
        };
        assert_eq!(cache.refresh(&FixedOracle(Some(fresh))).await, fresh);
        assert_eq!(cache.refresh(&FixedOracle(None)).await, fresh);

        let stored = cache.store().get_item(FEE_CACHE_KEY).await.unwrap().unwrap();
        assert!(stored.contains("\"fastestFee\":20"));
    }

    #[tokio::test]
    async fn test_invalid_oracle_answer_not_persisted() {
        let cache = FeeCache::new(MemoryStore::new());
        let zero = NetworkFees {
            slow_fee: 0,
            medium_fee: 1,
            fastest_fee: 1,
        };
        assert_eq!(cache.refresh(&FixedOracle(Some(zero))).await, NetworkFees::default());
        assert!(cache.store().get_item(FEE_CACHE_KEY).await.unwrap().is_none());
    }

    #[test]
    fn test_precalc_all_tiers() {
        let utxos = utxos(&[100_000]);
        let targets = vec![Target::amount(RECIPIENT, 10_000)];
        let change = change();
        let request = PrecalcRequest {
            utxos: &utxos,
            targets: &targets,
            change_script: &change,
            network: Network::Bitcoin,
            allows_unconfirmed: false,
        };

        let precalc = precalculate_fees(&selector(), &request, &NetworkFees::default(), 4, &NoopListener);

        // 1 input, recipient + change: 141 vbytes
        assert_eq!(precalc.slow, Some(141));
        assert_eq!(precalc.medium, Some(282));
        assert_eq!(precalc.fastest, Some(423));
        assert_eq!(precalc.current, Some(564));
        assert_eq!(precalc.recommended_rate(&NetworkFees::default()), 3);
    }

    #[test]
    fn test_precalc_retries_once_as_send_all() {
        // 5_000 cannot fund 10_000 + 2_000, so the retry sends everything to the first target
        let utxos = utxos(&[5_000]);
        let targets = vec![Target::amount(RECIPIENT, 10_000), Target::amount(RECIPIENT, 2_000)];
        let change = change();
        let request = PrecalcRequest {
            utxos: &utxos,
            targets: &targets,
            change_script: &change,
            network: Network::Bitcoin,
            allows_unconfirmed: false,
        };

        let precalc = precalculate_fees(&selector(), &request, &NetworkFees::default(), 1, &NoopListener);

        // 1 input, two outputs, no change: 141 vbytes
        assert_eq!(precalc.slow, Some(141));
    }

    #[test]
    fn test_precalc_unfundable_tier_is_none() {
        let utxos = utxos(&[800]);
        let targets = vec![Target::amount(RECIPIENT, 10_000)];
        let change = change();
        let request = PrecalcRequest {
            utxos: &utxos,
            targets: &targets,
            change_script: &change,
            network: Network::Bitcoin,
            allows_unconfirmed: false,
        };
        let listener = RecordingListener::new();
        let fees = NetworkFees {
            slow_fee: 1,
            medium_fee: 5,
            fastest_fee: 10,
        };

        let precalc = precalculate_fees(&selector(), &request, &fees, 1, &listener);

        // send-all retry: 800 - 110 = 690 clears dust at 1 sat/vbyte only
        assert_eq!(precalc.slow, Some(110));
        assert_eq!(precalc.medium, None);
        assert_eq!(precalc.fastest, None);
        assert_eq!(precalc.recommended_rate(&fees), 1);
        assert_eq!(
            listener
                .events()
                .iter()
                .filter(|e| e.event_type() == "fee_tier_unavailable")
                .count(),
            2
        );
    }

    #[test]
    fn test_empty_and_invalid_targets_use_placeholder() {
        let utxos = utxos(&[100_000]);
        let change = change();
        for targets in [vec![], vec![Target::amount("garbage", 10_000)]] {
            let request = PrecalcRequest {
                utxos: &utxos,
                targets: &targets,
                change_script: &change,
                network: Network::Bitcoin,
                allows_unconfirmed: false,
            };
            let precalc = precalculate_fees(&selector(), &request, &NetworkFees::default(), 1, &NoopListener);
            // P2SH placeholder output is 32 vbytes, change 31
            assert_eq!(precalc.slow, Some(142));
        }
    }
}
