//! Bitcoin wallet core with dual-signed quantum ownership proofs
//!
//! - [`transaction`]: coin selection and P2WPKH transaction building
//! - [`hdwallet`]: BIP84 keys and BIP137 message signing
//! - [`quantum_wallet`]: post-quantum signer and the proof engine
//! - [`fees`]: fee tiers, cached oracle and fee precalculation

pub mod config;
pub mod events;
pub mod fees;
pub mod hdwallet;
pub mod quantum_wallet;
pub mod transaction;
pub mod utxo;

pub use config::{ConfigError, WalletConfig};
pub use events::{EventListener, NoopListener, RecordingListener, TracingListener, WalletEvent};
pub use fees::{FeeCache, FeeError, FeeOracle, FeePrecalc, KeyValueStore, MemoryStore, NetworkFees};
pub use hdwallet::{verify_message, AccountState, Chain, HdError, HdKeychain};
pub use quantum_wallet::{
    BlockOracle, BlockReference, PersistenceError, PqError, PqSignature, ProofError, QuantumProof,
    QuantumProofWallet, WalletRecord, WalletStorage,
};
pub use transaction::{
    BuildRequest, BuiltTransaction, CoinSelectionStrategy, CoinSelector, TransactionBuilder,
    TransactionError, DEFAULT_RBF_SEQUENCE, FINAL_SEQUENCE,
};
pub use utxo::{Target, TargetValue, Utxo, UtxoSource};

/// Re-exported so hosts can name networks without depending on `bitcoin`
pub use bitcoin::Network;
