// Quantum proof wallet
// Post-quantum keys, tagged signatures and balance proofs alongside the classical wallet

pub mod engine;
pub mod hd_derivation;
pub mod key_formats;
pub mod keypair;
pub mod proof;
pub mod scheme;
pub mod signature;
pub mod signer;
pub mod storage;

// Re-exports
pub use engine::{ProofError, QuantumProofWallet};
pub use key_formats::{PqKeyExport, PublicKeyFormats, PublicKeyInfo};
pub use keypair::{KeyStrength, PqKeypair};
pub use proof::{BlockOracle, BlockReference, QuantumProof};
pub use scheme::{PqError, SignatureScheme, Sphincs128f};
pub use signature::PqSignature;
pub use signer::{PqSigner, SignOutcome, SignerState};
pub use storage::{PersistenceError, WalletRecord, WalletStorage};
