//! Quantum proof wallet
//!
//! Ties the classical HD keychain, the post-quantum signer and the
//! transaction builder together. A proof attests the wallet's balance at a
//! given block: the payload is signed once with the receive address key
//! (BIP137) and once with the post-quantum key.

use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use thiserror::Error;

use super::key_formats::{KeyFormatError, PqKeyExport};
use super::keypair::{KeyStrength, PqKeypair};
use super::proof::{canonical_payload, BlockOracle, BlockReference, QuantumProof, CLASSICAL_MESSAGE_PREFIX};
use super::scheme::{PqError, SignatureScheme, Sphincs128f};
use super::signer::{PqSigner, SignerState};
use super::storage::{PersistenceError, WalletRecord, WALLET_TYPE};
use crate::config::{ConfigError, WalletConfig};
use crate::events::{EventListener, TracingListener, WalletEvent};
use crate::fees::{precalculate_fees, FeePrecalc, NetworkFees, PrecalcRequest};
use crate::hdwallet::{verify_message, AccountState, HdError, HdKeychain};
use crate::transaction::{BuildRequest, BuiltTransaction, HdSigner, InputSigner, TransactionBuilder, TransactionError};
use crate::utxo::{spendable_balance, Target, Utxo, UtxoError, UtxoSource};

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("No receive address available: {0}")]
    NoAddressAvailable(String),

    #[error("Proof not found: {0}")]
    NotFound(String),

    #[error("Block reference unavailable: {0}")]
    BlockUnavailable(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Key error: {0}")]
    Hd(#[from] HdError),

    #[error("Post-quantum error: {0}")]
    Pq(#[from] PqError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("UTXO error: {0}")]
    Utxo(#[from] UtxoError),

    #[error("Key format error: {0}")]
    KeyFormat(#[from] KeyFormatError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<PersistenceError> for ProofError {
    fn from(err: PersistenceError) -> Self {
        ProofError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ProofError {
    fn from(err: serde_json::Error) -> Self {
        ProofError::SerializationError(err.to_string())
    }
}

pub struct QuantumProofWallet {
    config: WalletConfig,
    keychain: HdKeychain,
    account: AccountState,
    signer: PqSigner,
    builder: TransactionBuilder,
    proofs: Vec<QuantumProof>,
    last_proof_id: i64,
    listener: Arc<dyn EventListener>,
}

impl QuantumProofWallet {
    /// Restore from an explicit mnemonic
    pub fn from_mnemonic(phrase: &str, passphrase: &str, config: WalletConfig) -> Result<Self, ProofError> {
        Self::from_mnemonic_with_scheme(phrase, passphrase, config, Arc::new(Sphincs128f))
    }

    pub fn from_mnemonic_with_scheme(
        phrase: &str,
        passphrase: &str,
        config: WalletConfig,
        scheme: Arc<dyn SignatureScheme>,
    ) -> Result<Self, ProofError> {
        config.validate()?;
        let keychain = HdKeychain::from_mnemonic(phrase, passphrase, config.network)?;
        let mut wallet = Self::assemble(keychain, config, scheme);

        let failure = wallet.signer.initialize(wallet.keychain.seed())?;
        if let Some(reason) = failure {
            tracing::debug!(error = %reason, "post-quantum signer degraded");
        }
        wallet.emit(WalletEvent::PqKeypairReady {
            degraded: wallet.is_pq_degraded(),
        });
        Ok(wallet)
    }

    /// Fresh wallet with a new 12-word mnemonic from OS entropy
    pub fn generate(config: WalletConfig) -> Result<Self, ProofError> {
        let keychain = HdKeychain::generate(config.network)?;
        let phrase = keychain.mnemonic().to_string();
        Self::from_mnemonic(&phrase, "", config)
    }

    fn assemble(keychain: HdKeychain, config: WalletConfig, scheme: Arc<dyn SignatureScheme>) -> Self {
        let signer = PqSigner::new(scheme, config.pq_sign_timeout(), config.fallback_hash_rounds);
        let builder = TransactionBuilder::new(config.builder_config());
        Self {
            config,
            keychain,
            account: AccountState::default(),
            signer,
            builder,
            proofs: Vec::new(),
            last_proof_id: 0,
            listener: Arc::new(TracingListener),
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listener = listener;
    }

    fn emit(&self, event: WalletEvent) {
        self.listener.on_event(&event);
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn keychain(&self) -> &HdKeychain {
        &self.keychain
    }

    pub fn account_state(&self) -> AccountState {
        self.account
    }

    pub fn set_account_state(&mut self, account: AccountState) {
        self.account = account;
    }

    pub fn signer_state(&self) -> SignerState {
        self.signer.state()
    }

    pub fn is_pq_degraded(&self) -> bool {
        self.signer.state() == SignerState::Degraded
    }

    pub fn pq_public_key_hex(&self) -> Option<String> {
        self.signer.keypair().map(PqKeypair::public_key_hex)
    }

    /// Post-quantum public key in every display format
    pub fn pq_key_export(&self) -> Result<PqKeyExport, ProofError> {
        let Some(keypair) = self.signer.keypair() else {
            return Ok(PqKeyExport::unavailable("Post-quantum keypair not available"));
        };
        let algorithm = match keypair.strength() {
            KeyStrength::Strong => self.signer.scheme().algorithm(),
            KeyStrength::Degraded => "SHA-256 fallback",
        };
        Ok(PqKeyExport::new(keypair.public_key(), algorithm, !keypair.is_degraded())?)
    }

    /// Address at the next free external index
    pub fn receive_address(&self) -> Result<String, ProofError> {
        self.keychain
            .external_address(self.account.next_free_address_index)
            .map(|a| a.to_string())
            .map_err(|e| ProofError::NoAddressAvailable(e.to_string()))
    }

    pub fn change_address(&self) -> Result<String, ProofError> {
        Ok(self
            .keychain
            .change_address(self.account.next_free_change_index)?
            .to_string())
    }

    /// Sign a proof of `balance` satoshis at `block`
    pub async fn generate_proof(
        &mut self,
        balance: u64,
        block: BlockReference,
    ) -> Result<QuantumProof, ProofError> {
        let btc_address = self.receive_address()?;

        let now = Utc::now();
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let id = now.timestamp_millis().max(self.last_proof_id + 1);

        let balance = balance.to_string();
        let payload = canonical_payload(&btc_address, &balance, &block, &timestamp)?;

        let btc_signature = self.keychain.sign_message(
            &format!("{}{}", CLASSICAL_MESSAGE_PREFIX, payload),
            &btc_address,
            &self.account,
            self.config.gap_limit,
        )?;

        let outcome = self.signer.sign(payload.as_bytes()).await?;
        if let Some(reason) = &outcome.fallback_reason {
            self.emit(WalletEvent::PqSigningFellBack {
                reason: reason.to_string(),
            });
        }

        let proof = QuantumProof {
            id: id.to_string(),
            btc_address,
            balance,
            block,
            timestamp,
            btc_signature,
            pq_signature: outcome.signature,
            pq_pubkey: self.pq_public_key_hex().unwrap_or_default(),
        };

        self.last_proof_id = id;
        self.proofs.push(proof.clone());
        self.emit(WalletEvent::ProofGenerated {
            id: proof.id.clone(),
            strong: proof.is_strong(),
        });
        tracing::debug!(id = %proof.id, strong = proof.is_strong(), "quantum proof generated");

        Ok(proof)
    }

    /// Proof over the balance reported by `utxos` at the oracle's current block
    pub async fn generate_proof_from(
        &mut self,
        utxos: &dyn UtxoSource,
        oracle: &dyn BlockOracle,
    ) -> Result<QuantumProof, ProofError> {
        let balance = spendable_balance(&utxos.get_utxo(false).await?);
        let block = oracle
            .current_block()
            .await
            .map_err(ProofError::BlockUnavailable)?;
        self.generate_proof(balance, block).await
    }

    pub fn proofs(&self) -> &[QuantumProof] {
        &self.proofs
    }

    pub fn proof(&self, id: &str) -> Option<&QuantumProof> {
        self.proofs.iter().find(|p| p.id == id)
    }

    /// Pretty JSON of a stored proof
    pub fn export_proof(&self, id: &str) -> Result<String, ProofError> {
        let proof = self
            .proof(id)
            .ok_or_else(|| ProofError::NotFound(id.to_string()))?;
        Ok(proof.to_pretty_json()?)
    }

    /// Post-quantum check against this wallet's key plus a classical signature presence check
    ///
    /// The proof must carry this wallet's post-quantum public key.
    ///
    /// For fallback signatures the post-quantum part is structural only and
    /// a `true` result is not evidence of authorship.
    pub fn verify_proof(&self, proof: &QuantumProof) -> bool {
        if proof.btc_signature.is_empty() || proof.pq_pubkey.is_empty() {
            return false;
        }
        let Ok(claimed_key) = hex::decode(&proof.pq_pubkey) else {
            return false;
        };
        if self.signer.public_key() != Some(claimed_key.as_slice()) {
            return false;
        }
        match proof.payload() {
            Ok(payload) => self.signer.verify(payload.as_bytes(), &proof.pq_signature),
            Err(_) => false,
        }
    }

    /// Full BIP137 check of the classical signature
    pub fn verify_classical_signature(&self, proof: &QuantumProof) -> Result<bool, ProofError> {
        let message = proof.classical_message()?;
        Ok(verify_message(
            &message,
            &proof.btc_address,
            &proof.btc_signature,
            self.config.network,
        )?)
    }

    /// Build a transaction spending this wallet's coins; signed when `sign` is set
    pub fn build_transaction(
        &self,
        request: &BuildRequest<'_>,
        sign: bool,
    ) -> Result<BuiltTransaction, ProofError> {
        let signer = HdSigner::new(&self.keychain, self.account, self.config.gap_limit);
        let signer = sign.then_some(&signer as &dyn InputSigner);

        let built = self.builder.build(request, signer)?;

        self.emit(WalletEvent::CoinsSelected {
            inputs: built.inputs.len(),
            total_in: built.total_in(),
            fee: built.fee,
        });
        self.emit(WalletEvent::TransactionBuilt {
            txid: built.txid.clone(),
            vsize: built.vsize,
            fee: built.fee,
            signed: built.signed,
        });

        Ok(built)
    }

    /// Absolute fee per tier for paying `targets` from `utxos`
    pub fn precalculate_fees(
        &self,
        utxos: &[Utxo],
        targets: &[Target],
        fees: &NetworkFees,
        current_rate: u64,
    ) -> Result<FeePrecalc, ProofError> {
        let change_script = self
            .keychain
            .change_address(self.account.next_free_change_index)?
            .script_pubkey();
        let request = PrecalcRequest {
            utxos,
            targets,
            change_script: &change_script,
            network: self.config.network,
            allows_unconfirmed: false,
        };
        Ok(precalculate_fees(
            self.builder.selector(),
            &request,
            fees,
            current_rate,
            self.listener.as_ref(),
        ))
    }

    /// Snapshot for persistence
    pub fn to_record(&self) -> WalletRecord {
        let keypair = self.signer.keypair();
        WalletRecord {
            wallet_type: WALLET_TYPE.to_string(),
            secret: self.keychain.mnemonic().to_string(),
            passphrase: self.keychain.passphrase().to_string(),
            network: self.config.network,
            next_free_address_index: self.account.next_free_address_index,
            next_free_change_index: self.account.next_free_change_index,
            proofs: self.proofs.clone(),
            pq_public_key: keypair.map(PqKeypair::public_key_hex).unwrap_or_default(),
            pq_private_key: keypair
                .map(|k| k.secret_key_hex().to_string())
                .unwrap_or_default(),
            pq_degraded: keypair.map(PqKeypair::is_degraded).unwrap_or(false),
        }
    }

    pub fn to_json(&self) -> Result<String, ProofError> {
        Ok(self.to_record().to_json()?)
    }

    pub fn from_json(text: &str, config: WalletConfig) -> Result<Self, ProofError> {
        Self::from_record(&WalletRecord::from_json(text)?, config, Arc::new(Sphincs128f))
    }

    /// Restore a wallet; stored post-quantum keys are used as-is, missing ones re-derived
    pub fn from_record(
        record: &WalletRecord,
        mut config: WalletConfig,
        scheme: Arc<dyn SignatureScheme>,
    ) -> Result<Self, ProofError> {
        config.network = record.network;
        config.validate()?;
        let keychain = HdKeychain::from_mnemonic(&record.secret, &record.passphrase, record.network)
            .map_err(|e| ProofError::SerializationError(e.to_string()))?;
        let mut wallet = Self::assemble(keychain, config, scheme);

        wallet.account = AccountState::new(record.next_free_address_index, record.next_free_change_index);

        match record.pq_key_bytes()? {
            Some((public_key, secret_key)) => {
                let strength = if record.pq_degraded {
                    KeyStrength::Degraded
                } else {
                    KeyStrength::Strong
                };
                let keypair = PqKeypair::from_parts(public_key, secret_key, strength)
                    .map_err(|e| ProofError::SerializationError(e.to_string()))?;
                wallet.signer.restore(keypair);
            }
            None => {
                wallet.signer.initialize(wallet.keychain.seed())?;
            }
        }

        wallet.proofs = record.proofs.clone();
        wallet.last_proof_id = wallet
            .proofs
            .iter()
            .filter_map(|p| p.id.parse::<i64>().ok())
            .max()
            .unwrap_or(0);

        Ok(wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingListener;
    use bitcoin::Network;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn wallet() -> QuantumProofWallet {
        QuantumProofWallet::from_mnemonic(TEST_MNEMONIC, "", WalletConfig::default()).unwrap()
    }

    #[test]
    fn test_receive_address_follows_account_state() {
        let mut wallet = wallet();
        assert_eq!(
            wallet.receive_address().unwrap(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );

        wallet.set_account_state(AccountState::new(1, 0));
        assert_eq!(
            wallet.receive_address().unwrap(),
            "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g"
        );
    }

    #[test]
    fn test_unavailable_index_is_no_address() {
        let mut wallet = wallet();
        wallet.set_account_state(AccountState::new(u32::MAX, 0));
        assert!(matches!(
            wallet.receive_address(),
            Err(ProofError::NoAddressAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_proof_ids_strictly_increase() {
        let mut wallet = wallet();
        let listener = RecordingListener::new();
        wallet.set_listener(Arc::new(listener.clone()));

        let block = BlockReference::new(840_000, "00".repeat(32));
        let first = wallet.generate_proof(1_000, block.clone()).await.unwrap();
        let second = wallet.generate_proof(2_000, block).await.unwrap();

        let a: i64 = first.id.parse().unwrap();
        let b: i64 = second.id.parse().unwrap();
        assert!(b > a);
        assert_eq!(wallet.proofs().len(), 2);
        assert_eq!(wallet.proof(&second.id).unwrap().balance, "2000");
        assert!(wallet.verify_classical_signature(&first).unwrap());

        let generated = listener
            .events()
            .into_iter()
            .filter(|e| matches!(e, WalletEvent::ProofGenerated { .. }))
            .count();
        assert_eq!(generated, 2);
    }

    #[test]
    fn test_export_missing_proof() {
        assert!(matches!(
            wallet().export_proof("42"),
            Err(ProofError::NotFound(id)) if id == "42"
        ));
    }

    #[test]
    fn test_key_export_formats() {
        let export = wallet().pq_key_export().unwrap();
        assert!(export.available);
        let info = export.info.unwrap();
        assert_eq!(info.algorithm, "SPHINCS+-SHA2-128f-simple");
        assert_eq!(info.public_key_size, Sphincs128f::PUBLIC_KEY_LEN);
        assert!(info.quantum_resistant);
        assert!(export.formats.unwrap().bc1s_address.starts_with("bc1s"));
    }

    #[test]
    fn test_record_keeps_network_and_account() {
        let config = WalletConfig {
            network: Network::Testnet,
            ..WalletConfig::default()
        };
        let mut wallet = QuantumProofWallet::from_mnemonic(TEST_MNEMONIC, "", config).unwrap();
        wallet.set_account_state(AccountState::new(3, 1));

        let restored = QuantumProofWallet::from_json(&wallet.to_json().unwrap(), WalletConfig::default()).unwrap();
        assert_eq!(restored.config().network, Network::Testnet);
        assert_eq!(restored.account_state(), AccountState::new(3, 1));
        assert_eq!(restored.receive_address().unwrap(), wallet.receive_address().unwrap());
    }
}
