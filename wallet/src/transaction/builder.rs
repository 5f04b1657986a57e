// Transaction Builder for P2WPKH spends
// Coin selection, output assembly, PSBT export and optional signing

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bitcoin::{
    absolute::LockTime,
    consensus::encode::serialize_hex,
    ecdsa,
    hashes::Hash,
    psbt::Psbt,
    secp256k1::{All, Message, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, Network, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use thiserror::Error;

use super::coin_selection::{CoinSelectionStrategy, CoinSelector, SelectionError, SelectionTarget};
use crate::hdwallet::{parse_address, AccountState, HdError, HdKeychain};
use crate::utxo::{Target, TargetValue, Utxo, UtxoError};

/// Opt-in replace-by-fee sequence
pub const DEFAULT_RBF_SEQUENCE: u32 = 0x8000_0000;

/// Final sequence; the transaction is not replaceable
pub const FINAL_SEQUENCE: u32 = 0xFFFF_FFFF;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Insufficient funds: need {needed}, have {available} (short by {shortfall})")]
    InsufficientFunds {
        needed: u64,
        available: u64,
        shortfall: u64,
    },

    #[error("Amount {value} is at or below the dust threshold {dust}")]
    AmountTooSmall { value: u64, dust: u64 },

    #[error("Unsupported input {outpoint}: only P2WPKH outputs can be spent")]
    UnsupportedInput { outpoint: String },

    #[error("Transaction too large: {vsize} vbytes exceeds maximum {max}")]
    TransactionTooLarge { vsize: u64, max: u64 },

    #[error("Coin selection error: {0}")]
    Selection(SelectionError),

    #[error("UTXO error: {0}")]
    Utxo(#[from] UtxoError),

    #[error("Key lookup error: {0}")]
    Key(#[from] HdError),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<SelectionError> for TransactionError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::InsufficientFunds {
                needed,
                available,
                shortfall,
            } => TransactionError::InsufficientFunds {
                needed,
                available,
                shortfall,
            },
            other => TransactionError::Selection(other),
        }
    }
}

/// Transaction builder configuration
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Network every address must belong to
    pub network: Network,

    /// Dust threshold; outputs must be strictly above it
    pub dust_threshold: u64,

    /// Coin selection strategy
    pub coin_selection: CoinSelectionStrategy,

    /// Maximum transaction size in virtual bytes
    pub max_tx_vbytes: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            dust_threshold: 546,
            coin_selection: CoinSelectionStrategy::BranchAndBound,
            max_tx_vbytes: 100_000,
        }
    }
}

/// Supplies signing keys for the addresses being spent
pub trait InputSigner {
    fn key_for_address(&self, address: &str) -> Result<(SecretKey, PublicKey), TransactionError>;
}

/// Signs with keys derived from an HD keychain
pub struct HdSigner<'a> {
    keychain: &'a HdKeychain,
    account: AccountState,
    gap_limit: u32,
}

impl<'a> HdSigner<'a> {
    pub fn new(keychain: &'a HdKeychain, account: AccountState, gap_limit: u32) -> Self {
        Self {
            keychain,
            account,
            gap_limit,
        }
    }
}

impl InputSigner for HdSigner<'_> {
    fn key_for_address(&self, address: &str) -> Result<(SecretKey, PublicKey), TransactionError> {
        Ok(self
            .keychain
            .find_key(address, &self.account, self.gap_limit)?)
    }
}

/// Parameters of a single build
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub utxos: &'a [Utxo],
    pub targets: &'a [Target],
    /// Fee rate in sat/vbyte
    pub fee_rate: u64,
    pub change_address: &'a str,
    pub sequence: u32,
    pub allows_unconfirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltOutput {
    pub address: String,
    pub value: u64,
}

/// A fully assembled transaction
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    /// Spent UTXOs, in input order
    pub inputs: Vec<Utxo>,
    /// Outputs in transaction order; change, when present, is last
    pub outputs: Vec<BuiltOutput>,
    pub change_index: Option<usize>,
    pub fee: u64,
    /// Virtual size the fee was charged on
    pub vsize: u64,
    pub txid: String,
    pub transaction: Transaction,
    pub psbt: Psbt,
    pub signed: bool,
}

impl BuiltTransaction {
    pub fn total_in(&self) -> u64 {
        self.inputs.iter().map(|u| u.value).sum()
    }

    pub fn total_out(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn change(&self) -> Option<&BuiltOutput> {
        self.change_index.and_then(|i| self.outputs.get(i))
    }

    pub fn raw_hex(&self) -> String {
        serialize_hex(&self.transaction)
    }

    pub fn psbt_base64(&self) -> String {
        BASE64.encode(self.psbt.serialize())
    }
}

/// Transaction builder
pub struct TransactionBuilder {
    config: BuilderConfig,
    selector: CoinSelector,
    secp: Secp256k1<All>,
}

impl TransactionBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        let selector = CoinSelector::new(config.coin_selection, config.dust_threshold);
        Self {
            config,
            selector,
            secp: Secp256k1::new(),
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn selector(&self) -> &CoinSelector {
        &self.selector
    }

    /// Select coins, assemble outputs and sign each input when a signer is given
    pub fn build(
        &self,
        request: &BuildRequest<'_>,
        signer: Option<&dyn InputSigner>,
    ) -> Result<BuiltTransaction, TransactionError> {
        let network = self.config.network;

        let mut selection_targets = Vec::with_capacity(request.targets.len());
        for target in request.targets {
            let address = self.parse(&target.address, network)?;
            if let TargetValue::Amount(value) = target.value {
                if value <= self.config.dust_threshold {
                    return Err(TransactionError::AmountTooSmall {
                        value,
                        dust: self.config.dust_threshold,
                    });
                }
            }
            selection_targets.push(SelectionTarget {
                script_pubkey: address.script_pubkey(),
                value: target.value,
            });
        }
        let change_script = self.parse(request.change_address, network)?.script_pubkey();
        self.check_inputs(request.utxos, request.allows_unconfirmed, network)?;

        let selection = self.selector.select(
            request.utxos,
            &selection_targets,
            &change_script,
            request.fee_rate,
            request.allows_unconfirmed,
        )?;

        if selection.vsize > self.config.max_tx_vbytes {
            return Err(TransactionError::TransactionTooLarge {
                vsize: selection.vsize,
                max: self.config.max_tx_vbytes,
            });
        }

        // Outputs in target order, change last
        let mut outputs = Vec::with_capacity(request.targets.len() + 1);
        let mut tx_outputs = Vec::with_capacity(request.targets.len() + 1);
        for (target, selection_target) in request.targets.iter().zip(&selection_targets) {
            let value = match target.value {
                TargetValue::Amount(v) => v,
                TargetValue::SendAll => selection.send_all_value.ok_or_else(|| {
                    TransactionError::ValidationError("send-all value unresolved".to_string())
                })?,
            };
            outputs.push(BuiltOutput {
                address: target.address.clone(),
                value,
            });
            tx_outputs.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: selection_target.script_pubkey.clone(),
            });
        }

        let change_index = selection.change.map(|value| {
            outputs.push(BuiltOutput {
                address: request.change_address.to_string(),
                value,
            });
            tx_outputs.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: change_script.clone(),
            });
            outputs.len() - 1
        });

        let sequence = Sequence(request.sequence);
        let mut prevouts = Vec::with_capacity(selection.inputs.len());
        let mut tx_inputs = Vec::with_capacity(selection.inputs.len());
        for utxo in &selection.inputs {
            tx_inputs.push(TxIn {
                previous_output: utxo.outpoint()?,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            });
            prevouts.push(TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey: self.parse(&utxo.address, network)?.script_pubkey(),
            });
        }

        let mut transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(transaction.clone())
            .map_err(|e| TransactionError::Psbt(e.to_string()))?;
        for (input, prevout) in psbt.inputs.iter_mut().zip(&prevouts) {
            input.witness_utxo = Some(prevout.clone());
        }

        let signed = match signer {
            Some(signer) => {
                let witnesses = self.sign_inputs(&transaction, &selection.inputs, &prevouts, signer)?;
                for ((input, psbt_input), witness) in transaction
                    .input
                    .iter_mut()
                    .zip(psbt.inputs.iter_mut())
                    .zip(witnesses)
                {
                    psbt_input.final_script_witness = Some(witness.clone());
                    input.witness = witness;
                }
                true
            }
            None => false,
        };

        let built = BuiltTransaction {
            inputs: selection.inputs,
            outputs,
            change_index,
            fee: selection.fee,
            vsize: selection.vsize,
            txid: transaction.txid().to_string(),
            transaction,
            psbt,
            signed,
        };

        self.validate(&built)?;

        tracing::debug!(
            txid = %built.txid,
            inputs = built.inputs.len(),
            outputs = built.outputs.len(),
            fee = built.fee,
            vsize = built.vsize,
            signed,
            "transaction built"
        );

        Ok(built)
    }

    fn parse(&self, address: &str, network: Network) -> Result<Address, TransactionError> {
        parse_address(address, network).map_err(|e| TransactionError::InvalidAddress(e.to_string()))
    }

    /// Fees are sized for P2WPKH witnesses, so every spendable coin must be one
    fn check_inputs(
        &self,
        utxos: &[Utxo],
        allows_unconfirmed: bool,
        network: Network,
    ) -> Result<(), TransactionError> {
        let spendable = utxos
            .iter()
            .filter(|u| !u.frozen && u.value > 0)
            .filter(|u| allows_unconfirmed || !u.is_unconfirmed());
        for utxo in spendable {
            if !self.parse(&utxo.address, network)?.script_pubkey().is_p2wpkh() {
                return Err(TransactionError::UnsupportedInput {
                    outpoint: utxo.outpoint_string(),
                });
            }
        }
        Ok(())
    }

    /// Produce one P2WPKH witness per input
    fn sign_inputs(
        &self,
        transaction: &Transaction,
        utxos: &[Utxo],
        prevouts: &[TxOut],
        signer: &dyn InputSigner,
    ) -> Result<Vec<Witness>, TransactionError> {
        let mut cache = SighashCache::new(transaction);
        let mut witnesses = Vec::with_capacity(utxos.len());

        for (index, (utxo, prevout)) in utxos.iter().zip(prevouts).enumerate() {
            let (secret, public) = signer.key_for_address(&utxo.address)?;

            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    &prevout.script_pubkey,
                    prevout.value,
                    EcdsaSighashType::All,
                )
                .map_err(|e| TransactionError::SigningError(e.to_string()))?;

            let message = Message::from_digest(sighash.to_byte_array());
            let signature = ecdsa::Signature::sighash_all(self.secp.sign_ecdsa_low_r(&message, &secret));

            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            witness.push(public.inner.serialize());
            witnesses.push(witness);
        }

        Ok(witnesses)
    }

    /// Check the value balance before handing the transaction out
    fn validate(&self, built: &BuiltTransaction) -> Result<(), TransactionError> {
        if built.inputs.is_empty() {
            return Err(TransactionError::ValidationError("No inputs".to_string()));
        }
        if built.outputs.is_empty() {
            return Err(TransactionError::ValidationError("No outputs".to_string()));
        }

        let total_out = built
            .outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
            .and_then(|out| out.checked_add(built.fee));
        if total_out != Some(built.total_in()) {
            return Err(TransactionError::ValidationError(format!(
                "inputs {} do not equal outputs plus fee {:?}",
                built.total_in(),
                total_out
            )));
        }

        if let Some(output) = built
            .outputs
            .iter()
            .find(|o| o.value <= self.config.dust_threshold)
        {
            return Err(TransactionError::AmountTooSmall {
                value: output.value,
                dust: self.config.dust_threshold,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdwallet::Chain;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    fn keychain() -> HdKeychain {
        HdKeychain::from_mnemonic(TEST_MNEMONIC, "", Network::Bitcoin).unwrap()
    }

    fn funded(hd: &HdKeychain, values: &[u64]) -> Vec<Utxo> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Utxo::new(TXID, i as u32, *v, hd.external_address(i as u32).unwrap().to_string())
            })
            .collect()
    }

    fn request<'a>(
        utxos: &'a [Utxo],
        targets: &'a [Target],
        change: &'a str,
    ) -> BuildRequest<'a> {
        BuildRequest {
            utxos,
            targets,
            fee_rate: 2,
            change_address: change,
            sequence: DEFAULT_RBF_SEQUENCE,
            allows_unconfirmed: false,
        }
    }

    #[test]
    fn test_signed_build_balances() {
        let hd = keychain();
        let utxos = funded(&hd, &[50_000, 30_000]);
        let change = hd.change_address(0).unwrap().to_string();
        let targets = vec![Target::amount(hd.external_address(10).unwrap().to_string(), 60_000)];

        let builder = TransactionBuilder::new(BuilderConfig::default());
        let signer = HdSigner::new(&hd, AccountState::default(), 20);
        let built = builder
            .build(&request(&utxos, &targets, &change), Some(&signer))
            .unwrap();

        assert!(built.signed);
        assert_eq!(built.total_in(), built.total_out() + built.fee);
        assert_eq!(built.outputs[0].value, 60_000);
        assert_eq!(built.change().unwrap().address, change);
        assert!(built.transaction.input.iter().all(|i| i.witness.len() == 2));
        assert!(built
            .transaction
            .input
            .iter()
            .all(|i| i.sequence == Sequence(DEFAULT_RBF_SEQUENCE)));
        // signed size never exceeds the size the fee was charged on
        assert!(built.transaction.vsize() as u64 <= built.vsize);
    }

    #[test]
    fn test_unsigned_build_exports_psbt() {
        let hd = keychain();
        let utxos = funded(&hd, &[100_000]);
        let change = hd.change_address(0).unwrap().to_string();
        let targets = vec![Target::amount(hd.external_address(3).unwrap().to_string(), 10_000)];

        let builder = TransactionBuilder::new(BuilderConfig::default());
        let built = builder.build(&request(&utxos, &targets, &change), None).unwrap();

        assert!(!built.signed);
        assert!(built.transaction.input[0].witness.is_empty());
        assert_eq!(
            built.psbt.inputs[0].witness_utxo.as_ref().unwrap().value,
            Amount::from_sat(100_000)
        );
        assert!(!built.psbt_base64().is_empty());
    }

    #[test]
    fn test_insufficient_funds() {
        let hd = keychain();
        let utxos = funded(&hd, &[1_000]);
        let change = hd.change_address(0).unwrap().to_string();
        let targets = vec![Target::amount(hd.external_address(1).unwrap().to_string(), 2_000)];

        let builder = TransactionBuilder::new(BuilderConfig::default());
        let result = builder.build(&request(&utxos, &targets, &change), None);

        match result {
            Err(TransactionError::InsufficientFunds { shortfall, .. }) => assert!(shortfall >= 1_000),
            other => panic!("expected InsufficientFunds, got {:?}", other.map(|b| b.txid)),
        }
    }

    #[test]
    fn test_dust_target_rejected() {
        let hd = keychain();
        let utxos = funded(&hd, &[100_000]);
        let change = hd.change_address(0).unwrap().to_string();

        let builder = TransactionBuilder::new(BuilderConfig::default());
        for value in [100, 546] {
            let targets = vec![Target::amount(hd.external_address(1).unwrap().to_string(), value)];
            assert!(matches!(
                builder.build(&request(&utxos, &targets, &change), None),
                Err(TransactionError::AmountTooSmall { dust: 546, .. })
            ));
        }
    }

    #[test]
    fn test_invalid_addresses_rejected() {
        let hd = keychain();
        let utxos = funded(&hd, &[100_000]);
        let change = hd.change_address(0).unwrap().to_string();
        let builder = TransactionBuilder::new(BuilderConfig::default());

        let targets = vec![Target::amount("not-an-address", 10_000)];
        assert!(matches!(
            builder.build(&request(&utxos, &targets, &change), None),
            Err(TransactionError::InvalidAddress(_))
        ));

        let targets = vec![Target::amount(hd.external_address(1).unwrap().to_string(), 10_000)];
        assert!(matches!(
            builder.build(&request(&utxos, &targets, "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx"), None),
            Err(TransactionError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_send_all_has_no_change() {
        let hd = keychain();
        let utxos = funded(&hd, &[40_000, 25_000]);
        let change = hd.change_address(0).unwrap().to_string();
        let targets = vec![Target::send_all(hd.external_address(7).unwrap().to_string())];

        let builder = TransactionBuilder::new(BuilderConfig::default());
        let built = builder.build(&request(&utxos, &targets, &change), None).unwrap();

        assert_eq!(built.inputs.len(), 2);
        assert_eq!(built.outputs.len(), 1);
        assert!(built.change().is_none());
        assert_eq!(built.outputs[0].value + built.fee, 65_000);
    }

    #[test]
    fn test_signing_requires_known_key() {
        let hd = keychain();
        let mut utxos = funded(&hd, &[100_000]);
        utxos[0].address = hd.external_address(500).unwrap().to_string();
        let change = hd.change_address(0).unwrap().to_string();
        let targets = vec![Target::amount(hd.address(Chain::External, 1).unwrap().to_string(), 10_000)];

        let builder = TransactionBuilder::new(BuilderConfig::default());
        let signer = HdSigner::new(&hd, AccountState::default(), 20);
        assert!(matches!(
            builder.build(&request(&utxos, &targets, &change), Some(&signer)),
            Err(TransactionError::Key(HdError::KeyNotFound(_)))
        ));
    }

    #[test]
    fn test_non_segwit_inputs_rejected() {
        let hd = keychain();
        let change = hd.change_address(0).unwrap().to_string();
        let targets = vec![Target::amount(hd.external_address(1).unwrap().to_string(), 10_000)];
        let builder = TransactionBuilder::new(BuilderConfig::default());

        // P2PKH and P2TR spends are larger than the P2WPKH size template
        for address in [
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr",
        ] {
            let utxos = vec![Utxo::new(TXID, 0, 100_000, address)];
            match builder.build(&request(&utxos, &targets, &change), None) {
                Err(TransactionError::UnsupportedInput { outpoint }) => {
                    assert_eq!(outpoint, format!("{}:0", TXID))
                }
                other => panic!("expected UnsupportedInput, got {:?}", other.map(|b| b.txid)),
            }
        }

        // frozen coins are never spent, so their type does not matter
        let mut utxos = funded(&hd, &[100_000]);
        utxos.push(Utxo::new(TXID, 9, 50_000, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").frozen());
        assert!(builder.build(&request(&utxos, &targets, &change), None).is_ok());
    }

    #[test]
    fn test_size_limit_enforced() {
        let hd = keychain();
        let utxos = funded(&hd, &[100_000]);
        let change = hd.change_address(0).unwrap().to_string();
        let targets = vec![Target::amount(hd.external_address(1).unwrap().to_string(), 10_000)];

        let builder = TransactionBuilder::new(BuilderConfig {
            max_tx_vbytes: 100,
            ..BuilderConfig::default()
        });
        assert!(matches!(
            builder.build(&request(&utxos, &targets, &change), None),
            Err(TransactionError::TransactionTooLarge { max: 100, .. })
        ));
    }
}
