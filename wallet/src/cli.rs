use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use qproof_wallet::{
    quantum_wallet::{BlockReference, QuantumProof, QuantumProofWallet, WalletStorage},
    BuildRequest, NetworkFees, Target, TargetValue, Utxo, WalletConfig, DEFAULT_RBF_SEQUENCE,
    FINAL_SEQUENCE,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Wallet file
    #[arg(short, long, default_value = "qproof-wallet.json")]
    wallet: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network for new wallets (bitcoin, testnet, signet, regtest)
    #[arg(short, long)]
    network: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new wallet
    New,

    /// Create a wallet from a mnemonic phrase
    Restore {
        /// Mnemonic phrase
        mnemonic: String,

        /// Optional BIP39 passphrase
        #[arg(long, default_value = "")]
        passphrase: String,
    },

    /// Show the receive address
    Address {
        /// Show the change address instead
        #[arg(long)]
        change: bool,
    },

    /// Show the post-quantum public key formats
    PqKey,

    /// Generate a quantum proof of balance
    Prove {
        /// Balance in satoshis
        #[arg(short, long)]
        balance: u64,

        /// Block height
        #[arg(long)]
        height: u64,

        /// Block hash
        #[arg(long)]
        hash: String,
    },

    /// Verify a proof file against this wallet
    Verify {
        /// Proof JSON file
        proof: PathBuf,
    },

    /// Print a stored proof as JSON
    Export {
        /// Proof id
        id: String,
    },

    /// List stored proofs
    Proofs,

    /// Precalculate fees for each tier
    Fees {
        /// UTXO list (JSON array)
        #[arg(short, long)]
        utxos: PathBuf,

        /// Recipient address
        #[arg(short, long)]
        to: String,

        /// Amount in satoshis, or "max"
        #[arg(short, long, value_parser = parse_amount)]
        amount: TargetValue,

        #[arg(long, default_value_t = 1)]
        slow: u64,

        #[arg(long, default_value_t = 2)]
        medium: u64,

        #[arg(long, default_value_t = 3)]
        fastest: u64,
    },

    /// Build a transaction
    Send {
        /// UTXO list (JSON array)
        #[arg(short, long)]
        utxos: PathBuf,

        /// Recipient address
        #[arg(short, long)]
        to: String,

        /// Amount in satoshis, or "max"
        #[arg(short, long, value_parser = parse_amount)]
        amount: TargetValue,

        /// Fee rate in sat/vbyte
        #[arg(short, long)]
        fee_rate: u64,

        /// Export an unsigned PSBT instead of signing
        #[arg(long)]
        unsigned: bool,

        /// Disable replace-by-fee
        #[arg(long)]
        no_rbf: bool,

        /// Allow spending unconfirmed outputs
        #[arg(long)]
        allow_unconfirmed: bool,
    },
}

fn parse_amount(value: &str) -> Result<TargetValue, String> {
    if value.eq_ignore_ascii_case("max") {
        return Ok(TargetValue::SendAll);
    }
    value
        .parse::<u64>()
        .map(TargetValue::Amount)
        .map_err(|e| format!("invalid amount '{}': {}", value, e))
}

fn load_config(cli: &Cli) -> Result<WalletConfig> {
    let mut config = match &cli.config {
        Some(path) => WalletConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => WalletConfig::default(),
    };
    if let Some(network) = &cli.network {
        config.network = qproof_wallet::Network::from_str(network)
            .with_context(|| format!("Unknown network '{}'", network))?;
    }
    Ok(config)
}

fn open_wallet(path: &Path, config: WalletConfig) -> Result<QuantumProofWallet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read wallet {}", path.display()))?;
    Ok(QuantumProofWallet::from_json(&text, config)?)
}

fn save_wallet(path: &Path, wallet: &QuantumProofWallet) -> Result<()> {
    WalletStorage::save(path, &wallet.to_record())
        .with_context(|| format!("Failed to save wallet {}", path.display()))
}

fn create_wallet(path: &Path, wallet: &QuantumProofWallet) -> Result<()> {
    if path.exists() {
        bail!("Wallet file {} already exists", path.display());
    }
    save_wallet(path, wallet)?;
    println!("Wallet written to {}", path.display());
    println!("Receive address: {}", wallet.receive_address()?);
    if wallet.is_pq_degraded() {
        println!("WARNING: post-quantum keypair is degraded; proofs will carry fallback signatures");
    }
    Ok(())
}

fn load_utxos(path: &Path) -> Result<Vec<Utxo>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read UTXO file {}", path.display()))?;
    serde_json::from_str(&text).context("UTXO file must be a JSON array of outputs")
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let path = cli.wallet.as_path();

    match cli.command {
        Some(Commands::New) => {
            let wallet = QuantumProofWallet::generate(config)?;
            println!("Your seed phrase: {}", wallet.keychain().mnemonic());
            println!("Write it down. It is the only way to recover this wallet.");
            create_wallet(path, &wallet)
        }

        Some(Commands::Restore {
            mnemonic,
            passphrase,
        }) => {
            let wallet = QuantumProofWallet::from_mnemonic(&mnemonic, &passphrase, config)?;
            create_wallet(path, &wallet)
        }

        Some(Commands::Address { change }) => {
            let wallet = open_wallet(path, config)?;
            if change {
                println!("{}", wallet.change_address()?);
            } else {
                println!("{}", wallet.receive_address()?);
            }
            Ok(())
        }

        Some(Commands::PqKey) => {
            let wallet = open_wallet(path, config)?;
            println!("{}", serde_json::to_string_pretty(&wallet.pq_key_export()?)?);
            Ok(())
        }

        Some(Commands::Prove {
            balance,
            height,
            hash,
        }) => {
            let mut wallet = open_wallet(path, config)?;
            let proof = wallet
                .generate_proof(balance, BlockReference::new(height, hash))
                .await?;
            save_wallet(path, &wallet)?;
            println!("{}", proof.to_pretty_json()?);
            if !proof.is_strong() {
                eprintln!("WARNING: post-quantum signature is a fallback hash, not a signature");
            }
            Ok(())
        }

        Some(Commands::Verify { proof }) => {
            let wallet = open_wallet(path, config)?;
            let text = std::fs::read_to_string(&proof)
                .with_context(|| format!("Failed to read proof {}", proof.display()))?;
            let proof: QuantumProof = serde_json::from_str(&text).context("Malformed proof")?;

            let valid = wallet.verify_proof(&proof);
            let classical = wallet.verify_classical_signature(&proof).unwrap_or(false);
            println!("Proof {}: {}", proof.id, if valid { "valid" } else { "INVALID" });
            println!("Classical signature: {}", if classical { "valid" } else { "INVALID" });
            if !proof.is_strong() {
                println!("Note: fallback signatures are only checked for shape");
            }
            if !valid {
                bail!("proof verification failed");
            }
            Ok(())
        }

        Some(Commands::Export { id }) => {
            let wallet = open_wallet(path, config)?;
            println!("{}", wallet.export_proof(&id)?);
            Ok(())
        }

        Some(Commands::Proofs) => {
            let wallet = open_wallet(path, config)?;
            if wallet.proofs().is_empty() {
                println!("No proofs found.");
            }
            for proof in wallet.proofs() {
                println!(
                    "{}: {} sat at height {} ({})",
                    proof.id,
                    proof.balance,
                    proof.block.height,
                    if proof.is_strong() { "post-quantum" } else { "fallback" }
                );
            }
            Ok(())
        }

        Some(Commands::Fees {
            utxos,
            to,
            amount,
            slow,
            medium,
            fastest,
        }) => {
            let wallet = open_wallet(path, config)?;
            let utxos = load_utxos(&utxos)?;
            let targets = vec![Target { address: to, value: amount }];
            let fees = NetworkFees {
                slow_fee: slow,
                medium_fee: medium,
                fastest_fee: fastest,
            };

            let precalc = wallet.precalculate_fees(&utxos, &targets, &fees, medium)?;
            println!("{}", serde_json::to_string_pretty(&precalc)?);
            println!("Recommended rate: {} sat/vbyte", precalc.recommended_rate(&fees));
            Ok(())
        }

        Some(Commands::Send {
            utxos,
            to,
            amount,
            fee_rate,
            unsigned,
            no_rbf,
            allow_unconfirmed,
        }) => {
            let wallet = open_wallet(path, config)?;
            let utxos = load_utxos(&utxos)?;
            let targets = vec![Target { address: to, value: amount }];
            let change_address = wallet.change_address()?;

            let request = BuildRequest {
                utxos: &utxos,
                targets: &targets,
                fee_rate,
                change_address: &change_address,
                sequence: if no_rbf { FINAL_SEQUENCE } else { DEFAULT_RBF_SEQUENCE },
                allows_unconfirmed: allow_unconfirmed,
            };
            let built = wallet.build_transaction(&request, !unsigned)?;

            println!("txid: {}", built.txid);
            println!("fee: {} sat ({} vbytes)", built.fee, built.vsize);
            for output in &built.outputs {
                println!("  {} -> {} sat", output.address, output.value);
            }
            if built.signed {
                println!("{}", built.raw_hex());
            } else {
                println!("{}", built.psbt_base64());
            }
            Ok(())
        }

        None => {
            Cli::command().print_help().context("Failed to print help")?;
            Ok(())
        }
    }
}
