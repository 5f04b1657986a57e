/// Transaction size measurement for fee computation
///
/// Fees are charged on the virtual size of the transaction as it will be
/// serialized, with every witness slot filled to its maximum length. Sizes
/// come from the consensus encoder rather than per-field estimates.
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

/// DER-encoded ECDSA signature upper bound plus the sighash byte
pub const MAX_SIGNATURE_LEN: usize = 72;

/// Compressed secp256k1 public key
pub const COMPRESSED_PUBKEY_LEN: usize = 33;

/// Virtual size of one P2WPKH input with a maximal witness
pub const P2WPKH_INPUT_VBYTES: u64 = 68;

/// Virtual size of one P2WPKH output
pub const P2WPKH_OUTPUT_VBYTES: u64 = 31;

/// Witness with the shape of a P2WPKH spend, sized to its maximum
pub fn max_p2wpkh_witness() -> Witness {
    let mut witness = Witness::new();
    witness.push([0u8; MAX_SIGNATURE_LEN]);
    witness.push([0u8; COMPRESSED_PUBKEY_LEN]);
    witness
}

/// Build the size template for `input_count` P2WPKH inputs and the given outputs
pub fn template(input_count: usize, outputs: &[TxOut], sequence: Sequence) -> Transaction {
    let input = (0..input_count)
        .map(|_| TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence,
            witness: max_p2wpkh_witness(),
        })
        .collect();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output: outputs.to_vec(),
    }
}

/// Virtual size of the template transaction
pub fn template_vsize(input_count: usize, outputs: &[TxOut]) -> u64 {
    template(input_count, outputs, Sequence::MAX).vsize() as u64
}

/// Placeholder output carrying only the script; the value does not affect size
pub fn sizing_output(script_pubkey: &Script) -> TxOut {
    TxOut {
        value: Amount::ZERO,
        script_pubkey: script_pubkey.to_owned(),
    }
}

/// Fee for a given virtual size; `None` on overflow
pub fn fee_for_vsize(vsize: u64, fee_rate: u64) -> Option<u64> {
    vsize.checked_mul(fee_rate)
}
