use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::opcodes;
use bitcoin::script::{Builder, ScriptBuf};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Witness};

/// Estimated virtual size of a sweep transaction: one P2WSH input whose
/// witness carries signature, preimage and the ~110-byte script, one
/// P2WPKH-sized output.
pub const SWEEP_TX_VSIZE: u64 = 157;

/// Outputs below this are unspendable by standardness rules.
const DUST_LIMIT_SAT: u64 = 546;

/// The on-chain half of a loop-out swap. The server funds a P2WSH output
/// with this script; the success branch pays the receiver against the
/// preimage, the timeout branch returns funds to the sender after expiry.
#[derive(Debug, Clone, Copy)]
pub struct LoopOutHtlc {
    pub payment_hash: [u8; 32],
    pub receiver_key: [u8; 33],
    pub sender_key: [u8; 33],
    pub cltv_expiry: u32,
}

impl LoopOutHtlc {
    pub fn witness_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(32)
            .push_opcode(opcodes::all::OP_EQUAL)
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(self.payment_hash)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_slice(self.receiver_key)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(i64::from(self.cltv_expiry))
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_slice(self.sender_key)
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.witness_script().to_p2wsh()
    }
}

/// Build and sign the sweep spending the HTLC output to `dest`. The
/// witness is `[signature, preimage, witness_script]`: element 1 is the
/// preimage the success branch hashes against.
pub fn build_sweep_tx(
    htlc: &LoopOutHtlc,
    htlc_outpoint: OutPoint,
    htlc_value_sat: u64,
    dest: &Address,
    receiver_secret: &SecretKey,
    preimage: [u8; 32],
    fee_sat: u64,
) -> Result<Transaction> {
    anyhow::ensure!(
        fee_sat < htlc_value_sat,
        "sweep fee {fee_sat} exceeds htlc value {htlc_value_sat}"
    );
    let sweep_value = htlc_value_sat - fee_sat;
    anyhow::ensure!(
        sweep_value >= DUST_LIMIT_SAT,
        "sweep output {sweep_value} below dust limit"
    );

    let witness_script = htlc.witness_script();

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: htlc_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sweep_value),
            script_pubkey: dest.script_pubkey(),
        }],
    };

    let sighash_type = EcdsaSighashType::All;
    let sighash = SighashCache::new(&tx)
        .p2wsh_signature_hash(
            0,
            &witness_script,
            Amount::from_sat(htlc_value_sat),
            sighash_type,
        )
        .context("compute sweep sighash")?;

    let secp = Secp256k1::new();
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_ecdsa(&msg, receiver_secret);
    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(sighash_type.to_u32() as u8);

    let mut witness = Witness::new();
    witness.push(sig_bytes);
    witness.push(preimage);
    witness.push(witness_script.as_bytes());
    tx.input[0].witness = witness;

    Ok(tx)
}

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}
