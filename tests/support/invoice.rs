use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

/// Build a signed regtest invoice for the given hash and amount, the way
/// a swap server would hand them out.
pub fn make_invoice(payment_hash: [u8; 32], amount_sat: u64, description: &str) -> String {
    let secp = Secp256k1::new();
    let node_secret = SecretKey::from_slice(&[0x55; 32]).expect("valid key bytes");

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch");

    InvoiceBuilder::new(Currency::Regtest)
        .description(description.to_string())
        .payment_hash(sha256::Hash::from_byte_array(payment_hash))
        .payment_secret(PaymentSecret([0u8; 32]))
        .duration_since_epoch(now)
        .expiry_time(Duration::from_secs(3600))
        .min_final_cltv_expiry_delta(80)
        .amount_milli_satoshis(amount_sat * 1000)
        .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, &node_secret))
        .expect("build signed invoice")
        .to_string()
}
