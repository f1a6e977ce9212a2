use std::str::FromStr as _;
use std::time::SystemTime;

use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;

fn parse_bolt11(bolt11: &str) -> Result<Bolt11Invoice> {
    Bolt11Invoice::from_str(bolt11).map_err(|e| anyhow::anyhow!("invalid bolt11 invoice: {e}"))
}

/// Payment hash the invoice settles against.
pub fn payment_hash_from_bolt11(bolt11: &str) -> Result<[u8; 32]> {
    Ok(parse_bolt11(bolt11)?.payment_hash().to_byte_array())
}

/// Invoice amount rounded up to whole satoshis, the unit all fee ceilings
/// are expressed in. `None` for amountless invoices.
pub fn amount_sat_from_bolt11(bolt11: &str) -> Result<Option<u64>> {
    let amount_msat = parse_bolt11(bolt11)?.amount_milli_satoshis();
    Ok(amount_msat.map(|msat| msat.div_ceil(1000)))
}

/// Whether the invoice can no longer be paid. Invoices without an expiry
/// never go stale.
pub fn is_expired_bolt11(bolt11: &str) -> Result<bool> {
    let Some(expires_at) = parse_bolt11(bolt11)?.expires_at() else {
        return Ok(false);
    };

    let since_epoch = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .context("system clock is before the unix epoch")?;
    Ok(since_epoch >= expires_at)
}
