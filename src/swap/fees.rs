use anyhow::{Context as _, Result};

use crate::lightning::invoice::{
    amount_sat_from_bolt11, is_expired_bolt11, payment_hash_from_bolt11,
};
use crate::server::LoopOutTerms;

use super::{LoopOutRequest, SwapError, SwapHash};

/// Validate the server's quoted invoices against the client's ceilings.
/// Runs before anything is persisted or paid: a failure here leaves no
/// trace and costs nothing.
pub fn validate_loop_out_terms(
    req: &LoopOutRequest,
    hash: SwapHash,
    terms: &LoopOutTerms,
) -> Result<()> {
    let swap_hash = payment_hash_from_bolt11(&terms.swap_invoice).context("parse swap invoice")?;
    anyhow::ensure!(swap_hash == hash, "swap invoice pays a different hash");

    let prepay_hash =
        payment_hash_from_bolt11(&terms.prepay_invoice).context("parse prepay invoice")?;
    anyhow::ensure!(prepay_hash == hash, "prepay invoice pays a different hash");

    anyhow::ensure!(
        !is_expired_bolt11(&terms.swap_invoice).context("parse swap invoice")?,
        "swap invoice is already expired"
    );
    anyhow::ensure!(
        !is_expired_bolt11(&terms.prepay_invoice).context("parse prepay invoice")?,
        "prepay invoice is already expired"
    );

    let swap_amt_sat = amount_sat_from_bolt11(&terms.swap_invoice)
        .context("parse swap invoice")?
        .context("swap invoice must carry an amount")?;
    let prepay_amt_sat = amount_sat_from_bolt11(&terms.prepay_invoice)
        .context("parse prepay invoice")?
        .context("prepay invoice must carry an amount")?;

    check_limits(req, swap_amt_sat, prepay_amt_sat)?;
    Ok(())
}

/// The fee arithmetic behind [`validate_loop_out_terms`]: the total server
/// fee is whatever both invoices ask beyond the requested amount.
fn check_limits(
    req: &LoopOutRequest,
    swap_amt_sat: u64,
    prepay_amt_sat: u64,
) -> Result<(), SwapError> {
    let total_fee = swap_amt_sat
        .saturating_add(prepay_amt_sat)
        .saturating_sub(req.amount_sat);
    if total_fee > req.max_swap_fee_sat {
        return Err(SwapError::SwapFeeTooHigh);
    }

    if prepay_amt_sat > req.max_prepay_amount_sat {
        return Err(SwapError::PrepayAmountTooHigh);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::{Address, CompressedPublicKey, Network};

    use super::*;

    fn test_request() -> LoopOutRequest {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x33; 32]).expect("valid key bytes");
        let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, &secret));

        LoopOutRequest {
            amount_sat: 50_000,
            dest_addr: Address::p2wpkh(pubkey, Network::Regtest),
            max_swap_routing_fee_sat: 70_000,
            max_prepay_routing_fee_sat: 75_000,
            max_swap_fee_sat: 1_050,
            max_prepay_amount_sat: 100,
            max_miner_fee_sat: 50_000,
            sweep_conf_target: 2,
            last_hop: None,
        }
    }

    #[test]
    fn accepts_fees_at_the_cap() {
        let req = test_request();
        // 950 + 100 = exactly max_swap_fee over the requested amount.
        assert_eq!(check_limits(&req, 50_950, 100), Ok(()));
    }

    #[test]
    fn rejects_total_fee_one_over_cap() {
        let req = test_request();
        assert_eq!(
            check_limits(&req, 50_960, 100),
            Err(SwapError::SwapFeeTooHigh)
        );
    }

    #[test]
    fn rejects_prepay_over_cap_even_when_total_fits() {
        let req = test_request();
        // Total stays at the cap, but the prepaid portion alone is over.
        assert_eq!(
            check_limits(&req, 50_940, 110),
            Err(SwapError::PrepayAmountTooHigh)
        );
    }

    #[test]
    fn invoices_below_requested_amount_are_not_a_fee() {
        let req = test_request();
        assert_eq!(check_limits(&req, 49_000, 50), Ok(()));
    }
}
