pub mod invoice;
pub mod ldk;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Final outcome of a dispatched payment. Anything still in flight has no
/// outcome yet; the receiver resolves exactly once.
pub type PaymentResult = Result<(), PaymentFailure>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentFailure {
    /// The recipient rejected the hash outright. Definitive: the payment
    /// can never settle.
    #[error("recipient does not know the payment hash")]
    UnknownPaymentHash,

    /// The payment failed for good after routing completed.
    #[error("payment failed: {0}")]
    Definitive(String),

    /// The backend could not (yet) produce an outcome. The dispatch may be
    /// retried.
    #[error("transient payment error: {0}")]
    Transient(String),
}

impl PaymentFailure {
    /// Definitive failures rule the payment out for good; transient ones
    /// leave it retryable.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, PaymentFailure::Transient(_))
    }
}

/// Off-chain payment dispatcher. `dispatch_payment` returns immediately
/// with a one-shot receiver that resolves when the payment settles or
/// definitively fails; a dropped sender reads as a transient failure.
#[async_trait]
pub trait LightningClient: Send + Sync + 'static {
    async fn dispatch_payment(
        &self,
        invoice: &str,
        max_routing_fee_sat: u64,
        last_hop: Option<[u8; 33]>,
    ) -> Result<oneshot::Receiver<PaymentResult>>;
}
