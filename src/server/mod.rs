pub mod grpc;

use anyhow::Result;
use async_trait::async_trait;

/// Terms the server answers a loop-out request with. Invoice amounts are
/// validated against the client's fee ceilings before anything is paid.
#[derive(Debug, Clone)]
pub struct LoopOutTerms {
    pub swap_invoice: String,
    pub prepay_invoice: String,
    pub sender_key: [u8; 33],
    pub cltv_expiry: u32,
}

/// Counterparty swap server.
#[async_trait]
pub trait SwapServer: Send + Sync + 'static {
    async fn new_loop_out_swap(
        &self,
        swap_hash: [u8; 32],
        amount_sat: u64,
        receiver_key: [u8; 33],
    ) -> Result<LoopOutTerms>;
}
