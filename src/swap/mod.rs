pub mod client;
pub mod fees;
pub mod loop_out;
pub mod store;

use bitcoin::Address;
use serde::{Deserialize, Serialize};

use crate::chain::htlc::{LoopOutHtlc, sha256_preimage};

/// SHA-256 of the swap preimage; identifies the swap everywhere.
pub type SwapHash = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    /// Contract persisted, payments dispatched, HTLC awaited.
    Initiated,
    /// The preimage is (about to be) public through a sweep witness. The
    /// only way forward is sweeping.
    PreimageRevealed,
    /// Sweep confirmed; the swap completed.
    Success,
    /// Both invoice payments failed before the HTLC confirmed. No funds
    /// were at risk.
    FailOffchainPayments,
    /// The HTLC expired before the preimage could safely be revealed.
    FailTimeout,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapState::Success | SwapState::FailOffchainPayments | SwapState::FailTimeout
        )
    }
}

/// Rejections surfaced before anything is persisted or paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SwapError {
    #[error("total swap fee exceeds the configured maximum")]
    SwapFeeTooHigh,

    #[error("prepay amount exceeds the configured maximum")]
    PrepayAmountTooHigh,

    #[error("a swap for this payment hash already exists")]
    DuplicateSwap,
}

/// Caller-facing loop-out parameters. The ceilings bound every sat the
/// swap may cost; violating quotes are rejected before payment.
#[derive(Debug, Clone)]
pub struct LoopOutRequest {
    pub amount_sat: u64,
    pub dest_addr: Address,
    pub max_swap_routing_fee_sat: u64,
    pub max_prepay_routing_fee_sat: u64,
    pub max_swap_fee_sat: u64,
    pub max_prepay_amount_sat: u64,
    pub max_miner_fee_sat: u64,
    pub sweep_conf_target: u32,
    pub last_hop: Option<[u8; 33]>,
}

/// Immutable per-swap terms, fixed once the server quote passes
/// validation.
#[derive(Debug, Clone)]
pub struct SwapContract {
    pub amount_requested_sat: u64,
    pub preimage: [u8; 32],
    pub dest_addr: Address,
    pub swap_invoice: String,
    pub prepay_invoice: String,
    pub cltv_expiry: u32,
    pub sender_key: [u8; 33],
    pub receiver_key: [u8; 33],
    pub receiver_key_index: u32,
    pub sweep_conf_target: u32,
    pub initiation_height: u32,
    pub max_miner_fee_sat: u64,
    pub max_swap_fee_sat: u64,
    pub max_prepay_amount_sat: u64,
    pub max_prepay_routing_fee_sat: u64,
    pub max_swap_routing_fee_sat: u64,
}

impl SwapContract {
    pub fn payment_hash(&self) -> SwapHash {
        sha256_preimage(&self.preimage)
    }

    pub fn htlc(&self) -> LoopOutHtlc {
        LoopOutHtlc {
            payment_hash: self.payment_hash(),
            receiver_key: self.receiver_key,
            sender_key: self.sender_key,
            cltv_expiry: self.cltv_expiry,
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEvent {
    pub state: SwapState,
    pub created_at: i64,
}

/// A stored swap: contract plus its full transition log.
#[derive(Debug, Clone)]
pub struct PersistentSwap {
    pub hash: SwapHash,
    pub contract: SwapContract,
    pub events: Vec<SwapEvent>,
}

impl PersistentSwap {
    pub fn last_state(&self) -> Option<SwapState> {
        self.events.last().map(|event| event.state)
    }
}

/// In-memory state update published by a running swap machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStatus {
    pub hash: SwapHash,
    pub state: SwapState,
}
