pub mod esplora;
pub mod htlc;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{OutPoint, Script, Transaction, Txid};
use tokio::sync::mpsc;

/// A transaction paying the watched script confirmed on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub outpoint: OutPoint,
    pub value_sat: u64,
    pub height: u32,
}

/// The watched outpoint was spent by a confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendDetails {
    pub spending_txid: Txid,
    pub height: u32,
}

/// Chain notifier and broadcaster consumed by the swap machine.
///
/// Notification receivers must be idempotent to re-registration: a machine
/// whose stream drops re-registers from its last known height and expects
/// to observe the same event again.
#[async_trait]
pub trait ChainService: Send + Sync + 'static {
    /// Watch for a confirmed transaction paying `script_pubkey`, scanning
    /// from `min_height` onward.
    async fn register_conf(
        &self,
        script_pubkey: &Script,
        min_height: u32,
    ) -> Result<mpsc::Receiver<Confirmation>>;

    /// Watch for a confirmed spend of `outpoint`.
    async fn register_spend(&self, outpoint: OutPoint) -> Result<mpsc::Receiver<SpendDetails>>;

    async fn current_height(&self) -> Result<u32>;

    async fn broadcast(&self, tx: &Transaction) -> Result<()>;

    /// Best-chain height, delivered whenever a new block is seen.
    async fn block_ticks(&self) -> Result<mpsc::Receiver<u32>>;

    async fn fee_rate_sat_per_vb(&self, conf_target: u32) -> Result<u64>;
}
