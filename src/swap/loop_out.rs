use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::{mpsc, oneshot};

use crate::chain::htlc::{LoopOutHtlc, SWEEP_TX_VSIZE, build_sweep_tx};
use crate::chain::{ChainService, Confirmation, SpendDetails};
use crate::keychain::Keychain;
use crate::lightning::{LightningClient, PaymentFailure, PaymentResult};

use super::store::SwapStore;
use super::{SwapContract, SwapHash, SwapState, SwapStatus};

/// Blocks reserved before CLTV expiry. Once the chain is within this many
/// blocks of the HTLC timeout the preimage is never revealed: the sweep
/// could no longer be relied on to confirm before the server's refund
/// path opens.
pub const SAFETY_MARGIN_CONFS: u32 = 20;

const PAYMENT_ATTEMPT_LIMIT: u32 = 3;
const PAYMENT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Driver for a single loop-out swap. Owns the swap's hash: it is the only
/// writer to the swap's store record, and every externally visible effect
/// is preceded by a durable event authorizing it.
pub(crate) struct LoopOutSwap {
    pub hash: SwapHash,
    pub contract: SwapContract,
    pub state: SwapState,
    pub last_hop: Option<[u8; 33]>,
    pub store: Arc<Mutex<SwapStore>>,
    pub lightning: Arc<dyn LightningClient>,
    pub chain: Arc<dyn ChainService>,
    pub keychain: Arc<dyn Keychain>,
    pub status_tx: mpsc::Sender<SwapStatus>,
}

/// One of the two invoice payments, together with its retry budget.
struct PaymentTrack {
    invoice: String,
    max_routing_fee_sat: u64,
    rx: Option<oneshot::Receiver<PaymentResult>>,
    outcome: Option<bool>,
    attempts: u32,
}

impl PaymentTrack {
    fn new(invoice: String, max_routing_fee_sat: u64) -> Self {
        Self {
            invoice,
            max_routing_fee_sat,
            rx: None,
            outcome: None,
            attempts: 0,
        }
    }

    fn failed(&self) -> bool {
        self.outcome == Some(false)
    }
}

impl LoopOutSwap {
    pub(crate) async fn run(mut self) -> Result<()> {
        tracing::info!(
            hash = %hex::encode(self.hash),
            state = ?self.state,
            "running loop-out swap"
        );
        self.publish_status().await;

        let htlc = self.contract.htlc();
        let htlc_spk = htlc.script_pubkey();

        // Entry effects run unconditionally, on fresh starts and resumes
        // alike. Both payments are dispatched even on resume: an invoice
        // the server already settled resolves as success, there is no
        // separate reconfirmation of in-flight payments.
        let mut swap_payment = PaymentTrack::new(
            self.contract.swap_invoice.clone(),
            self.contract.max_swap_routing_fee_sat,
        );
        let mut prepay_payment = PaymentTrack::new(
            self.contract.prepay_invoice.clone(),
            self.contract.max_prepay_routing_fee_sat,
        );
        self.ensure_dispatched(&mut swap_payment, "swap").await;
        self.ensure_dispatched(&mut prepay_payment, "prepay").await;
        if self.offchain_failed(&swap_payment, &prepay_payment, true) {
            return self.finish(SwapState::FailOffchainPayments).await;
        }

        let mut conf_rx = self
            .chain
            .register_conf(&htlc_spk, self.contract.initiation_height)
            .await
            .context("register htlc confirmation")?;
        let mut tick_rx = self
            .chain
            .block_ticks()
            .await
            .context("subscribe block ticks")?;
        let mut spend_rx: Option<mpsc::Receiver<SpendDetails>> = None;
        let mut htlc_conf: Option<Confirmation> = None;

        // With the entry effects in place, decide whether the swap is
        // already past the safety horizon. A revealed swap skips this:
        // the preimage is public and only a sweep can recover the funds.
        let height = self
            .chain
            .current_height()
            .await
            .context("query chain height")?;
        if self.state == SwapState::Initiated && self.expired(height) {
            tracing::warn!(
                hash = %hex::encode(self.hash),
                height,
                cltv_expiry = self.contract.cltv_expiry,
                "htlc expiry reached before preimage reveal"
            );
            return self.finish(SwapState::FailTimeout).await;
        }

        loop {
            tokio::select! {
                result = recv_payment(&mut swap_payment.rx) => {
                    self.on_payment_result(&mut swap_payment, result, "swap").await;
                    if self.offchain_failed(&swap_payment, &prepay_payment, htlc_conf.is_none()) {
                        return self.finish(SwapState::FailOffchainPayments).await;
                    }
                }

                result = recv_payment(&mut prepay_payment.rx) => {
                    self.on_payment_result(&mut prepay_payment, result, "prepay").await;
                    if self.offchain_failed(&swap_payment, &prepay_payment, htlc_conf.is_none()) {
                        return self.finish(SwapState::FailOffchainPayments).await;
                    }
                }

                conf = conf_rx.recv(), if htlc_conf.is_none() => {
                    match conf {
                        Some(conf) => {
                            tracing::info!(
                                hash = %hex::encode(self.hash),
                                outpoint = %conf.outpoint,
                                value_sat = conf.value_sat,
                                height = conf.height,
                                "htlc confirmed"
                            );
                            spend_rx = Some(
                                self.chain
                                    .register_spend(conf.outpoint)
                                    .await
                                    .context("register htlc spend")?,
                            );
                            htlc_conf = Some(conf);
                        }
                        None => {
                            conf_rx = self
                                .chain
                                .register_conf(&htlc_spk, self.contract.initiation_height)
                                .await
                                .context("re-register htlc confirmation")?;
                        }
                    }
                }

                spend = recv_spend(&mut spend_rx) => {
                    match spend {
                        Some(spend) => {
                            tracing::info!(
                                hash = %hex::encode(self.hash),
                                spending_txid = %spend.spending_txid,
                                height = spend.height,
                                "htlc spend confirmed"
                            );
                            return self.finish(SwapState::Success).await;
                        }
                        None => {
                            let conf = htlc_conf.expect("spend watch implies confirmation");
                            spend_rx = Some(
                                self.chain
                                    .register_spend(conf.outpoint)
                                    .await
                                    .context("re-register htlc spend")?,
                            );
                        }
                    }
                }

                tick = tick_rx.recv() => {
                    match tick {
                        Some(height) => {
                            if let Some(done) = self.on_block(height, &htlc, htlc_conf).await? {
                                return self.finish(done).await;
                            }
                        }
                        None => {
                            tick_rx = self
                                .chain
                                .block_ticks()
                                .await
                                .context("re-subscribe block ticks")?;
                        }
                    }
                }
            }
        }
    }

    /// Per-block policy: decide between timing out, revealing the preimage
    /// and (re)broadcasting the sweep. Returns a terminal state when the
    /// swap is over.
    async fn on_block(
        &mut self,
        height: u32,
        htlc: &LoopOutHtlc,
        htlc_conf: Option<Confirmation>,
    ) -> Result<Option<SwapState>> {
        let Some(conf) = htlc_conf else {
            if self.state == SwapState::Initiated && self.expired(height) {
                tracing::warn!(
                    hash = %hex::encode(self.hash),
                    height,
                    cltv_expiry = self.contract.cltv_expiry,
                    "htlc expiry reached before confirmation"
                );
                return Ok(Some(SwapState::FailTimeout));
            }
            return Ok(None);
        };

        if self.state == SwapState::Initiated {
            if self.expired(height) {
                // Confirmed but too close to expiry: revealing now would
                // hand the server both the off-chain payment and a shot at
                // the timeout path.
                tracing::warn!(
                    hash = %hex::encode(self.hash),
                    height,
                    cltv_expiry = self.contract.cltv_expiry,
                    "htlc confirmed too close to expiry to sweep"
                );
                return Ok(Some(SwapState::FailTimeout));
            }

            // Write-ahead: the reveal is durable before any transaction
            // carrying the preimage leaves this process.
            self.transition(SwapState::PreimageRevealed).await?;
        }

        self.try_sweep(htlc, conf).await?;
        Ok(None)
    }

    /// Build and broadcast the sweep for the current fee estimate. A
    /// rejected broadcast is logged and retried on the next block with
    /// fresh fees, always clamped to the contract's miner-fee ceiling.
    async fn try_sweep(&self, htlc: &LoopOutHtlc, conf: Confirmation) -> Result<()> {
        let fee_sat = match self
            .chain
            .fee_rate_sat_per_vb(self.contract.sweep_conf_target)
            .await
        {
            Ok(rate) => (rate * SWEEP_TX_VSIZE).min(self.contract.max_miner_fee_sat),
            Err(err) => {
                tracing::warn!(error = %err, "fee estimation failed, using miner fee ceiling");
                self.contract.max_miner_fee_sat
            }
        };

        let receiver_secret = self
            .keychain
            .secret_key(self.contract.receiver_key_index)
            .context("derive sweep key")?;

        let sweep = match build_sweep_tx(
            htlc,
            conf.outpoint,
            conf.value_sat,
            &self.contract.dest_addr,
            &receiver_secret,
            self.contract.preimage,
            fee_sat,
        ) {
            Ok(sweep) => sweep,
            Err(err) => {
                tracing::warn!(
                    hash = %hex::encode(self.hash),
                    error = %err,
                    "cannot build sweep at current fee, retrying next block"
                );
                return Ok(());
            }
        };

        tracing::info!(
            hash = %hex::encode(self.hash),
            txid = %sweep.compute_txid(),
            fee_sat,
            "broadcasting sweep"
        );
        if let Err(err) = self.chain.broadcast(&sweep).await {
            tracing::warn!(
                hash = %hex::encode(self.hash),
                error = %err,
                "sweep broadcast rejected, retrying next block"
            );
        }

        Ok(())
    }

    /// Dispatch a payment, retrying transient dispatch errors up to the
    /// attempt limit. Exhausting the budget counts as a failed payment.
    async fn ensure_dispatched(&self, track: &mut PaymentTrack, label: &'static str) {
        while track.attempts < PAYMENT_ATTEMPT_LIMIT {
            track.attempts += 1;
            match self
                .lightning
                .dispatch_payment(&track.invoice, track.max_routing_fee_sat, self.last_hop)
                .await
            {
                Ok(rx) => {
                    tracing::debug!(
                        hash = %hex::encode(self.hash),
                        payment = label,
                        attempt = track.attempts,
                        "dispatched payment"
                    );
                    track.rx = Some(rx);
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        hash = %hex::encode(self.hash),
                        payment = label,
                        attempt = track.attempts,
                        error = %format!("{err:#}"),
                        "payment dispatch failed"
                    );
                    tokio::time::sleep(PAYMENT_RETRY_DELAY).await;
                }
            }
        }
        track.outcome = Some(false);
    }

    async fn on_payment_result(
        &self,
        track: &mut PaymentTrack,
        result: Result<PaymentResult, oneshot::error::RecvError>,
        label: &'static str,
    ) {
        track.rx = None;

        let failure = match result {
            Ok(Ok(())) => {
                tracing::info!(hash = %hex::encode(self.hash), payment = label, "payment settled");
                track.outcome = Some(true);
                return;
            }
            Ok(Err(failure)) => failure,
            Err(_) => PaymentFailure::Transient("payment dispatcher dropped".to_string()),
        };

        if failure.is_definitive() {
            tracing::warn!(
                hash = %hex::encode(self.hash),
                payment = label,
                error = %failure,
                "payment failed"
            );
            track.outcome = Some(false);
            return;
        }

        if track.attempts >= PAYMENT_ATTEMPT_LIMIT {
            tracing::warn!(
                hash = %hex::encode(self.hash),
                payment = label,
                error = %failure,
                "payment retries exhausted"
            );
            track.outcome = Some(false);
            return;
        }

        tracing::warn!(
            hash = %hex::encode(self.hash),
            payment = label,
            error = %failure,
            "transient payment failure, retrying"
        );
        tokio::time::sleep(PAYMENT_RETRY_DELAY).await;
        self.ensure_dispatched(track, label).await;
    }

    /// Dual payment failure is the one exit that needs no preimage reveal,
    /// and only while nothing confirmed on-chain: once the HTLC exists the
    /// server may already be out of pocket and the sweep must complete.
    fn offchain_failed(
        &self,
        swap_payment: &PaymentTrack,
        prepay_payment: &PaymentTrack,
        unconfirmed: bool,
    ) -> bool {
        self.state == SwapState::Initiated
            && unconfirmed
            && swap_payment.failed()
            && prepay_payment.failed()
    }

    fn expired(&self, height: u32) -> bool {
        height.saturating_add(SAFETY_MARGIN_CONFS) >= self.contract.cltv_expiry
    }

    async fn transition(&mut self, state: SwapState) -> Result<()> {
        {
            let mut store = self.store.lock().expect("store mutex poisoned");
            store
                .append_event(self.hash, state)
                .context("append state event")?;
        }
        self.state = state;
        tracing::info!(hash = %hex::encode(self.hash), state = ?state, "swap state advanced");
        self.publish_status().await;
        Ok(())
    }

    async fn finish(mut self, state: SwapState) -> Result<()> {
        {
            let mut store = self.store.lock().expect("store mutex poisoned");
            store
                .finalize(self.hash, state)
                .context("finalize swap record")?;
        }
        self.state = state;
        tracing::info!(hash = %hex::encode(self.hash), state = ?state, "swap finished");
        self.publish_status().await;
        Ok(())
    }

    async fn publish_status(&self) {
        let _ = self
            .status_tx
            .send(SwapStatus {
                hash: self.hash,
                state: self.state,
            })
            .await;
    }
}

async fn recv_payment(
    rx: &mut Option<oneshot::Receiver<PaymentResult>>,
) -> Result<PaymentResult, oneshot::error::RecvError> {
    match rx.as_mut() {
        Some(rx) => rx.await,
        // No outstanding payment: this branch never resolves.
        None => std::future::pending().await,
    }
}

async fn recv_spend(rx: &mut Option<mpsc::Receiver<SpendDetails>>) -> Option<SpendDetails> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
