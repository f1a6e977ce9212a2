use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use rand::RngCore as _;
use tokio::sync::mpsc;

use crate::chain::ChainService;
use crate::chain::htlc::sha256_preimage;
use crate::keychain::Keychain;
use crate::lightning::LightningClient;
use crate::server::SwapServer;

use super::fees::validate_loop_out_terms;
use super::loop_out::LoopOutSwap;
use super::store::SwapStore;
use super::{LoopOutRequest, PersistentSwap, SwapContract, SwapHash, SwapState, SwapStatus};

/// Entry point for loop-out swaps: initiates new ones, resumes persisted
/// ones, and runs each behind its own task. State changes from every
/// machine arrive on the status receiver returned by [`SwapClient::new`].
pub struct SwapClient {
    store: Arc<Mutex<SwapStore>>,
    server: Arc<dyn SwapServer>,
    lightning: Arc<dyn LightningClient>,
    chain: Arc<dyn ChainService>,
    keychain: Arc<dyn Keychain>,
    status_tx: mpsc::Sender<SwapStatus>,
}

impl SwapClient {
    pub fn new(
        store: Arc<Mutex<SwapStore>>,
        server: Arc<dyn SwapServer>,
        lightning: Arc<dyn LightningClient>,
        chain: Arc<dyn ChainService>,
        keychain: Arc<dyn Keychain>,
    ) -> (Self, mpsc::Receiver<SwapStatus>) {
        let (status_tx, status_rx) = mpsc::channel(16);
        (
            Self {
                store,
                server,
                lightning,
                chain,
                keychain,
                status_tx,
            },
            status_rx,
        )
    }

    /// Initiate a loop-out swap. Asks the server for invoices, validates
    /// them against the request's fee ceilings, persists the contract and
    /// spawns the swap machine. Nothing is persisted or paid when the
    /// validation rejects the quote.
    pub async fn loop_out(&self, req: LoopOutRequest) -> Result<SwapHash> {
        let mut preimage = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut preimage);
        let hash = sha256_preimage(&preimage);

        let (receiver_key_index, receiver_key) =
            self.keychain.next_key().context("derive receiver key")?;

        let terms = self
            .server
            .new_loop_out_swap(hash, req.amount_sat, receiver_key)
            .await
            .context("request swap terms")?;

        validate_loop_out_terms(&req, hash, &terms)?;

        let initiation_height = self
            .chain
            .current_height()
            .await
            .context("query chain height")?;

        let contract = SwapContract {
            amount_requested_sat: req.amount_sat,
            preimage,
            dest_addr: req.dest_addr,
            swap_invoice: terms.swap_invoice,
            prepay_invoice: terms.prepay_invoice,
            cltv_expiry: terms.cltv_expiry,
            sender_key: terms.sender_key,
            receiver_key,
            receiver_key_index,
            sweep_conf_target: req.sweep_conf_target,
            initiation_height,
            max_miner_fee_sat: req.max_miner_fee_sat,
            max_swap_fee_sat: req.max_swap_fee_sat,
            max_prepay_amount_sat: req.max_prepay_amount_sat,
            max_prepay_routing_fee_sat: req.max_prepay_routing_fee_sat,
            max_swap_routing_fee_sat: req.max_swap_routing_fee_sat,
        };

        {
            let mut store = self.store.lock().expect("store mutex poisoned");
            store.create_swap(hash, &contract)?;
            store
                .append_event(hash, SwapState::Initiated)
                .context("record initiated state")?;
        }

        tracing::info!(
            hash = %hex::encode(hash),
            amount_sat = req.amount_sat,
            cltv_expiry = contract.cltv_expiry,
            initiation_height,
            "initiated loop-out swap"
        );

        self.spawn_swap(hash, contract, SwapState::Initiated, req.last_hop);
        Ok(hash)
    }

    /// Load every non-terminal swap from the store and spawn a machine for
    /// each, seeded with its last recorded state.
    pub async fn resume_all(&self) -> Result<usize> {
        let pending = {
            let store = self.store.lock().expect("store mutex poisoned");
            store.load_pending().context("load pending swaps")?
        };

        let count = pending.len();
        for swap in pending {
            let state = swap.last_state().unwrap_or(SwapState::Initiated);
            tracing::info!(
                hash = %hex::encode(swap.hash),
                state = ?state,
                "resuming swap"
            );
            self.spawn_swap(swap.hash, swap.contract, state, None);
        }
        Ok(count)
    }

    pub fn list_swaps(&self) -> Result<Vec<PersistentSwap>> {
        let store = self.store.lock().expect("store mutex poisoned");
        store.list_swaps()
    }

    fn spawn_swap(
        &self,
        hash: SwapHash,
        contract: SwapContract,
        state: SwapState,
        last_hop: Option<[u8; 33]>,
    ) {
        let machine = LoopOutSwap {
            hash,
            contract,
            state,
            last_hop,
            store: self.store.clone(),
            lightning: self.lightning.clone(),
            chain: self.chain.clone(),
            keychain: self.keychain.clone(),
            status_tx: self.status_tx.clone(),
        };

        tokio::spawn(async move {
            if let Err(err) = machine.run().await {
                tracing::error!(
                    hash = %hex::encode(hash),
                    error = %format!("{err:#}"),
                    "swap machine failed"
                );
            }
        });
    }
}
