use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, Script, ScriptBuf, Transaction};
use tokio::sync::{mpsc, oneshot};

use ln_loop::chain::{ChainService, Confirmation, SpendDetails};
use ln_loop::lightning::{LightningClient, PaymentResult};
use ln_loop::server::{LoopOutTerms, SwapServer};

use super::invoice::make_invoice;

/// Height the mock chain starts at, matching the scenario fixtures: a
/// CLTV of 744 is comfortably ahead, 610 is already inside the safety
/// margin.
pub const TEST_HEIGHT: u32 = 600;

/// A payment the machine handed to the Lightning adapter. Send on
/// `result_tx` to settle or fail it.
pub struct PaymentIntent {
    pub invoice: String,
    pub max_routing_fee_sat: u64,
    pub result_tx: oneshot::Sender<PaymentResult>,
}

pub struct MockLightning {
    dispatched_tx: mpsc::UnboundedSender<PaymentIntent>,
}

impl MockLightning {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PaymentIntent>) {
        let (dispatched_tx, dispatched_rx) = mpsc::unbounded_channel();
        (Self { dispatched_tx }, dispatched_rx)
    }
}

#[async_trait]
impl LightningClient for MockLightning {
    async fn dispatch_payment(
        &self,
        invoice: &str,
        max_routing_fee_sat: u64,
        _last_hop: Option<[u8; 33]>,
    ) -> Result<oneshot::Receiver<PaymentResult>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.dispatched_tx
            .send(PaymentIntent {
                invoice: invoice.to_string(),
                max_routing_fee_sat,
                result_tx,
            })
            .map_err(|_| anyhow::anyhow!("test dropped the payment receiver"))?;
        Ok(result_rx)
    }
}

/// Everything the machine asked the chain to do, in order.
pub enum ChainEvent {
    ConfRegistered {
        script_pubkey: ScriptBuf,
        min_height: u32,
        conf_tx: mpsc::Sender<Confirmation>,
    },
    SpendRegistered {
        outpoint: OutPoint,
        spend_tx: mpsc::Sender<SpendDetails>,
    },
    Broadcast(Transaction),
}

#[derive(Clone)]
pub struct MockChain {
    height: Arc<AtomicU32>,
    events_tx: mpsc::UnboundedSender<ChainEvent>,
    tick_txs: Arc<Mutex<Vec<mpsc::Sender<u32>>>>,
    fee_rate_sat_per_vb: u64,
}

impl MockChain {
    pub fn new(height: u32) -> (Self, mpsc::UnboundedReceiver<ChainEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                height: Arc::new(AtomicU32::new(height)),
                events_tx,
                tick_txs: Arc::new(Mutex::new(Vec::new())),
                fee_rate_sat_per_vb: 1,
            },
            events_rx,
        )
    }

    /// Advance the chain and deliver a block tick to every subscriber.
    pub async fn tick(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
        let tick_txs = self.tick_txs.lock().expect("tick mutex poisoned").clone();
        for tick_tx in tick_txs {
            let _ = tick_tx.send(height).await;
        }
    }
}

#[async_trait]
impl ChainService for MockChain {
    async fn register_conf(
        &self,
        script_pubkey: &Script,
        min_height: u32,
    ) -> Result<mpsc::Receiver<Confirmation>> {
        let (conf_tx, conf_rx) = mpsc::channel(4);
        self.events_tx
            .send(ChainEvent::ConfRegistered {
                script_pubkey: script_pubkey.into(),
                min_height,
                conf_tx,
            })
            .map_err(|_| anyhow::anyhow!("test dropped the chain event receiver"))?;
        Ok(conf_rx)
    }

    async fn register_spend(&self, outpoint: OutPoint) -> Result<mpsc::Receiver<SpendDetails>> {
        let (spend_tx, spend_rx) = mpsc::channel(4);
        self.events_tx
            .send(ChainEvent::SpendRegistered { outpoint, spend_tx })
            .map_err(|_| anyhow::anyhow!("test dropped the chain event receiver"))?;
        Ok(spend_rx)
    }

    async fn current_height(&self) -> Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<()> {
        self.events_tx
            .send(ChainEvent::Broadcast(tx.clone()))
            .map_err(|_| anyhow::anyhow!("test dropped the chain event receiver"))?;
        Ok(())
    }

    async fn block_ticks(&self) -> Result<mpsc::Receiver<u32>> {
        let (tick_tx, tick_rx) = mpsc::channel(8);
        self.tick_txs
            .lock()
            .expect("tick mutex poisoned")
            .push(tick_tx);
        Ok(tick_rx)
    }

    async fn fee_rate_sat_per_vb(&self, _conf_target: u32) -> Result<u64> {
        Ok(self.fee_rate_sat_per_vb)
    }
}

/// Swap server quoting a fixed fee structure; nudge the fields to build
/// over-priced quotes.
pub struct MockSwapServer {
    pub swap_fee_base_sat: u64,
    pub prepay_amount_sat: u64,
    pub cltv_delta: u32,
}

impl Default for MockSwapServer {
    fn default() -> Self {
        // 950 + 100 prepay lands exactly on the scenario fee cap of 1050.
        Self {
            swap_fee_base_sat: 950,
            prepay_amount_sat: 100,
            cltv_delta: 144,
        }
    }
}

impl MockSwapServer {
    pub fn sender_key() -> [u8; 33] {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x66; 32]).expect("valid key bytes");
        PublicKey::from_secret_key(&secp, &secret).serialize()
    }
}

#[async_trait]
impl SwapServer for MockSwapServer {
    async fn new_loop_out_swap(
        &self,
        swap_hash: [u8; 32],
        amount_sat: u64,
        _receiver_key: [u8; 33],
    ) -> Result<LoopOutTerms> {
        Ok(LoopOutTerms {
            swap_invoice: make_invoice(
                swap_hash,
                amount_sat + self.swap_fee_base_sat,
                "swap",
            ),
            prepay_invoice: make_invoice(swap_hash, self.prepay_amount_sat, "prepay"),
            sender_key: Self::sender_key(),
            cltv_expiry: TEST_HEIGHT + self.cltv_delta,
        })
    }
}
