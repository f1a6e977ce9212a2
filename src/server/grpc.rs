use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tonic::transport::Channel;

use crate::proto::v1 as pb;
use crate::proto::v1::swap_server_client::SwapServerClient;

use super::{LoopOutTerms, SwapServer};

/// gRPC client for the swap-server protocol.
pub struct GrpcSwapServer {
    client: SwapServerClient<Channel>,
}

impl GrpcSwapServer {
    pub async fn connect(url: String) -> Result<Self> {
        let client = SwapServerClient::connect(url.clone())
            .await
            .with_context(|| format!("connect swap server {url}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SwapServer for GrpcSwapServer {
    async fn new_loop_out_swap(
        &self,
        swap_hash: [u8; 32],
        amount_sat: u64,
        receiver_key: [u8; 33],
    ) -> Result<LoopOutTerms> {
        let mut client = self.client.clone();
        let resp = client
            .new_loop_out_swap(pb::NewLoopOutSwapRequest {
                swap_hash: swap_hash.to_vec(),
                amount_sat,
                receiver_key: receiver_key.to_vec(),
            })
            .await
            .context("NewLoopOutSwap")?
            .into_inner();

        let sender_key: [u8; 33] = resp
            .sender_key
            .try_into()
            .map_err(|_| anyhow::anyhow!("sender_key must be 33 bytes"))?;

        Ok(LoopOutTerms {
            swap_invoice: resp.swap_invoice,
            prepay_invoice: resp.prepay_invoice,
            sender_key,
            cltv_expiry: resp.cltv_expiry,
        })
    }
}
