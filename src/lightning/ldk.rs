use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::{Bolt11SendRequest, ListPaymentsRequest};
use ldk_server_protos::types::{PaymentDirection, PaymentStatus, payment_kind};
use tokio::sync::oneshot;

use super::{LightningClient, PaymentFailure, PaymentResult};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Payment dispatcher backed by an ldk-server REST endpoint.
#[derive(Clone)]
pub struct LdkLightningClient {
    client: LdkServerClient,
}

impl LdkLightningClient {
    pub fn new(rest_service_address: String) -> Self {
        Self {
            client: LdkServerClient::new(rest_service_address),
        }
    }
}

#[async_trait]
impl LightningClient for LdkLightningClient {
    async fn dispatch_payment(
        &self,
        invoice: &str,
        max_routing_fee_sat: u64,
        last_hop: Option<[u8; 33]>,
    ) -> Result<oneshot::Receiver<PaymentResult>> {
        if last_hop.is_some() {
            tracing::debug!("ldk-server backend does not constrain the last hop; ignoring");
        }

        let resp = self
            .client
            .bolt11_send(Bolt11SendRequest {
                invoice: invoice.to_string(),
                amount_msat: None,
                route_parameters: None,
            })
            .await
            .context("Bolt11Send")?;
        let payment_id = resp.payment_id;

        tracing::debug!(%payment_id, max_routing_fee_sat, "dispatched bolt11 payment");

        let (result_tx, result_rx) = oneshot::channel();
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = await_payment_outcome(client, &payment_id).await;
            let _ = result_tx.send(result);
        });

        Ok(result_rx)
    }
}

/// Poll the payment list until the payment settles or fails. A payment
/// still in flight never resolves here: reporting failure for an in-flight
/// payment would let the machine abandon a swap the server can still pull
/// funds for.
async fn await_payment_outcome(client: LdkServerClient, payment_id: &str) -> PaymentResult {
    loop {
        match lookup_payment_status(&client, payment_id).await {
            Ok(Some(PaymentStatus::Succeeded)) => return Ok(()),
            Ok(Some(PaymentStatus::Failed)) => {
                return Err(PaymentFailure::Definitive(format!(
                    "payment {payment_id} failed"
                )));
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%payment_id, error = %err, "payment status lookup failed");
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn lookup_payment_status(
    client: &LdkServerClient,
    payment_id: &str,
) -> Result<Option<PaymentStatus>> {
    let payments = client
        .list_payments(ListPaymentsRequest { page_token: None })
        .await
        .context("ListPayments")?
        .payments;

    let Some(payment) = payments.into_iter().find(|p| p.id == payment_id) else {
        return Ok(None);
    };

    if payment.direction != PaymentDirection::Outbound as i32
        || !matches!(
            payment.kind.as_ref().and_then(|k| k.kind.as_ref()),
            Some(payment_kind::Kind::Bolt11(_))
        )
    {
        return Ok(None);
    }

    PaymentStatus::try_from(payment.status)
        .map(Some)
        .context("unknown payment status")
}
