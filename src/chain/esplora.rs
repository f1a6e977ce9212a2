use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::{OutPoint, Script, ScriptBuf, Transaction, Txid};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{ChainService, Confirmation, SpendDetails};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Chain backend polling an Esplora REST endpoint. Confirmation and spend
/// watches are long-poll tasks; each delivers its event once and exits.
#[derive(Clone)]
pub struct EsploraChain {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct TxInfo {
    txid: String,
    status: TxStatus,
    vout: Vec<VoutInfo>,
}

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct VoutInfo {
    scriptpubkey: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct OutspendInfo {
    spent: bool,
    txid: Option<String>,
    status: Option<TxStatus>,
}

impl EsploraChain {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(resp.status().is_success(), "GET {url}: {}", resp.status());
        resp.text().await.with_context(|| format!("read {url}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(resp.status().is_success(), "GET {url}: {}", resp.status());
        resp.json().await.with_context(|| format!("decode {url}"))
    }

    async fn tip_height(&self) -> Result<u32> {
        self.get_text("/blocks/tip/height")
            .await?
            .trim()
            .parse()
            .context("parse tip height")
    }

    async fn script_history(&self, script_pubkey: &Script) -> Result<Vec<TxInfo>> {
        let hash = electrum_script_hash_hex(script_pubkey);
        self.get_json(&format!("/scripthash/{hash}/txs")).await
    }
}

/// Electrum-style script hash: SHA-256 of the scriptPubKey, byte-reversed,
/// as used by the Esplora scripthash endpoints.
fn electrum_script_hash_hex(script_pubkey: &Script) -> String {
    let mut hash = sha256::Hash::hash(script_pubkey.as_bytes()).to_byte_array();
    hash.reverse();
    hex::encode(hash)
}

#[async_trait]
impl ChainService for EsploraChain {
    async fn register_conf(
        &self,
        script_pubkey: &Script,
        min_height: u32,
    ) -> Result<mpsc::Receiver<Confirmation>> {
        let (conf_tx, conf_rx) = mpsc::channel(1);
        let chain = self.clone();
        let script_pubkey: ScriptBuf = script_pubkey.into();
        let spk_hex = hex::encode(script_pubkey.as_bytes());

        tokio::spawn(async move {
            loop {
                match chain.script_history(&script_pubkey).await {
                    Ok(txs) => {
                        for tx in txs {
                            let Some(height) = tx.status.block_height else {
                                continue;
                            };
                            if !tx.status.confirmed || height < min_height {
                                continue;
                            }
                            let Some((vout, out)) = tx
                                .vout
                                .iter()
                                .enumerate()
                                .find(|(_, out)| out.scriptpubkey == spk_hex)
                            else {
                                continue;
                            };
                            let Ok(txid) = tx.txid.parse::<Txid>() else {
                                tracing::warn!(txid = %tx.txid, "esplora returned unparseable txid");
                                continue;
                            };

                            let conf = Confirmation {
                                outpoint: OutPoint {
                                    txid,
                                    vout: vout as u32,
                                },
                                value_sat: out.value,
                                height,
                            };
                            let _ = conf_tx.send(conf).await;
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "esplora script history poll failed");
                    }
                }

                if conf_tx.is_closed() {
                    return;
                }
                tokio::time::sleep(chain.poll_interval).await;
            }
        });

        Ok(conf_rx)
    }

    async fn register_spend(&self, outpoint: OutPoint) -> Result<mpsc::Receiver<SpendDetails>> {
        let (spend_tx, spend_rx) = mpsc::channel(1);
        let chain = self.clone();

        tokio::spawn(async move {
            let path = format!("/tx/{}/outspend/{}", outpoint.txid, outpoint.vout);
            loop {
                match chain.get_json::<OutspendInfo>(&path).await {
                    Ok(outspend) => {
                        if let Some(details) = confirmed_spend(&outspend) {
                            let _ = spend_tx.send(details).await;
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "esplora outspend poll failed");
                    }
                }

                if spend_tx.is_closed() {
                    return;
                }
                tokio::time::sleep(chain.poll_interval).await;
            }
        });

        Ok(spend_rx)
    }

    async fn current_height(&self) -> Result<u32> {
        self.tip_height().await
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<()> {
        let url = format!("{}/tx", self.base_url);
        let resp = self
            .http
            .post(&url)
            .body(bitcoin::consensus::encode::serialize_hex(tx))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("broadcast rejected: {status}: {body}");
        }
        Ok(())
    }

    async fn block_ticks(&self) -> Result<mpsc::Receiver<u32>> {
        let (tick_tx, tick_rx) = mpsc::channel(8);
        let chain = self.clone();

        tokio::spawn(async move {
            let mut last_height = None;
            loop {
                match chain.tip_height().await {
                    Ok(height) if last_height != Some(height) => {
                        last_height = Some(height);
                        if tick_tx.send(height).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "esplora tip height poll failed");
                    }
                }

                if tick_tx.is_closed() {
                    return;
                }
                tokio::time::sleep(chain.poll_interval).await;
            }
        });

        Ok(tick_rx)
    }

    async fn fee_rate_sat_per_vb(&self, conf_target: u32) -> Result<u64> {
        let estimates: HashMap<String, f64> = self.get_json("/fee-estimates").await?;

        // Esplora keys the map by confirmation target. Pick the largest
        // target at or below ours so the estimate is never slower.
        let mut best: Option<(u32, f64)> = None;
        for (target, rate) in &estimates {
            let Ok(target) = target.parse::<u32>() else {
                continue;
            };
            if target <= conf_target && best.is_none_or(|(t, _)| target > t) {
                best = Some((target, *rate));
            }
        }

        let rate = best.map(|(_, rate)| rate).unwrap_or(1.0);
        Ok((rate.ceil() as u64).max(1))
    }
}

fn confirmed_spend(outspend: &OutspendInfo) -> Option<SpendDetails> {
    if !outspend.spent {
        return None;
    }
    let status = outspend.status.as_ref()?;
    if !status.confirmed {
        return None;
    }
    let txid = outspend.txid.as_ref()?.parse().ok()?;
    Some(SpendDetails {
        spending_txid: txid,
        height: status.block_height?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmed_spend_requires_confirmation() {
        let unspent = OutspendInfo {
            spent: false,
            txid: None,
            status: None,
        };
        assert_eq!(confirmed_spend(&unspent), None);

        let mempool_spend = OutspendInfo {
            spent: true,
            txid: Some(
                "0101010101010101010101010101010101010101010101010101010101010101".into(),
            ),
            status: Some(TxStatus {
                confirmed: false,
                block_height: None,
            }),
        };
        assert_eq!(confirmed_spend(&mempool_spend), None);

        let confirmed = OutspendInfo {
            status: Some(TxStatus {
                confirmed: true,
                block_height: Some(650),
            }),
            ..mempool_spend
        };
        let details = confirmed_spend(&confirmed).expect("confirmed spend");
        assert_eq!(details.height, 650);
    }
}
