use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use bitcoin::{Address, Network};
use clap::{Parser as _, Subcommand};
use ln_loop::chain::esplora::EsploraChain;
use ln_loop::keychain::SoftwareKeychain;
use ln_loop::lightning::ldk::LdkLightningClient;
use ln_loop::server::grpc::GrpcSwapServer;
use ln_loop::swap::client::SwapClient;
use ln_loop::swap::store::SwapStore;
use ln_loop::swap::{LoopOutRequest, SwapState};
use serde_json::json;

#[derive(Debug, clap::Parser)]
#[command(name = "lnloop", about = "Lightning loop-out swap client")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:11009")]
    server_grpc_url: String,

    #[arg(long, default_value = "http://127.0.0.1:3002")]
    esplora_url: String,

    #[arg(long, default_value = "127.0.0.1:3001")]
    ldk_rest_addr: String,

    #[arg(long, default_value = "lnloop/store.sqlite3")]
    store_path: PathBuf,

    #[arg(long, default_value = "regtest")]
    network: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Swap channel funds in: pay off-chain, receive at an on-chain
    /// address once the HTLC is swept.
    In {
        /// Amount in satoshis to swap.
        amt: Option<u64>,

        /// Amount in satoshis to swap (alternative to the positional
        /// argument).
        #[arg(long = "amt")]
        amt_flag: Option<u64>,

        /// Address the swept funds are sent to.
        #[arg(long)]
        dest: String,

        /// Hex-encoded 32-byte seed the swap keys are derived from.
        #[arg(long)]
        seed_hex: String,

        /// Exit right after initiation instead of monitoring the swap;
        /// a later invocation resumes it.
        #[arg(long)]
        external: bool,

        /// Pubkey of the last hop to use for the off-chain payments.
        #[arg(long)]
        last_hop: Option<String>,

        #[arg(long, default_value_t = 1_000)]
        max_swap_fee_sat: u64,

        #[arg(long, default_value_t = 100)]
        max_prepay_amount_sat: u64,

        #[arg(long, default_value_t = 50_000)]
        max_miner_fee_sat: u64,

        #[arg(long, default_value_t = 2_000)]
        max_swap_routing_fee_sat: u64,

        #[arg(long, default_value_t = 1_000)]
        max_prepay_routing_fee_sat: u64,

        #[arg(long, default_value_t = 6)]
        sweep_conf_target: u32,
    },

    /// Print all stored swaps with their event logs.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_loop::logging::init().ok();
    let args = Args::parse();

    let network = parse_network(&args.network)?;
    let store = SwapStore::open(args.store_path.clone()).context("open swap store")?;

    match args.command {
        Command::In {
            amt,
            amt_flag,
            dest,
            seed_hex,
            external,
            last_hop,
            max_swap_fee_sat,
            max_prepay_amount_sat,
            max_miner_fee_sat,
            max_swap_routing_fee_sat,
            max_prepay_routing_fee_sat,
            sweep_conf_target,
        } => {
            let amount_sat = amt_flag
                .or(amt)
                .context("an amount is required, either positional or --amt")?;

            let dest_addr = Address::from_str(&dest)
                .map_err(|e| anyhow::anyhow!("invalid dest address: {e}"))?
                .require_network(network)
                .context("dest address network mismatch")?;

            let last_hop = last_hop
                .map(|s| parse_pubkey(&s))
                .transpose()
                .context("parse last_hop")?;

            let seed = hex::decode(&seed_hex).context("decode seed_hex")?;
            anyhow::ensure!(seed.len() == 32, "seed must be 32 bytes");

            // Indices below the stored swap count are already in use.
            let used_keys = store.list_swaps().context("list swaps")?.len() as u32;
            let keychain = SoftwareKeychain::new(&seed, network, used_keys)
                .context("create swap keychain")?;

            let server = GrpcSwapServer::connect(args.server_grpc_url.clone())
                .await
                .context("connect swap server")?;
            let lightning = LdkLightningClient::new(args.ldk_rest_addr.clone());
            let chain = EsploraChain::new(args.esplora_url.clone());

            let (client, mut status_rx) = SwapClient::new(
                Arc::new(Mutex::new(store)),
                Arc::new(server),
                Arc::new(lightning),
                Arc::new(chain),
                Arc::new(keychain),
            );

            let resumed = client.resume_all().await.context("resume pending swaps")?;
            if resumed > 0 {
                tracing::info!(resumed, "resumed pending swaps");
            }

            let hash = client
                .loop_out(LoopOutRequest {
                    amount_sat,
                    dest_addr,
                    max_swap_routing_fee_sat,
                    max_prepay_routing_fee_sat,
                    max_swap_fee_sat,
                    max_prepay_amount_sat,
                    max_miner_fee_sat,
                    sweep_conf_target,
                    last_hop,
                })
                .await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "swap_hash": hex::encode(hash),
                }))?
            );

            if external {
                return Ok(());
            }

            while let Some(status) = status_rx.recv().await {
                if status.hash != hash {
                    continue;
                }
                tracing::info!(state = ?status.state, "swap update");
                if status.state.is_terminal() {
                    anyhow::ensure!(
                        status.state == SwapState::Success,
                        "swap finished as {:?}",
                        status.state
                    );
                    break;
                }
            }
        }

        Command::List => {
            let swaps = store.list_swaps().context("list swaps")?;
            let out: Vec<_> = swaps
                .iter()
                .map(|swap| {
                    json!({
                        "hash": hex::encode(swap.hash),
                        "amount_sat": swap.contract.amount_requested_sat,
                        "dest_addr": swap.contract.dest_addr.to_string(),
                        "cltv_expiry": swap.contract.cltv_expiry,
                        "state": swap.last_state(),
                        "events": swap
                            .events
                            .iter()
                            .map(|event| {
                                json!({
                                    "state": event.state,
                                    "created_at": event.created_at,
                                })
                            })
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}

fn parse_network(name: &str) -> Result<Network> {
    match name {
        "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => anyhow::bail!("unknown network: {other}"),
    }
}

fn parse_pubkey(hex_str: &str) -> Result<[u8; 33]> {
    let bytes = hex::decode(hex_str).context("decode pubkey hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("pubkey must be 33 bytes"))
}
