use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network};

use ln_loop::swap::store::SwapStore;
use ln_loop::swap::{SwapContract, SwapError, SwapHash, SwapState};

fn sample_contract(preimage_byte: u8) -> (SwapHash, SwapContract) {
    let secp = Secp256k1::new();
    let receiver_secret = SecretKey::from_slice(&[0x11; 32]).expect("valid key bytes");
    let sender_secret = SecretKey::from_slice(&[0x22; 32]).expect("valid key bytes");
    let dest_secret = SecretKey::from_slice(&[0x33; 32]).expect("valid key bytes");

    let preimage = [preimage_byte; 32];
    let hash = sha256::Hash::hash(&preimage).to_byte_array();

    let dest_pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, &dest_secret));

    let contract = SwapContract {
        amount_requested_sat: 50_000,
        preimage,
        dest_addr: Address::p2wpkh(dest_pubkey, Network::Regtest),
        swap_invoice: format!("swap_invoice:{preimage_byte}"),
        prepay_invoice: format!("prepay_invoice:{preimage_byte}"),
        cltv_expiry: 744,
        sender_key: PublicKey::from_secret_key(&secp, &sender_secret).serialize(),
        receiver_key: PublicKey::from_secret_key(&secp, &receiver_secret).serialize(),
        receiver_key_index: 7,
        sweep_conf_target: 2,
        initiation_height: 600,
        max_miner_fee_sat: 50_000,
        max_swap_fee_sat: 1_050,
        max_prepay_amount_sat: 100,
        max_prepay_routing_fee_sat: 75_000,
        max_swap_routing_fee_sat: 70_000,
    };
    (hash, contract)
}

#[test]
fn create_append_load_round_trip() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("swap_store.sqlite3");

    let mut store = SwapStore::open(path).context("open swap store")?;

    let (hash, contract) = sample_contract(1);
    store.create_swap(hash, &contract).context("create swap")?;
    store
        .append_event(hash, SwapState::Initiated)
        .context("append initiated")?;

    let loaded = store
        .load_swap(hash)
        .context("load swap")?
        .context("swap missing")?;

    assert_eq!(loaded.hash, hash);
    assert_eq!(loaded.contract.preimage, contract.preimage);
    assert_eq!(loaded.contract.payment_hash(), hash);
    assert_eq!(loaded.contract.dest_addr, contract.dest_addr);
    assert_eq!(loaded.contract.swap_invoice, contract.swap_invoice);
    assert_eq!(loaded.contract.prepay_invoice, contract.prepay_invoice);
    assert_eq!(loaded.contract.cltv_expiry, 744);
    assert_eq!(loaded.contract.sender_key, contract.sender_key);
    assert_eq!(loaded.contract.receiver_key, contract.receiver_key);
    assert_eq!(loaded.contract.receiver_key_index, 7);
    assert_eq!(loaded.contract.initiation_height, 600);
    assert_eq!(loaded.contract.max_swap_fee_sat, 1_050);
    assert_eq!(loaded.last_state(), Some(SwapState::Initiated));

    Ok(())
}

#[test]
fn duplicate_hash_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SwapStore::open(dir.path().join("swap_store.sqlite3"))?;

    let (hash, contract) = sample_contract(2);
    store.create_swap(hash, &contract)?;

    let err = store.create_swap(hash, &contract).unwrap_err();
    assert_eq!(
        err.downcast_ref::<SwapError>(),
        Some(&SwapError::DuplicateSwap)
    );

    Ok(())
}

#[test]
fn events_are_ordered_and_terminal_seals_the_log() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SwapStore::open(dir.path().join("swap_store.sqlite3"))?;

    let (hash, contract) = sample_contract(3);
    store.create_swap(hash, &contract)?;
    store.append_event(hash, SwapState::Initiated)?;
    store.append_event(hash, SwapState::PreimageRevealed)?;
    store.finalize(hash, SwapState::Success)?;

    let loaded = store.load_swap(hash)?.context("swap missing")?;
    let states: Vec<SwapState> = loaded.events.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            SwapState::Initiated,
            SwapState::PreimageRevealed,
            SwapState::Success
        ]
    );

    let err = store.append_event(hash, SwapState::Initiated).unwrap_err();
    assert!(err.to_string().contains("already finished"));

    let err = store.finalize(hash, SwapState::Success).unwrap_err();
    assert!(err.to_string().contains("already finished"));

    Ok(())
}

#[test]
fn finalize_rejects_non_terminal_states() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SwapStore::open(dir.path().join("swap_store.sqlite3"))?;

    let (hash, contract) = sample_contract(4);
    store.create_swap(hash, &contract)?;

    let err = store.finalize(hash, SwapState::PreimageRevealed).unwrap_err();
    assert!(err.to_string().contains("not a terminal state"));

    Ok(())
}

#[test]
fn load_pending_skips_finished_swaps() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SwapStore::open(dir.path().join("swap_store.sqlite3"))?;

    let (pending_hash, pending_contract) = sample_contract(5);
    store.create_swap(pending_hash, &pending_contract)?;
    store.append_event(pending_hash, SwapState::Initiated)?;

    let (done_hash, done_contract) = sample_contract(6);
    store.create_swap(done_hash, &done_contract)?;
    store.append_event(done_hash, SwapState::Initiated)?;
    store.finalize(done_hash, SwapState::FailTimeout)?;

    let pending = store.load_pending()?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].hash, pending_hash);
    assert_eq!(pending[0].last_state(), Some(SwapState::Initiated));

    let all = store.list_swaps()?;
    assert_eq!(all.len(), 2);

    Ok(())
}

#[test]
fn records_survive_reopening() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("swap_store.sqlite3");

    let (hash, contract) = sample_contract(7);
    {
        let mut store = SwapStore::open(path.clone())?;
        store.create_swap(hash, &contract)?;
        store.append_event(hash, SwapState::Initiated)?;
        store.append_event(hash, SwapState::PreimageRevealed)?;
    }

    let store = SwapStore::open(path)?;
    let loaded = store.load_swap(hash)?.context("swap missing after reopen")?;
    assert_eq!(loaded.last_state(), Some(SwapState::PreimageRevealed));
    assert_eq!(loaded.events.len(), 2);
    assert_eq!(loaded.contract.preimage, contract.preimage);

    Ok(())
}
