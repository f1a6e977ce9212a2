use std::sync::Mutex;

use anyhow::{Context as _, Result};
use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};

/// Source of the per-swap receiver keys. The index handed out by
/// [`Keychain::next_key`] is persisted in the swap contract so the sweep
/// signing key can be re-derived after a restart.
pub trait Keychain: Send + Sync + 'static {
    fn next_key(&self) -> Result<(u32, [u8; 33])>;

    fn secret_key(&self, index: u32) -> Result<SecretKey>;
}

/// Software keychain deriving single-child keys from a BIP32 master key.
pub struct SoftwareKeychain {
    master: Xpriv,
    secp: Secp256k1<All>,
    next_index: Mutex<u32>,
}

impl SoftwareKeychain {
    /// `start_index` must be past every index already handed out for this
    /// seed, e.g. the number of swaps in the store.
    pub fn new(seed: &[u8], network: Network, start_index: u32) -> Result<Self> {
        let master = Xpriv::new_master(network, seed).context("derive master key from seed")?;
        Ok(Self {
            master,
            secp: Secp256k1::new(),
            next_index: Mutex::new(start_index),
        })
    }

    fn derive(&self, index: u32) -> Result<SecretKey> {
        let child = ChildNumber::from_normal_idx(index).context("invalid derivation index")?;
        let path = DerivationPath::from(vec![child]);
        let xprv = self
            .master
            .derive_priv(&self.secp, &path)
            .context("derive xprv")?;
        Ok(xprv.private_key)
    }
}

impl Keychain for SoftwareKeychain {
    fn next_key(&self) -> Result<(u32, [u8; 33])> {
        let index = {
            let mut next = self.next_index.lock().expect("keychain mutex poisoned");
            let index = *next;
            *next += 1;
            index
        };

        let secret = self.derive(index)?;
        let pubkey = PublicKey::from_secret_key(&self.secp, &secret);
        Ok((index, pubkey.serialize()))
    }

    fn secret_key(&self, index: u32) -> Result<SecretKey> {
        self.derive(index)
    }
}
