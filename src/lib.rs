//! Client-side driver for Lightning loop-out swaps.
//!
//! A loop-out moves value from an off-chain channel to an on-chain address:
//! the client pays a swap invoice and a small prepay invoice to the server,
//! the server funds an on-chain HTLC locked to the client's payment hash,
//! and the client sweeps the HTLC by revealing the preimage. The [`swap`]
//! module holds the state machine, store and registry driving that
//! protocol; [`chain`], [`lightning`] and [`server`] are the adapters it
//! runs against.

pub mod chain;
pub mod keychain;
pub mod lightning;
pub mod logging;
pub mod proto;
pub mod server;
pub mod swap;
