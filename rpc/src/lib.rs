//! utxodex RPC
//!
//! Talks JSON-RPC to the upstream full node and adapts its answers to the
//! collaborator traits of `utxodex-core`: ordered blocks with divergence
//! detection, the pending transaction set, and raw transaction relay.

pub mod client;
pub mod raw;
pub mod source;

pub use client::*;
pub use raw::*;
pub use source::*;
