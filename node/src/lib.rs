//! utxodex Node
//!
//! Wires the indexing engine into a running service:
//! - Sled-backed ledger with file snapshots
//! - Block source driver and synchronizer worker
//! - Mempool projection and transaction relay via the full node
//! - HTTP query API

mod api;
mod node;
mod runtime;

pub use api::*;
pub use node::*;
pub use runtime::*;
