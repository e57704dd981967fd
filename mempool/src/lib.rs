//! utxodex Mempool
//!
//! Read-only overlay that projects how pending transactions would change an
//! address's confirmed balance. Nothing here ever writes to the ledger.

pub mod projector;

pub use projector::*;
