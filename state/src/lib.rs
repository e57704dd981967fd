//! utxodex State Management
//! 
//! Provides the persistent UTXO set, its address index, and periodic
//! full-state snapshots used to recover from chain divergence.
//! State = { (txid, vout) → UTXO } plus the height of the last applied block.

pub mod store;
pub mod memory;
pub mod persistent;
pub mod snapshot;

pub use store::*;
pub use memory::*;
pub use persistent::*;
pub use snapshot::*;
