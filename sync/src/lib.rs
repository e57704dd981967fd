//! utxodex Synchronization
//!
//! Turns the ordered block stream of the upstream node into ledger diffs,
//! applies them one block at a time, checkpoints every K heights and rolls
//! back to the latest checkpoint when the upstream chain diverges.

pub mod diff;
pub mod driver;
pub mod synchronizer;

pub use diff::*;
pub use driver::*;
pub use synchronizer::*;
