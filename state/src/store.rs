//! Ledger store trait and the block diff it consumes

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use utxodex_core::{BlockHeight, IndexerError, IndexerResult, OutPoint, Utxo};

/// Additions and removals produced by one block
///
/// The same outpoint may appear in both sets when an output is created and
/// spent inside the block. Consumers must apply every addition before any
/// removal so that such an output nets out to nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDiff {
    pub height: BlockHeight,
    pub additions: Vec<Utxo>,
    pub removals: BTreeSet<OutPoint>,
}

impl BlockDiff {
    pub fn new(height: BlockHeight) -> Self {
        Self {
            height,
            additions: Vec::new(),
            removals: BTreeSet::new(),
        }
    }

    pub fn add(&mut self, utxo: Utxo) {
        self.additions.push(utxo);
    }

    pub fn remove(&mut self, outpoint: OutPoint) {
        self.removals.insert(outpoint);
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Summary of an applied diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub height: BlockHeight,
    pub added: usize,
    pub removed: usize,
    /// Removals whose outpoint was not in the store
    pub missing_removals: usize,
}

/// Point-in-time copy of the whole ledger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    pub height: BlockHeight,
    pub utxos: Vec<Utxo>,
}

/// Persistent keyed UTXO set
///
/// Implementations must make `apply_diff` and `import` atomic: a reader
/// observes either the state before or the state after, never a mix, and a
/// crash leaves either all or none of the change durable.
pub trait LedgerStore: Send + Sync {
    /// Insert every addition, then delete every removal, as one unit
    ///
    /// An addition for a key already present fails with `DuplicateUtxo`
    /// and leaves the store untouched.
    fn apply_diff(&self, diff: &BlockDiff) -> IndexerResult<ApplyOutcome>;

    fn get_utxo(&self, outpoint: &OutPoint) -> IndexerResult<Option<Utxo>>;

    /// Look up every outpoint against one committed state
    ///
    /// The result has one entry per requested outpoint, in request order.
    fn get_utxos(&self, outpoints: &[OutPoint]) -> IndexerResult<Vec<Option<Utxo>>>;

    fn get_utxos_by_address(&self, address: &str) -> IndexerResult<Vec<Utxo>>;

    /// Height of the last applied block, `None` before the first one
    fn applied_height(&self) -> IndexerResult<Option<BlockHeight>>;

    fn latest_height(&self) -> IndexerResult<BlockHeight> {
        Ok(self.applied_height()?.unwrap_or(0))
    }

    /// Number of live UTXOs
    fn len(&self) -> IndexerResult<usize>;

    fn is_empty(&self) -> IndexerResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Consistent copy of the content and height
    fn export(&self) -> IndexerResult<LedgerState>;

    /// Replace the entire content and the applied height
    fn import(&self, height: BlockHeight, utxos: &[Utxo]) -> IndexerResult<()>;
}

/// Shared ledger store handle
pub type SharedLedgerStore = Arc<dyn LedgerStore>;

/// Reject a diff that does not move the applied height forward
pub fn check_height(applied: Option<BlockHeight>, diff: &BlockDiff) -> IndexerResult<()> {
    match applied {
        Some(applied) if diff.height <= applied => Err(IndexerError::HeightRegression {
            applied,
            got: diff.height,
        }),
        _ => Ok(()),
    }
}

const ADDRESS_SEPARATOR: u8 = 0;

/// Prefix of every address index key for `address`
pub fn address_prefix(address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.len() + 1);
    key.extend_from_slice(address.as_bytes());
    key.push(ADDRESS_SEPARATOR);
    key
}

/// Address index key: address, separator, outpoint key
pub fn address_index_key(address: &str, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(&outpoint.to_key());
    key
}

/// Parse the outpoint back out of an address index key
pub fn parse_address_index_key(key: &[u8]) -> Option<OutPoint> {
    if key.len() < OutPoint::KEY_LEN + 1 {
        return None;
    }
    let split = key.len() - OutPoint::KEY_LEN;
    if key[split - 1] != ADDRESS_SEPARATOR {
        return None;
    }
    OutPoint::from_key(&key[split..])
}
