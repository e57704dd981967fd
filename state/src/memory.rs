//! In-memory ledger store for testing and ephemeral runs

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use utxodex_core::{BlockHeight, IndexerError, IndexerResult, OutPoint, Utxo};

use crate::store::{check_height, ApplyOutcome, BlockDiff, LedgerState, LedgerStore};

#[derive(Default)]
struct Ledger {
    utxos: BTreeMap<OutPoint, Utxo>,
    by_address: HashMap<String, BTreeSet<OutPoint>>,
    height: Option<BlockHeight>,
}

impl Ledger {
    fn insert(&mut self, utxo: Utxo) {
        let outpoint = utxo.outpoint();
        self.by_address
            .entry(utxo.address.clone())
            .or_default()
            .insert(outpoint);
        self.utxos.insert(outpoint, utxo);
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let utxo = self.utxos.remove(outpoint)?;
        if let Some(outpoints) = self.by_address.get_mut(&utxo.address) {
            outpoints.remove(outpoint);
            if outpoints.is_empty() {
                self.by_address.remove(&utxo.address);
            }
        }
        Some(utxo)
    }
}

/// In-memory ledger store
///
/// A single lock covers the set, the index and the height, so every diff is
/// applied under one write guard.
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: RwLock<Ledger>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_utxos(height: BlockHeight, utxos: Vec<Utxo>) -> Self {
        let mut ledger = Ledger {
            height: Some(height),
            ..Default::default()
        };
        for utxo in utxos {
            ledger.insert(utxo);
        }
        Self {
            inner: RwLock::new(ledger),
        }
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn apply_diff(&self, diff: &BlockDiff) -> IndexerResult<ApplyOutcome> {
        let mut ledger = self.inner.write();
        check_height(ledger.height, diff)?;

        // Validate before mutating so a rejected diff leaves nothing behind.
        let mut staged = HashSet::with_capacity(diff.additions.len());
        for utxo in &diff.additions {
            let outpoint = utxo.outpoint();
            if ledger.utxos.contains_key(&outpoint) || !staged.insert(outpoint) {
                return Err(IndexerError::DuplicateUtxo(outpoint));
            }
        }

        for utxo in &diff.additions {
            ledger.insert(utxo.clone());
        }

        let mut outcome = ApplyOutcome {
            height: diff.height,
            added: diff.additions.len(),
            ..Default::default()
        };
        for outpoint in &diff.removals {
            match ledger.remove(outpoint) {
                Some(_) => outcome.removed += 1,
                None => outcome.missing_removals += 1,
            }
        }
        ledger.height = Some(diff.height);

        Ok(outcome)
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> IndexerResult<Option<Utxo>> {
        Ok(self.inner.read().utxos.get(outpoint).cloned())
    }

    fn get_utxos(&self, outpoints: &[OutPoint]) -> IndexerResult<Vec<Option<Utxo>>> {
        let ledger = self.inner.read();
        Ok(outpoints
            .iter()
            .map(|outpoint| ledger.utxos.get(outpoint).cloned())
            .collect())
    }

    fn get_utxos_by_address(&self, address: &str) -> IndexerResult<Vec<Utxo>> {
        let ledger = self.inner.read();
        let utxos = ledger
            .by_address
            .get(address)
            .map(|outpoints| {
                outpoints
                    .iter()
                    .filter_map(|outpoint| ledger.utxos.get(outpoint).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(utxos)
    }

    fn applied_height(&self) -> IndexerResult<Option<BlockHeight>> {
        Ok(self.inner.read().height)
    }

    fn len(&self) -> IndexerResult<usize> {
        Ok(self.inner.read().utxos.len())
    }

    fn export(&self) -> IndexerResult<LedgerState> {
        let ledger = self.inner.read();
        Ok(LedgerState {
            height: ledger.height.unwrap_or(0),
            utxos: ledger.utxos.values().cloned().collect(),
        })
    }

    fn import(&self, height: BlockHeight, utxos: &[Utxo]) -> IndexerResult<()> {
        let mut replacement = Ledger {
            height: Some(height),
            ..Default::default()
        };
        for utxo in utxos {
            replacement.insert(utxo.clone());
        }
        *self.inner.write() = replacement;
        Ok(())
    }
}

/// Thread-safe memory store wrapper
pub type SharedMemoryLedgerStore = Arc<MemoryLedgerStore>;

/// Create a shared memory ledger store
pub fn create_memory_store() -> SharedMemoryLedgerStore {
    Arc::new(MemoryLedgerStore::new())
}
