//! Ledger snapshot functionality
//!
//! A single latest snapshot is kept. Each checkpoint supersedes the previous
//! one; restore copies it back over the live store.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use utxodex_core::{BlockHeight, IndexerError, IndexerResult, Timestamp, Utxo};

use crate::store::{LedgerState, SharedLedgerStore};

/// A complete ledger snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSnapshot {
    /// Height at time of snapshot
    pub height: BlockHeight,
    /// Timestamp of snapshot creation
    pub taken_at: Timestamp,
    /// All UTXOs, sorted by outpoint
    pub utxos: Vec<Utxo>,
    /// BLAKE3 digest over height and UTXOs
    pub digest: [u8; 32],
}

impl UtxoSnapshot {
    /// Create a new snapshot from a ledger copy
    pub fn new(state: LedgerState) -> Self {
        let LedgerState { height, mut utxos } = state;
        utxos.sort_by_key(|utxo| utxo.outpoint());
        let digest = Self::compute_digest(height, &utxos);
        Self {
            height,
            taken_at: Timestamp::now(),
            utxos,
            digest,
        }
    }

    pub fn compute_digest(height: BlockHeight, utxos: &[Utxo]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&height.to_be_bytes());
        hasher.update(&(utxos.len() as u64).to_be_bytes());
        for utxo in utxos {
            hasher.update(&utxo.outpoint().to_key());
            hasher.update(&utxo.height.to_be_bytes());
            hasher.update(&(utxo.address.len() as u64).to_be_bytes());
            hasher.update(utxo.address.as_bytes());
            hasher.update(&utxo.amount.0.to_be_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    /// Verify snapshot integrity
    pub fn verify(&self) -> bool {
        Self::compute_digest(self.height, &self.utxos) == self.digest
    }

    /// Serialize snapshot to bytes
    pub fn to_bytes(&self) -> IndexerResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| IndexerError::SerializationError(e.to_string()))
    }

    /// Deserialize snapshot from bytes
    pub fn from_bytes(bytes: &[u8]) -> IndexerResult<Self> {
        bincode::deserialize(bytes).map_err(|e| IndexerError::SnapshotCorrupt(e.to_string()))
    }

    /// Get the number of UTXOs
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    /// Check if snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

/// Periodic checkpoint and restore of the live ledger
pub struct SnapshotManager {
    store: SharedLedgerStore,
    latest: RwLock<Option<Arc<UtxoSnapshot>>>,
    location: Option<PathBuf>,
}

impl SnapshotManager {
    /// Keep snapshots in memory only
    pub fn in_memory(store: SharedLedgerStore) -> Self {
        Self {
            store,
            latest: RwLock::new(None),
            location: None,
        }
    }

    /// Keep snapshots in a file, loading an existing one
    pub fn open<P: AsRef<Path>>(store: SharedLedgerStore, path: P) -> IndexerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let latest = if path.exists() {
            let bytes = fs::read(&path)?;
            match UtxoSnapshot::from_bytes(&bytes) {
                Ok(snapshot) if snapshot.verify() => {
                    info!(
                        "Loaded snapshot at height {} ({} UTXOs) from {}",
                        snapshot.height,
                        snapshot.len(),
                        path.display()
                    );
                    Some(Arc::new(snapshot))
                }
                Ok(_) => {
                    warn!("Ignoring snapshot {}: digest mismatch", path.display());
                    None
                }
                Err(e) => {
                    warn!("Ignoring snapshot {}: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            store,
            latest: RwLock::new(latest),
            location: Some(path),
        })
    }

    /// Take a new snapshot of the live store, replacing the previous one
    pub fn checkpoint(&self) -> IndexerResult<BlockHeight> {
        let snapshot = UtxoSnapshot::new(self.store.export()?);

        // The file is replaced by rename, so the old snapshot stays intact
        // until the new one is fully written.
        if let Some(path) = &self.location {
            write_atomically(path, &snapshot.to_bytes()?)?;
        }

        let height = snapshot.height;
        let count = snapshot.len();
        *self.latest.write() = Some(Arc::new(snapshot));

        info!("Checkpoint at height {} ({} UTXOs)", height, count);
        Ok(height)
    }

    /// Replace the live store with the latest snapshot and return its height
    pub fn restore(&self) -> IndexerResult<BlockHeight> {
        let snapshot = self.latest().ok_or(IndexerError::NoSnapshot)?;
        if !snapshot.verify() {
            return Err(IndexerError::SnapshotCorrupt(format!(
                "digest mismatch at height {}",
                snapshot.height
            )));
        }

        self.store.import(snapshot.height, &snapshot.utxos)?;

        info!(
            "Restored snapshot at height {} ({} UTXOs)",
            snapshot.height,
            snapshot.len()
        );
        Ok(snapshot.height)
    }

    /// Get the latest snapshot
    pub fn latest(&self) -> Option<Arc<UtxoSnapshot>> {
        self.latest.read().clone()
    }

    pub fn latest_height(&self) -> Option<BlockHeight> {
        self.latest.read().as_ref().map(|snapshot| snapshot.height)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> IndexerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedgerStore;
    use crate::persistent::SledLedgerStore;
    use crate::store::{BlockDiff, LedgerStore};
    use tempfile::TempDir;
    use utxodex_core::{Amount, OutPoint, Txid};

    fn utxo(txid: u8, vout: u32, height: BlockHeight, address: &str, amount: u64) -> Utxo {
        Utxo {
            txid: Txid([txid; 32]),
            vout,
            height,
            address: address.to_string(),
            amount: Amount(amount),
        }
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = UtxoSnapshot::new(LedgerState {
            height: 12,
            utxos: vec![utxo(2, 0, 3, "B", 7), utxo(1, 4, 5, "A", 9)],
        });
        assert!(snapshot.verify());
        // Canonical order regardless of input order.
        assert_eq!(snapshot.utxos[0].txid, Txid([1u8; 32]));

        let bytes = snapshot.to_bytes().unwrap();
        let restored = UtxoSnapshot::from_bytes(&bytes).unwrap();

        assert_eq!(restored, snapshot);
        assert!(restored.verify());
    }

    #[test]
    fn test_snapshot_detects_tampering() {
        let mut snapshot = UtxoSnapshot::new(LedgerState {
            height: 1,
            utxos: vec![utxo(1, 0, 1, "A", 100)],
        });
        snapshot.utxos[0].amount = Amount(101);
        assert!(!snapshot.verify());
    }

    #[test]
    fn test_restore_without_snapshot_fails() {
        let store: SharedLedgerStore = Arc::new(MemoryLedgerStore::new());
        let manager = SnapshotManager::in_memory(store);

        assert!(matches!(manager.restore(), Err(IndexerError::NoSnapshot)));
    }

    #[test]
    fn test_restore_of_checkpoint_reproduces_set() {
        let original = vec![
            utxo(1, 0, 3, "A", 10),
            utxo(1, 1, 3, "B", 20),
            utxo(5, 2, 8, "A", 30),
        ];
        let store = Arc::new(MemoryLedgerStore::with_utxos(8, original.clone()));
        let manager = SnapshotManager::in_memory(store.clone());
        assert_eq!(manager.checkpoint().unwrap(), 8);

        let mut later = BlockDiff::new(9);
        later.add(utxo(6, 0, 9, "C", 40));
        later.remove(OutPoint::new(Txid([1u8; 32]), 0));
        store.apply_diff(&later).unwrap();

        assert_eq!(manager.restore().unwrap(), 8);
        assert_eq!(store.latest_height().unwrap(), 8);
        assert_eq!(store.export().unwrap().utxos, original);
        assert_eq!(store.get_utxos_by_address("A").unwrap().len(), 2);
    }

    #[test]
    fn test_checkpoint_supersedes_previous() {
        let store = Arc::new(MemoryLedgerStore::new());
        let manager = SnapshotManager::in_memory(store.clone());

        let mut diff = BlockDiff::new(200);
        diff.add(utxo(1, 0, 200, "A", 1));
        store.apply_diff(&diff).unwrap();
        manager.checkpoint().unwrap();

        store.apply_diff(&BlockDiff::new(400)).unwrap();
        manager.checkpoint().unwrap();

        assert_eq!(manager.latest_height(), Some(400));
    }

    #[test]
    fn test_snapshot_file_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.bin");
        let store: SharedLedgerStore = Arc::new(SledLedgerStore::open_temporary().unwrap());

        let mut diff = BlockDiff::new(40);
        diff.add(utxo(3, 0, 40, "D", 5));
        store.apply_diff(&diff).unwrap();
        {
            let manager = SnapshotManager::open(store.clone(), &path).unwrap();
            manager.checkpoint().unwrap();
        }

        let reopened = SnapshotManager::open(store.clone(), &path).unwrap();
        assert_eq!(reopened.latest_height(), Some(40));

        store.apply_diff(&BlockDiff::new(41)).unwrap();
        assert_eq!(reopened.restore().unwrap(), 40);
        assert_eq!(store.get_utxos_by_address("D").unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_snapshot_file_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.bin");
        fs::write(&path, b"not a snapshot").unwrap();

        let store: SharedLedgerStore = Arc::new(MemoryLedgerStore::new());
        let manager = SnapshotManager::open(store, &path).unwrap();
        assert_eq!(manager.latest_height(), None);
    }
}
