//! Persistent ledger store using sled database

use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use utxodex_core::{BlockHeight, IndexerError, IndexerResult, OutPoint, Utxo};

use crate::store::{
    address_index_key, address_prefix, check_height, parse_address_index_key, ApplyOutcome,
    BlockDiff, LedgerState, LedgerStore,
};

const UTXO_TREE: &str = "utxos";
const ADDRESS_TREE: &str = "address_index";
const META_TREE: &str = "meta";
const HEIGHT_KEY: &[u8] = b"height";
const COUNT_KEY: &[u8] = b"utxo_count";
const EMPTY: &[u8] = &[];

/// Persistent ledger store backed by sled database
///
/// Three trees: `utxos` (outpoint key → UTXO), `address_index`
/// (address + outpoint key → empty) and `meta` (applied height and live
/// UTXO count). Mutations
/// run as one multi-tree transaction; `gate` keeps readers off a diff that
/// is being committed.
pub struct SledLedgerStore {
    db: Db,
    utxos: Tree,
    address_index: Tree,
    meta: Tree,
    gate: RwLock<()>,
    flush_every_block: bool,
}

impl SledLedgerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> IndexerResult<Self> {
        let db = sled::open(path).map_err(storage_error)?;
        Self::from_db(db)
    }

    /// Open a temporary store that is deleted on drop
    pub fn open_temporary() -> IndexerResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage_error)?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> IndexerResult<Self> {
        let utxos = db.open_tree(UTXO_TREE).map_err(storage_error)?;
        let address_index = db.open_tree(ADDRESS_TREE).map_err(storage_error)?;
        let meta = db.open_tree(META_TREE).map_err(storage_error)?;

        if meta.get(COUNT_KEY).map_err(storage_error)?.is_none() {
            let count = utxos.len() as u64;
            meta.insert(COUNT_KEY, &count.to_be_bytes()[..])
                .map_err(storage_error)?;
        }

        Ok(Self {
            db,
            utxos,
            address_index,
            meta,
            gate: RwLock::new(()),
            flush_every_block: true,
        })
    }

    pub fn with_flush_every_block(mut self, flush: bool) -> Self {
        self.flush_every_block = flush;
        self
    }

    /// Flush to disk
    pub fn flush(&self) -> IndexerResult<()> {
        self.db.flush().map_err(storage_error)?;
        Ok(())
    }

    fn read_height(&self) -> IndexerResult<Option<BlockHeight>> {
        match self.meta.get(HEIGHT_KEY).map_err(storage_error)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes, "height")?)),
            None => Ok(None),
        }
    }

    fn read_utxo(&self, outpoint: &OutPoint) -> IndexerResult<Option<Utxo>> {
        match self.utxos.get(outpoint.to_key()).map_err(storage_error)? {
            Some(bytes) => Ok(Some(decode_utxo(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl LedgerStore for SledLedgerStore {
    fn apply_diff(&self, diff: &BlockDiff) -> IndexerResult<ApplyOutcome> {
        let _guard = self.gate.write();
        check_height(self.read_height()?, diff)?;

        // Encode up front: the transaction body may run more than once.
        let additions = diff
            .additions
            .iter()
            .map(|utxo| {
                let outpoint = utxo.outpoint();
                Ok((
                    outpoint,
                    encode_utxo(utxo)?,
                    address_index_key(&utxo.address, &outpoint),
                ))
            })
            .collect::<IndexerResult<Vec<_>>>()?;

        let (removed, missing_removals) = (&self.utxos, &self.address_index, &self.meta)
            .transaction(|(utxos, address_index, meta)| {
                for (outpoint, value, index_key) in &additions {
                    let key = outpoint.to_key();
                    if utxos.get(&key[..])?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            IndexerError::DuplicateUtxo(*outpoint),
                        ));
                    }
                    utxos.insert(&key[..], value.as_slice())?;
                    address_index.insert(index_key.as_slice(), EMPTY)?;
                }

                let mut removed: usize = 0;
                let mut missing: usize = 0;
                for outpoint in &diff.removals {
                    let key = outpoint.to_key();
                    match utxos.remove(&key[..])? {
                        Some(bytes) => {
                            let utxo = decode_utxo(&bytes).map_err(ConflictableTransactionError::Abort)?;
                            address_index.remove(address_index_key(&utxo.address, outpoint))?;
                            removed += 1;
                        }
                        None => missing += 1,
                    }
                }

                let count = match meta.get(COUNT_KEY)? {
                    Some(bytes) => decode_u64(&bytes, "UTXO count")
                        .map_err(ConflictableTransactionError::Abort)?,
                    None => 0,
                };
                let count = count + additions.len() as u64 - removed as u64;

                meta.insert(HEIGHT_KEY, &diff.height.to_be_bytes()[..])?;
                meta.insert(COUNT_KEY, &count.to_be_bytes()[..])?;
                Ok((removed, missing))
            })
            .map_err(transaction_error)?;

        if missing_removals > 0 {
            debug!(
                "Height {}: {} removals referenced outputs not in the index",
                diff.height, missing_removals
            );
        }

        if self.flush_every_block {
            self.flush()?;
        }

        Ok(ApplyOutcome {
            height: diff.height,
            added: additions.len(),
            removed,
            missing_removals,
        })
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> IndexerResult<Option<Utxo>> {
        let _guard = self.gate.read();
        self.read_utxo(outpoint)
    }

    fn get_utxos(&self, outpoints: &[OutPoint]) -> IndexerResult<Vec<Option<Utxo>>> {
        let _guard = self.gate.read();
        outpoints
            .iter()
            .map(|outpoint| self.read_utxo(outpoint))
            .collect()
    }

    fn get_utxos_by_address(&self, address: &str) -> IndexerResult<Vec<Utxo>> {
        let _guard = self.gate.read();
        let mut utxos = Vec::new();

        for result in self.address_index.scan_prefix(address_prefix(address)) {
            let (key, _) = result.map_err(storage_error)?;
            let outpoint = parse_address_index_key(&key).ok_or_else(|| {
                IndexerError::StateCorruption("malformed address index key".into())
            })?;
            match self.read_utxo(&outpoint)? {
                Some(utxo) => utxos.push(utxo),
                None => {
                    return Err(IndexerError::StateCorruption(format!(
                        "address index points at missing UTXO {}",
                        outpoint
                    )))
                }
            }
        }

        Ok(utxos)
    }

    fn applied_height(&self) -> IndexerResult<Option<BlockHeight>> {
        let _guard = self.gate.read();
        self.read_height()
    }

    fn len(&self) -> IndexerResult<usize> {
        let _guard = self.gate.read();
        let count = match self.meta.get(COUNT_KEY).map_err(storage_error)? {
            Some(bytes) => decode_u64(&bytes, "UTXO count")?,
            None => 0,
        };
        usize::try_from(count)
            .map_err(|_| IndexerError::StateCorruption(format!("UTXO count {} out of range", count)))
    }

    fn export(&self) -> IndexerResult<LedgerState> {
        let _guard = self.gate.read();
        let utxos = self
            .utxos
            .iter()
            .values()
            .map(|value| decode_utxo(&value.map_err(storage_error)?))
            .collect::<IndexerResult<Vec<_>>>()?;

        Ok(LedgerState {
            height: self.read_height()?.unwrap_or(0),
            utxos,
        })
    }

    fn import(&self, height: BlockHeight, utxos: &[Utxo]) -> IndexerResult<()> {
        let _guard = self.gate.write();

        // Nothing else writes while the gate is held, so these key lists
        // stay exact for the transaction below.
        let stale_utxos = collect_keys(&self.utxos)?;
        let stale_index = collect_keys(&self.address_index)?;
        let replacement = utxos
            .iter()
            .map(|utxo| {
                let outpoint = utxo.outpoint();
                Ok((
                    outpoint.to_key(),
                    encode_utxo(utxo)?,
                    address_index_key(&utxo.address, &outpoint),
                ))
            })
            .collect::<IndexerResult<Vec<_>>>()?;
        let count = replacement.len() as u64;

        (&self.utxos, &self.address_index, &self.meta)
            .transaction(|(tx_utxos, tx_index, meta)| {
                for key in &stale_utxos {
                    tx_utxos.remove(key.as_slice())?;
                }
                for key in &stale_index {
                    tx_index.remove(key.as_slice())?;
                }
                for (key, value, index_key) in &replacement {
                    tx_utxos.insert(&key[..], value.as_slice())?;
                    tx_index.insert(index_key.as_slice(), EMPTY)?;
                }
                meta.insert(HEIGHT_KEY, &height.to_be_bytes()[..])?;
                meta.insert(COUNT_KEY, &count.to_be_bytes()[..])?;
                Ok(())
            })
            .map_err(transaction_error)?;

        self.flush()
    }
}

fn storage_error(err: sled::Error) -> IndexerError {
    IndexerError::StorageError(err.to_string())
}

fn transaction_error(err: TransactionError<IndexerError>) -> IndexerError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => storage_error(e),
    }
}

fn collect_keys(tree: &Tree) -> IndexerResult<Vec<Vec<u8>>> {
    tree.iter()
        .keys()
        .map(|key| key.map(|k| k.to_vec()).map_err(storage_error))
        .collect()
}

fn encode_utxo(utxo: &Utxo) -> IndexerResult<Vec<u8>> {
    Ok(bincode::serialize(utxo)?)
}

fn decode_utxo(bytes: &[u8]) -> IndexerResult<Utxo> {
    bincode::deserialize(bytes)
        .map_err(|e| IndexerError::StateCorruption(format!("undecodable UTXO: {}", e)))
}

fn decode_u64(bytes: &[u8], what: &str) -> IndexerResult<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| IndexerError::StateCorruption(format!("invalid {} length", what)))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Thread-safe persistent store wrapper
pub type SharedSledLedgerStore = Arc<SledLedgerStore>;

/// Create a shared persistent ledger store
pub fn create_persistent_store<P: AsRef<Path>>(path: P) -> IndexerResult<SharedSledLedgerStore> {
    Ok(Arc::new(SledLedgerStore::open(path)?))
}
