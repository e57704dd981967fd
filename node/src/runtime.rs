//! Indexer runtime combining all components

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use utxodex_core::{
    BlockHeight, BlockSource, IndexerConfig, IndexerError, IndexerResult, MempoolSource, OutPoint,
    TransactionRelay, Txid, Utxo,
};
use utxodex_mempool::{BalanceProjection, MempoolProjector};
use utxodex_rpc::{RpcBlockSource, RpcClient};
use utxodex_state::{
    MemoryLedgerStore, SharedLedgerStore, SledLedgerStore, SnapshotManager,
};
use utxodex_sync::{create_sync_channel, SourceDriver, SyncStatus, Synchronizer};

/// Everything the indexer needs from the upstream full node
#[derive(Clone)]
pub struct Upstream {
    pub blocks: Arc<dyn BlockSource>,
    pub mempool: Arc<dyn MempoolSource>,
    pub relay: Arc<dyn TransactionRelay>,
}

impl Upstream {
    /// Connect to the node described by the configuration
    pub fn from_config(config: &IndexerConfig) -> IndexerResult<Self> {
        let client = RpcClient::from_config(&config.rpc)?;
        let source = Arc::new(RpcBlockSource::new(client, config.sync.reorg_window));
        info!("Upstream node at {}", config.rpc.url);

        Ok(Self {
            blocks: source.clone(),
            mempool: source.clone(),
            relay: source,
        })
    }
}

/// Handles of a running sync pipeline
pub struct SyncHandles {
    pub driver: JoinHandle<IndexerResult<()>>,
    pub worker: JoinHandle<IndexerResult<()>>,
}

/// Indexer runtime managing all components
pub struct IndexerRuntime {
    config: IndexerConfig,
    store: SharedLedgerStore,
    /// Kept for an explicit flush on shutdown
    sled: Option<Arc<SledLedgerStore>>,
    snapshots: Arc<SnapshotManager>,
    projector: MempoolProjector,
    upstream: Upstream,
    synchronizer: Mutex<Option<Synchronizer>>,
    status: watch::Receiver<SyncStatus>,
}

impl IndexerRuntime {
    /// Open the persistent ledger and snapshot under `config.data_dir`
    pub fn open(config: IndexerConfig, upstream: Upstream) -> IndexerResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let sled = Arc::new(
            SledLedgerStore::open(config.ledger_path())?
                .with_flush_every_block(config.storage.flush_every_block),
        );
        let store: SharedLedgerStore = sled.clone();
        let snapshots = Arc::new(SnapshotManager::open(store.clone(), config.snapshot_path())?);

        info!(
            "Opened ledger at {} (applied height {:?}, {} UTXOs)",
            config.ledger_path().display(),
            store.applied_height()?,
            store.len()?
        );

        Self::assemble(config, store, Some(sled), snapshots, upstream)
    }

    /// Keep everything in memory; nothing survives the process
    pub fn in_memory(config: IndexerConfig, upstream: Upstream) -> IndexerResult<Self> {
        config.validate()?;
        let store: SharedLedgerStore = Arc::new(MemoryLedgerStore::new());
        let snapshots = Arc::new(SnapshotManager::in_memory(store.clone()));
        Self::assemble(config, store, None, snapshots, upstream)
    }

    fn assemble(
        config: IndexerConfig,
        store: SharedLedgerStore,
        sled: Option<Arc<SledLedgerStore>>,
        snapshots: Arc<SnapshotManager>,
        upstream: Upstream,
    ) -> IndexerResult<Self> {
        let synchronizer = Synchronizer::new(store.clone(), snapshots.clone(), config.sync.clone())?;
        let status = synchronizer.subscribe();

        Ok(Self {
            projector: MempoolProjector::new(store.clone()),
            config,
            store,
            sled,
            snapshots,
            upstream,
            synchronizer: Mutex::new(Some(synchronizer)),
            status,
        })
    }

    /// Spawn the block source driver and the synchronizer worker
    ///
    /// The pipeline can be started once per runtime.
    pub fn start_sync(&self) -> IndexerResult<SyncHandles> {
        let synchronizer = self
            .synchronizer
            .lock()
            .take()
            .ok_or_else(|| IndexerError::Internal("sync pipeline already started".into()))?;

        let start = synchronizer.next_height();
        let (events, receiver) = create_sync_channel(self.config.sync.event_buffer);
        let driver = SourceDriver::new(self.upstream.blocks.clone(), self.config.sync.clone());

        let worker = tokio::spawn(synchronizer.run(receiver));
        let driver = tokio::spawn(driver.run(start, events));
        info!("Sync pipeline started at height {}", start);

        Ok(SyncHandles { driver, worker })
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Watch sync status changes
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn applied_height(&self) -> IndexerResult<Option<BlockHeight>> {
        self.store.applied_height()
    }

    pub fn utxo_count(&self) -> IndexerResult<usize> {
        self.store.len()
    }

    pub fn get_utxos(&self, address: &str) -> IndexerResult<Vec<Utxo>> {
        self.store.get_utxos_by_address(address)
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> IndexerResult<Option<Utxo>> {
        self.store.get_utxo(outpoint)
    }

    /// Pending balance change of `address` over the node's current mempool
    pub async fn project_mempool(&self, address: &str) -> IndexerResult<BalanceProjection> {
        self.projector
            .project_pending(address, self.upstream.mempool.as_ref())
            .await
    }

    pub async fn send_raw_transaction(&self, raw_hex: &str) -> IndexerResult<Txid> {
        self.upstream.relay.submit_raw_transaction(raw_hex).await
    }

    pub fn last_checkpoint(&self) -> Option<BlockHeight> {
        self.snapshots.latest_height()
    }

    /// Make every applied block durable
    pub fn flush(&self) -> IndexerResult<()> {
        match &self.sled {
            Some(sled) => sled.flush(),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }
}
