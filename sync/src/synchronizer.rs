//! Synchronizer state machine
//!
//! A single worker consumes `SyncEvent`s in order. It is the only writer to
//! the ledger store and the cursor, so one block is always fully applied
//! before the next event, a rollback included, is looked at.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use utxodex_core::{Block, BlockHeight, IndexerError, IndexerResult, SyncConfig};
use utxodex_state::{ApplyOutcome, BlockDiff, SharedLedgerStore, SnapshotManager};

use crate::diff::compute_diff;

/// Events consumed by the synchronizer
#[derive(Debug)]
pub enum SyncEvent {
    /// Next block from the block source
    NewBlock(Block),
    /// The chain diverged at or before `height`; the resume height is sent
    /// back on `reply`
    Rollback {
        height: BlockHeight,
        reply: oneshot::Sender<BlockHeight>,
    },
    /// The block source hit an unrecoverable error
    SourceFailed(IndexerError),
    /// Stop after the events already queued
    Shutdown,
}

/// Synchronizer states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    RollingBack,
    Stopped,
    Halted,
}

/// Published synchronizer status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub next_height: BlockHeight,
    pub last_checkpoint: Option<BlockHeight>,
    pub halted_reason: Option<String>,
}

/// Height of the next block to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    pub next_height: BlockHeight,
}

impl SyncCursor {
    /// Resume one past the last height the store has applied
    pub fn resume_from(store: &SharedLedgerStore) -> IndexerResult<Self> {
        Ok(Self {
            next_height: store.latest_height()? + 1,
        })
    }

    pub fn advance(&mut self) {
        self.next_height += 1;
    }

    pub fn reset_to(&mut self, next_height: BlockHeight) {
        self.next_height = next_height;
    }
}

/// Reorg-safe synchronizer
pub struct Synchronizer {
    store: SharedLedgerStore,
    snapshots: Arc<SnapshotManager>,
    config: SyncConfig,
    cursor: SyncCursor,
    status: watch::Sender<SyncStatus>,
}

impl Synchronizer {
    /// Create a synchronizer positioned after the store's applied height
    pub fn new(
        store: SharedLedgerStore,
        snapshots: Arc<SnapshotManager>,
        config: SyncConfig,
    ) -> IndexerResult<Self> {
        if config.checkpoint_interval == 0 {
            return Err(IndexerError::ConfigError(
                "checkpoint_interval must be greater than zero".into(),
            ));
        }

        let cursor = SyncCursor::resume_from(&store)?;
        let (status, _) = watch::channel(SyncStatus {
            state: SyncState::Idle,
            next_height: cursor.next_height,
            last_checkpoint: snapshots.latest_height(),
            halted_reason: None,
        });

        Ok(Self {
            store,
            snapshots,
            config,
            cursor,
            status,
        })
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn next_height(&self) -> BlockHeight {
        self.cursor.next_height
    }

    /// Process events until the channel closes, `Shutdown` arrives or a
    /// fatal error halts the state machine
    pub async fn run(mut self, mut events: mpsc::Receiver<SyncEvent>) -> IndexerResult<()> {
        self.set_state(SyncState::Syncing);
        info!("Synchronizer started at height {}", self.cursor.next_height);

        while let Some(event) = events.recv().await {
            let result = match event {
                SyncEvent::NewBlock(block) => self.process_block(block).await,
                SyncEvent::Rollback { height, reply } => match self.roll_back(height).await {
                    Ok(resume) => {
                        if reply.send(resume).is_err() {
                            debug!("Rollback requester went away before resume height {}", resume);
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                SyncEvent::SourceFailed(e) => Err(e),
                SyncEvent::Shutdown => break,
            };

            if let Err(e) = result {
                error!(
                    "Synchronizer halted at height {}: {}",
                    self.cursor.next_height, e
                );
                self.status.send_modify(|status| {
                    status.state = SyncState::Halted;
                    status.halted_reason = Some(e.to_string());
                });
                return Err(e);
            }
        }

        self.set_state(SyncState::Stopped);
        info!("Synchronizer stopped at height {}", self.cursor.next_height);
        Ok(())
    }

    /// Apply one block at the cursor height
    pub async fn process_block(&mut self, block: Block) -> IndexerResult<()> {
        let height = block.height;
        if height != self.cursor.next_height {
            return Err(IndexerError::OutOfOrderBlock {
                expected: self.cursor.next_height,
                got: height,
            });
        }

        let diff = compute_diff(height, &block)?;
        let outcome = self.apply_with_retry(Arc::new(diff)).await?;

        if outcome.missing_removals > 0 {
            debug!(
                "Block {} spent {} outputs the store never held",
                height, outcome.missing_removals
            );
        }

        self.cursor.advance();
        self.publish_cursor();
        info!(
            "Applied block {} (+{} -{} UTXOs)",
            height, outcome.added, outcome.removed
        );

        if height % self.config.checkpoint_interval == 0 {
            self.checkpoint().await;
        }

        Ok(())
    }

    /// Restore the latest checkpoint after a divergence at `divergence`
    ///
    /// Returns the height to resume fetching from.
    pub async fn roll_back(&mut self, divergence: BlockHeight) -> IndexerResult<BlockHeight> {
        if divergence >= self.cursor.next_height {
            info!(
                "Divergence at {} is past the applied height, nothing to roll back",
                divergence
            );
            return Ok(self.cursor.next_height);
        }

        self.set_state(SyncState::RollingBack);
        warn!("Rollback triggered: chain diverged at height {}", divergence);

        let snapshot_height = self
            .snapshots
            .latest_height()
            .ok_or(IndexerError::NoSnapshot)?;
        if snapshot_height >= divergence {
            error!(
                "Snapshot at {} already contains blocks from the diverged chain. To \
                 recover, stop the indexer, delete `snapshot.bin` and `ledger` from the \
                 data directory and resync from height 1",
                snapshot_height
            );
            return Err(IndexerError::SnapshotNotBeforeDivergence {
                snapshot: snapshot_height,
                divergence,
            });
        }

        let snapshots = self.snapshots.clone();
        let restored = tokio::task::spawn_blocking(move || snapshots.restore())
            .await
            .map_err(|e| IndexerError::Internal(format!("restore task failed: {}", e)))??;

        self.cursor.reset_to(restored + 1);
        self.status.send_modify(|status| {
            status.state = SyncState::Syncing;
            status.next_height = restored + 1;
        });
        info!(
            "Rolled back to snapshot at height {}, resuming at {}",
            restored,
            restored + 1
        );

        Ok(restored + 1)
    }

    async fn apply_with_retry(&self, diff: Arc<BlockDiff>) -> IndexerResult<ApplyOutcome> {
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_retry_delay_ms);
        let mut attempt: u32 = 0;

        loop {
            // A failed attempt may still have committed (e.g. the flush after
            // the transaction failed).
            if attempt > 0 && self.store.applied_height()? == Some(diff.height) {
                return Ok(ApplyOutcome {
                    height: diff.height,
                    added: diff.additions.len(),
                    ..Default::default()
                });
            }

            let store = self.store.clone();
            let attempt_diff = diff.clone();
            let applied = tokio::task::spawn_blocking(move || store.apply_diff(&attempt_diff))
                .await
                .map_err(|e| IndexerError::Internal(format!("apply task failed: {}", e)))?;

            match applied {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    warn!(
                        "Applying block {} failed (attempt {}): {}; retrying in {:?}",
                        diff.height, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn checkpoint(&mut self) {
        let snapshots = self.snapshots.clone();
        match tokio::task::spawn_blocking(move || snapshots.checkpoint()).await {
            Ok(Ok(height)) => {
                self.status
                    .send_modify(|status| status.last_checkpoint = Some(height));
            }
            Ok(Err(e)) => warn!("Checkpoint failed, continuing: {}", e),
            Err(e) => warn!("Checkpoint task failed, continuing: {}", e),
        }
    }

    fn set_state(&self, state: SyncState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn publish_cursor(&self) {
        let next_height = self.cursor.next_height;
        self.status
            .send_modify(|status| status.next_height = next_height);
    }
}

/// Create synchronizer event channel
pub fn create_sync_channel(buffer: usize) -> (mpsc::Sender<SyncEvent>, mpsc::Receiver<SyncEvent>) {
    mpsc::channel(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use utxodex_core::{Amount, OutPoint, OutputKind, Transaction, TxInput, TxOutput, Txid, Utxo};
    use utxodex_state::{LedgerState, LedgerStore, MemoryLedgerStore};

    fn txid(height: BlockHeight, n: u8) -> Txid {
        let mut bytes = [n; 32];
        bytes[..8].copy_from_slice(&height.to_be_bytes());
        Txid(bytes)
    }

    /// A block with one coinbase paying `address`
    fn reward_block(height: BlockHeight, address: &str) -> Block {
        Block::new(
            height,
            vec![Transaction::new(
                txid(height, 0),
                vec![TxInput::Coinbase],
                vec![TxOutput::new(0, address, Amount(50))],
            )],
        )
    }

    fn test_config(checkpoint_interval: u64) -> SyncConfig {
        SyncConfig {
            checkpoint_interval,
            retry_delay_ms: 1,
            max_retry_delay_ms: 4,
            ..Default::default()
        }
    }

    fn setup(checkpoint_interval: u64) -> (Arc<MemoryLedgerStore>, Synchronizer) {
        let store = Arc::new(MemoryLedgerStore::new());
        let snapshots = Arc::new(SnapshotManager::in_memory(store.clone()));
        let sync = Synchronizer::new(store.clone(), snapshots, test_config(checkpoint_interval))
            .unwrap();
        (store, sync)
    }

    #[tokio::test]
    async fn test_height_monotonicity() {
        let (store, mut sync) = setup(100);
        assert_eq!(sync.next_height(), 1);

        for height in 1..=5 {
            sync.process_block(reward_block(height, "A")).await.unwrap();
            assert_eq!(store.latest_height().unwrap(), height);
            assert_eq!(sync.next_height(), height + 1);
        }
        assert_eq!(store.get_utxos_by_address("A").unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_block_500_create_and_spend() {
        let store = Arc::new(MemoryLedgerStore::with_utxos(499, vec![]));
        let snapshots = Arc::new(SnapshotManager::in_memory(store.clone()));
        let mut sync = Synchronizer::new(store.clone(), snapshots, test_config(200)).unwrap();
        assert_eq!(sync.next_height(), 500);

        let t1 = Transaction::new(
            txid(500, 1),
            vec![TxInput::Coinbase],
            vec![TxOutput::new(0, "X", Amount(500_000_000))],
        );
        let t2 = Transaction::new(
            txid(500, 2),
            vec![TxInput::spend(txid(500, 1), 0)],
            vec![TxOutput::new(0, "W", Amount(499_000_000))],
        );
        sync.process_block(Block::new(500, vec![t1, t2])).await.unwrap();

        assert_eq!(store.get_utxo(&OutPoint::new(txid(500, 1), 0)).unwrap(), None);
        assert!(store.get_utxos_by_address("X").unwrap().is_empty());
        assert_eq!(store.latest_height().unwrap(), 500);
    }

    #[tokio::test]
    async fn test_rollback_restores_last_checkpoint() {
        let (store, mut sync) = setup(3);
        let mut at_checkpoint = LedgerState::default();

        for height in 1..=7 {
            sync.process_block(reward_block(height, "A")).await.unwrap();
            if height == 6 {
                at_checkpoint = store.export().unwrap();
            }
        }
        assert_eq!(sync.status().last_checkpoint, Some(6));

        let resume = sync.roll_back(7).await.unwrap();

        assert_eq!(resume, 7);
        assert_eq!(sync.next_height(), 7);
        assert_eq!(store.export().unwrap(), at_checkpoint);
        assert_eq!(sync.status().state, SyncState::Syncing);

        // The replacement block at 7 applies cleanly on top of the restore.
        sync.process_block(reward_block(7, "B")).await.unwrap();
        assert_eq!(store.get_utxos_by_address("B").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_blocks_after_checkpoint() {
        let (store, mut sync) = setup(2);
        for height in 1..=5 {
            sync.process_block(reward_block(height, "A")).await.unwrap();
        }

        // Divergence at 5, last checkpoint at 4.
        assert_eq!(sync.roll_back(5).await.unwrap(), 5);
        assert_eq!(store.latest_height().unwrap(), 4);
        assert_eq!(store.get_utxos_by_address("A").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_is_fatal() {
        let (_store, mut sync) = setup(100);
        sync.process_block(reward_block(1, "A")).await.unwrap();

        assert!(matches!(sync.roll_back(1).await, Err(IndexerError::NoSnapshot)));
    }

    #[tokio::test]
    async fn test_rollback_to_stale_snapshot_is_fatal() {
        let (_store, mut sync) = setup(2);
        for height in 1..=3 {
            sync.process_block(reward_block(height, "A")).await.unwrap();
        }

        assert!(matches!(
            sync.roll_back(2).await,
            Err(IndexerError::SnapshotNotBeforeDivergence {
                snapshot: 2,
                divergence: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_stale_snapshot_at_the_tip_leaves_store_untouched() {
        let (store, mut sync) = setup(2);
        for height in 1..=4 {
            sync.process_block(reward_block(height, "A")).await.unwrap();
        }

        assert!(matches!(
            sync.roll_back(4).await,
            Err(IndexerError::SnapshotNotBeforeDivergence {
                snapshot: 4,
                divergence: 4
            })
        ));
        assert_eq!(store.latest_height().unwrap(), 4);
        assert_eq!(sync.next_height(), 5);
    }

    #[test]
    fn test_zero_checkpoint_interval_is_rejected() {
        let store = Arc::new(MemoryLedgerStore::new());
        let snapshots = Arc::new(SnapshotManager::in_memory(store.clone()));

        assert!(matches!(
            Synchronizer::new(store, snapshots, test_config(0)),
            Err(IndexerError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_block_is_fatal() {
        let (store, mut sync) = setup(100);
        let result = sync.process_block(reward_block(2, "A")).await;

        assert!(matches!(
            result,
            Err(IndexerError::OutOfOrderBlock { expected: 1, got: 2 })
        ));
        assert_eq!(store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_block_does_not_advance_cursor() {
        let (store, mut sync) = setup(100);
        let bad = Block::new(
            1,
            vec![Transaction::new(
                txid(1, 0),
                vec![TxInput::Coinbase],
                vec![TxOutput {
                    index: 0,
                    address: None,
                    amount: Amount(1),
                    kind: OutputKind::ScriptHash,
                }],
            )],
        );

        assert!(sync.process_block(bad).await.is_err());
        assert_eq!(sync.next_height(), 1);
        assert_eq!(store.applied_height().unwrap(), None);
    }

    /// Store that fails the first `failures` applies with a storage error
    struct FlakyStore {
        inner: MemoryLedgerStore,
        failures: Mutex<u32>,
        apply_threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl LedgerStore for FlakyStore {
        fn apply_diff(&self, diff: &BlockDiff) -> IndexerResult<ApplyOutcome> {
            self.apply_threads.lock().push(std::thread::current().id());
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(IndexerError::StorageError("disk busy".into()));
            }
            self.inner.apply_diff(diff)
        }

        fn get_utxo(&self, outpoint: &OutPoint) -> IndexerResult<Option<Utxo>> {
            self.inner.get_utxo(outpoint)
        }

        fn get_utxos(&self, outpoints: &[OutPoint]) -> IndexerResult<Vec<Option<Utxo>>> {
            self.inner.get_utxos(outpoints)
        }

        fn get_utxos_by_address(&self, address: &str) -> IndexerResult<Vec<Utxo>> {
            self.inner.get_utxos_by_address(address)
        }

        fn applied_height(&self) -> IndexerResult<Option<BlockHeight>> {
            self.inner.applied_height()
        }

        fn len(&self) -> IndexerResult<usize> {
            self.inner.len()
        }

        fn export(&self) -> IndexerResult<LedgerState> {
            self.inner.export()
        }

        fn import(&self, height: BlockHeight, utxos: &[Utxo]) -> IndexerResult<()> {
            self.inner.import(height, utxos)
        }
    }

    #[tokio::test]
    async fn test_transient_apply_failure_is_retried_at_same_height() {
        let store = Arc::new(FlakyStore {
            inner: MemoryLedgerStore::new(),
            failures: Mutex::new(3),
            apply_threads: Mutex::new(Vec::new()),
        });
        let snapshots = Arc::new(SnapshotManager::in_memory(store.clone()));
        let mut sync = Synchronizer::new(store.clone(), snapshots, test_config(100)).unwrap();

        sync.process_block(reward_block(1, "A")).await.unwrap();

        assert_eq!(*store.failures.lock(), 0);
        assert_eq!(store.latest_height().unwrap(), 1);
        assert_eq!(sync.next_height(), 2);
    }

    #[tokio::test]
    async fn test_apply_runs_off_the_async_worker() {
        let store = Arc::new(FlakyStore {
            inner: MemoryLedgerStore::new(),
            failures: Mutex::new(0),
            apply_threads: Mutex::new(Vec::new()),
        });
        let snapshots = Arc::new(SnapshotManager::in_memory(store.clone()));
        let mut sync = Synchronizer::new(store.clone(), snapshots, test_config(100)).unwrap();

        sync.process_block(reward_block(1, "A")).await.unwrap();
        sync.process_block(reward_block(2, "A")).await.unwrap();

        // The test runtime is single threaded, so any other thread is the
        // blocking pool.
        let worker = std::thread::current().id();
        let threads = store.apply_threads.lock();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != worker));
    }

    #[tokio::test]
    async fn test_run_loop_handles_rollback_and_shutdown() {
        let (store, sync) = setup(2);
        let status = sync.subscribe();
        let (tx, rx) = create_sync_channel(8);
        let worker = tokio::spawn(sync.run(rx));

        for height in 1..=3 {
            tx.send(SyncEvent::NewBlock(reward_block(height, "A")))
                .await
                .unwrap();
        }
        let (reply, resume) = oneshot::channel();
        tx.send(SyncEvent::Rollback { height: 3, reply }).await.unwrap();
        assert_eq!(resume.await.unwrap(), 3);

        tx.send(SyncEvent::NewBlock(reward_block(3, "B"))).await.unwrap();
        tx.send(SyncEvent::Shutdown).await.unwrap();

        worker.await.unwrap().unwrap();
        assert_eq!(status.borrow().state, SyncState::Stopped);
        assert_eq!(status.borrow().next_height, 4);
        assert_eq!(store.get_utxos_by_address("B").unwrap().len(), 1);
        assert_eq!(store.get_utxos_by_address("A").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_halts_on_source_failure() {
        let (_store, sync) = setup(2);
        let status = sync.subscribe();
        let (tx, rx) = create_sync_channel(8);
        let worker = tokio::spawn(sync.run(rx));

        tx.send(SyncEvent::SourceFailed(IndexerError::MalformedBlock {
            height: 1,
            reason: "bad json".into(),
        }))
        .await
        .unwrap();

        assert!(worker.await.unwrap().is_err());
        assert_eq!(status.borrow().state, SyncState::Halted);
        assert!(status.borrow().halted_reason.is_some());
    }
}
