//! Block source driver
//!
//! Polls a `BlockSource` height by height and feeds the synchronizer. The
//! driver never applies anything itself; on divergence it asks the
//! synchronizer to roll back and resumes at the height it gets back.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use utxodex_core::{BlockHeight, BlockSource, FetchOutcome, IndexerResult, SyncConfig};

use crate::synchronizer::SyncEvent;

/// Drives a block source into the synchronizer's event channel
pub struct SourceDriver<B: BlockSource + ?Sized> {
    source: Arc<B>,
    config: SyncConfig,
}

impl<B: BlockSource + ?Sized> SourceDriver<B> {
    pub fn new(source: Arc<B>, config: SyncConfig) -> Self {
        Self { source, config }
    }

    /// Fetch from `start` onward until the synchronizer goes away
    pub async fn run(self, start: BlockHeight, events: mpsc::Sender<SyncEvent>) -> IndexerResult<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let base_delay = Duration::from_millis(self.config.retry_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_retry_delay_ms);

        let mut height = start;
        let mut delay = base_delay;
        info!("Block source driver starting at height {}", height);

        loop {
            match self.source.fetch_block(height).await {
                Ok(FetchOutcome::Block(block)) => {
                    delay = base_delay;
                    debug!("Fetched block {}", height);
                    if events.send(SyncEvent::NewBlock(block)).await.is_err() {
                        break;
                    }
                    height += 1;
                }
                Ok(FetchOutcome::NotReady) => {
                    delay = base_delay;
                    tokio::time::sleep(poll_interval).await;
                }
                Ok(FetchOutcome::Diverged { height: divergence }) => {
                    delay = base_delay;
                    warn!("Chain diverged at height {}", divergence);

                    let (reply, resume) = oneshot::channel();
                    let rollback = SyncEvent::Rollback {
                        height: divergence,
                        reply,
                    };
                    if events.send(rollback).await.is_err() {
                        break;
                    }
                    // A dropped reply means the rollback halted the synchronizer.
                    let Ok(resume_height) = resume.await else {
                        break;
                    };

                    self.reset_source(resume_height).await;
                    info!("Resuming fetch at height {}", resume_height);
                    height = resume_height;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Fetching block {} failed: {}; retrying in {:?}",
                        height, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                Err(e) => {
                    error!("Block source failed at height {}: {}", height, e);
                    let _ = events.send(SyncEvent::SourceFailed(e)).await;
                    break;
                }
            }
        }

        info!("Block source driver stopped at height {}", height);
        Ok(())
    }

    async fn reset_source(&self, resume_height: BlockHeight) {
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_retry_delay_ms);

        loop {
            match self.source.reset(resume_height).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("Resetting block source failed: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }
}
