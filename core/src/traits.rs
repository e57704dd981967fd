//! Core traits defining utxodex collaborator interfaces
//!
//! The upstream full node is consumed through these traits; the indexing
//! engine never talks to the network directly.

use crate::types::*;
use async_trait::async_trait;

/// Result type for utxodex operations
pub type IndexerResult<T> = Result<T, crate::error::IndexerError>;

/// Outcome of asking the block source for one height
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The block at the requested height
    Block(Block),
    /// The requested height is beyond the current tip
    NotReady,
    /// The chain was replaced at or before `height`
    Diverged { height: BlockHeight },
}

/// Ordered block delivery with divergence detection
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the block at `height`
    async fn fetch_block(&self, height: BlockHeight) -> IndexerResult<FetchOutcome>;

    /// Forget everything known at or above `resume_height` after a rollback
    async fn reset(&self, _resume_height: BlockHeight) -> IndexerResult<()> {
        Ok(())
    }
}

/// Access to not-yet-confirmed transactions
#[async_trait]
pub trait MempoolSource: Send + Sync {
    async fn pending_transactions(&self) -> IndexerResult<Vec<Transaction>>;
}

/// Raw transaction broadcast passthrough
#[async_trait]
pub trait TransactionRelay: Send + Sync {
    async fn submit_raw_transaction(&self, raw_hex: &str) -> IndexerResult<Txid>;
}
