//! Error types for utxodex

use crate::types::{BlockHeight, OutPoint};
use thiserror::Error;

/// Main error type for utxodex
#[derive(Error, Debug)]
pub enum IndexerError {
    // ============ Block Errors ============
    #[error("Malformed transaction {txid}: {reason}")]
    MalformedTransaction { txid: String, reason: String },

    #[error("Malformed block at height {height}: {reason}")]
    MalformedBlock { height: BlockHeight, reason: String },

    #[error("Out of order block: expected height {expected}, got {got}")]
    OutOfOrderBlock { expected: BlockHeight, got: BlockHeight },

    // ============ Ledger Errors ============
    #[error("Duplicate UTXO {0}: block replayed or store corrupted")]
    DuplicateUtxo(OutPoint),

    #[error("Height regression: store is at {applied}, diff is for {got}")]
    HeightRegression { applied: BlockHeight, got: BlockHeight },

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    // ============ Snapshot Errors ============
    #[error("No snapshot available to restore")]
    NoSnapshot,

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupt(String),

    #[error("Snapshot at height {snapshot} is not below divergence height {divergence}")]
    SnapshotNotBeforeDivergence {
        snapshot: BlockHeight,
        divergence: BlockHeight,
    },

    // ============ Amount Errors ============
    #[error("Amount overflow")]
    AmountOverflow,

    // ============ Upstream Errors ============
    #[error("RPC error {code}: {message}")]
    RpcError { code: i64, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // ============ Encoding Errors ============
    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(String),

    #[error("Invalid txid: {0}")]
    InvalidTxid(String),

    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IndexerError {
    /// Errors worth retrying at the point of failure
    ///
    /// Everything else is structural and halts the affected subsystem.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::StorageError(_)
                | IndexerError::RpcError { .. }
                | IndexerError::NetworkError(_)
                | IndexerError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for IndexerError {
    fn from(err: std::io::Error) -> Self {
        IndexerError::StorageError(err.to_string())
    }
}

impl From<bincode::Error> for IndexerError {
    fn from(err: bincode::Error) -> Self {
        IndexerError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        IndexerError::SerializationError(err.to_string())
    }
}
