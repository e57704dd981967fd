//! Pending balance projection

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use utxodex_core::{AmountDelta, IndexerError, IndexerResult, MempoolSource, OutPoint, Transaction};
use utxodex_state::SharedLedgerStore;

/// Why a pending input could not be priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Created by another transaction in the same pending set
    PendingParent,
    /// Neither indexed nor pending: the index is behind or it is already spent
    NotIndexed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedInput {
    pub outpoint: OutPoint,
    pub reason: UnresolvedReason,
}

/// Projected balance change of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceProjection {
    pub address: String,
    pub delta: AmountDelta,
    /// Inputs found in the committed store
    pub resolved_inputs: usize,
    /// Inputs that contributed nothing because they could not be looked up
    pub unresolved: Vec<UnresolvedInput>,
}

impl BalanceProjection {
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Mempool balance projector
pub struct MempoolProjector {
    store: SharedLedgerStore,
}

impl MempoolProjector {
    pub fn new(store: SharedLedgerStore) -> Self {
        Self { store }
    }

    /// Sum of what `pending` pays to `address` minus what it spends from it
    ///
    /// Inputs are priced against one committed state of the store, so a block
    /// landing mid-projection cannot split the answer.
    pub fn project_balance(
        &self,
        address: &str,
        pending: &[Transaction],
    ) -> IndexerResult<BalanceProjection> {
        let pending_outputs: HashSet<OutPoint> = pending
            .iter()
            .flat_map(|tx| {
                tx.outputs
                    .iter()
                    .map(move |output| OutPoint::new(tx.txid, output.index))
            })
            .collect();

        let spends: Vec<(&Transaction, OutPoint)> = pending
            .iter()
            .flat_map(|tx| tx.inputs.iter().filter_map(move |input| Some((tx, input.outpoint()?))))
            .collect();
        let outpoints: Vec<OutPoint> = spends.iter().map(|(_, outpoint)| *outpoint).collect();
        let committed = self.store.get_utxos(&outpoints)?;

        let mut projection = BalanceProjection {
            address: address.to_string(),
            delta: AmountDelta::ZERO,
            resolved_inputs: 0,
            unresolved: Vec::new(),
        };

        for ((tx, outpoint), found) in spends.into_iter().zip(committed) {
            match found {
                Some(utxo) => {
                    projection.resolved_inputs += 1;
                    if utxo.address == address {
                        projection.delta = projection
                            .delta
                            .checked_debit(utxo.amount)
                            .ok_or(IndexerError::AmountOverflow)?;
                    }
                }
                None => {
                    let reason = if pending_outputs.contains(&outpoint) {
                        UnresolvedReason::PendingParent
                    } else {
                        UnresolvedReason::NotIndexed
                    };
                    debug!(
                        "Pending tx {} input {} unresolved ({:?})",
                        tx.txid, outpoint, reason
                    );
                    projection.unresolved.push(UnresolvedInput { outpoint, reason });
                }
            }
        }

        for output in pending.iter().flat_map(|tx| tx.outputs.iter()) {
            if output.kind.is_null_data() || output.address.as_deref() != Some(address) {
                continue;
            }
            projection.delta = projection
                .delta
                .checked_credit(output.amount)
                .ok_or(IndexerError::AmountOverflow)?;
        }

        Ok(projection)
    }

    /// Fetch the current pending set from `source` and project it
    pub async fn project_pending(
        &self,
        address: &str,
        source: &dyn MempoolSource,
    ) -> IndexerResult<BalanceProjection> {
        let pending = source.pending_transactions().await?;
        self.project_balance(address, &pending)
    }
}

/// Shared projector handle
pub type SharedMempoolProjector = Arc<MempoolProjector>;

pub fn create_mempool_projector(store: SharedLedgerStore) -> SharedMempoolProjector {
    Arc::new(MempoolProjector::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use utxodex_core::{Amount, BlockHeight, TxInput, TxOutput, Txid, Utxo};
    use utxodex_state::{ApplyOutcome, BlockDiff, LedgerState, LedgerStore, MemoryLedgerStore};

    fn utxo(txid: u8, vout: u32, height: BlockHeight, address: &str, amount: u64) -> Utxo {
        Utxo {
            txid: Txid([txid; 32]),
            vout,
            height,
            address: address.to_string(),
            amount: Amount(amount),
        }
    }

    fn projector(utxos: Vec<Utxo>) -> MempoolProjector {
        MempoolProjector::new(Arc::new(MemoryLedgerStore::with_utxos(10, utxos)))
    }

    #[test]
    fn test_empty_mempool_is_neutral() {
        let projector = projector(vec![utxo(1, 0, 3, "Y", 600_000_000)]);
        let projection = projector.project_balance("Y", &[]).unwrap();

        assert_eq!(projection.delta, AmountDelta(0));
        assert!(projection.is_fully_resolved());
    }

    #[test]
    fn test_spend_with_change() {
        let projector = projector(vec![utxo(1, 0, 3, "Y", 600_000_000)]);
        let tx = Transaction::new(
            Txid([2u8; 32]),
            vec![TxInput::spend(Txid([1u8; 32]), 0)],
            vec![
                TxOutput::new(0, "Q", Amount(9_990_000)),
                TxOutput::new(1, "Y", Amount(590_000_000)),
            ],
        );

        let projection = projector.project_balance("Y", &[tx.clone()]).unwrap();
        assert_eq!(projection.delta, AmountDelta(-10_000_000));
        assert_eq!(projection.resolved_inputs, 1);
        assert!(projection.is_fully_resolved());

        let receiver = projector.project_balance("Q", &[tx]).unwrap();
        assert_eq!(receiver.delta, AmountDelta(9_990_000));
    }

    #[test]
    fn test_unresolved_inputs_are_classified() {
        let projector = projector(vec![]);
        let parent = Transaction::new(
            Txid([3u8; 32]),
            vec![TxInput::spend(Txid([9u8; 32]), 4)],
            vec![TxOutput::new(0, "Y", Amount(100))],
        );
        let child = Transaction::new(
            Txid([4u8; 32]),
            vec![TxInput::spend(Txid([3u8; 32]), 0)],
            vec![TxOutput::new(0, "Y", Amount(90))],
        );

        let projection = projector.project_balance("Y", &[parent, child]).unwrap();

        // Credits still count; the unpriced spends contribute nothing.
        assert_eq!(projection.delta, AmountDelta(190));
        assert!(!projection.is_fully_resolved());
        assert_eq!(
            projection.unresolved,
            vec![
                UnresolvedInput {
                    outpoint: OutPoint::new(Txid([9u8; 32]), 4),
                    reason: UnresolvedReason::NotIndexed,
                },
                UnresolvedInput {
                    outpoint: OutPoint::new(Txid([3u8; 32]), 0),
                    reason: UnresolvedReason::PendingParent,
                },
            ]
        );
    }

    #[test]
    fn test_coinbase_and_null_data_are_ignored() {
        let projector = projector(vec![]);
        let tx = Transaction::new(
            Txid([5u8; 32]),
            vec![TxInput::Coinbase],
            vec![TxOutput::null_data(0), TxOutput::new(1, "Y", Amount(7))],
        );

        let projection = projector.project_balance("Y", &[tx]).unwrap();
        assert_eq!(projection.delta, AmountDelta(7));
        assert_eq!(projection.resolved_inputs, 0);
        assert!(projection.is_fully_resolved());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let projector = projector(vec![]);
        let tx = Transaction::new(
            Txid([6u8; 32]),
            vec![TxInput::Coinbase],
            vec![TxOutput::new(0, "Y", Amount(u64::MAX))],
        );

        assert!(matches!(
            projector.project_balance("Y", &[tx]),
            Err(IndexerError::AmountOverflow)
        ));
    }

    struct FixedMempool(Vec<Transaction>);

    #[async_trait]
    impl MempoolSource for FixedMempool {
        async fn pending_transactions(&self) -> IndexerResult<Vec<Transaction>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_project_pending_reads_source() {
        let projector = projector(vec![utxo(1, 0, 3, "Y", 50)]);
        let source = FixedMempool(vec![Transaction::new(
            Txid([2u8; 32]),
            vec![TxInput::spend(Txid([1u8; 32]), 0)],
            vec![TxOutput::new(0, "Z", Amount(40))],
        )]);

        let projection = projector.project_pending("Y", &source).await.unwrap();
        assert_eq!(projection.delta, AmountDelta(-50));
    }

    /// Store that commits `next_block` right after the first lookup it serves
    struct CommittingStore {
        inner: MemoryLedgerStore,
        next_block: Mutex<Option<BlockDiff>>,
    }

    impl CommittingStore {
        fn commit_pending_block(&self) {
            if let Some(diff) = self.next_block.lock().take() {
                self.inner.apply_diff(&diff).unwrap();
            }
        }
    }

    impl LedgerStore for CommittingStore {
        fn apply_diff(&self, diff: &BlockDiff) -> IndexerResult<ApplyOutcome> {
            self.inner.apply_diff(diff)
        }

        fn get_utxo(&self, outpoint: &OutPoint) -> IndexerResult<Option<Utxo>> {
            let found = self.inner.get_utxo(outpoint);
            self.commit_pending_block();
            found
        }

        fn get_utxos(&self, outpoints: &[OutPoint]) -> IndexerResult<Vec<Option<Utxo>>> {
            let found = self.inner.get_utxos(outpoints);
            self.commit_pending_block();
            found
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

    #[test]
    fn test_projection_sees_one_committed_state() {
        let first = utxo(1, 0, 3, "Y", 100);
        let second = utxo(1, 1, 3, "Y", 100);
        let mut spend_both = BlockDiff::new(11);
        spend_both.remove(first.outpoint());
        spend_both.remove(second.outpoint());

        let store = Arc::new(CommittingStore {
            inner: MemoryLedgerStore::with_utxos(10, vec![first.clone(), second.clone()]),
            next_block: Mutex::new(Some(spend_both)),
        });
        let projector = MempoolProjector::new(store.clone());
        let pending = vec![Transaction::new(
            Txid([2u8; 32]),
            vec![TxInput::Spend(first.outpoint()), TxInput::Spend(second.outpoint())],
            vec![TxOutput::new(0, "Z", Amount(190))],
        )];

        // Block 11 lands while the projection is running: the answer is
        // entirely from height 10.
        let before = projector.project_balance("Y", &pending).unwrap();
        assert_eq!(store.applied_height().unwrap(), Some(11));
        assert_eq!(before.delta, AmountDelta(-200));
        assert_eq!(before.resolved_inputs, 2);
        assert!(before.is_fully_resolved());

        let after = projector.project_balance("Y", &pending).unwrap();
        assert_eq!(after.delta, AmountDelta(0));
        assert_eq!(after.resolved_inputs, 0);
        assert!(after
            .unresolved
            .iter()
            .all(|input| input.reason == UnresolvedReason::NotIndexed));
        assert_eq!(after.unresolved.len(), 2);
    }
}
