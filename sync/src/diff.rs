//! Block to ledger diff computation

use std::collections::HashSet;
use utxodex_core::{Block, BlockHeight, IndexerError, IndexerResult, Transaction, TxInput, Utxo};
use utxodex_state::BlockDiff;

/// Compute the additions and removals a block makes to the UTXO set
///
/// Pure and deterministic. Additions follow block, transaction and output
/// order; null-data outputs are skipped and coinbase inputs spend nothing.
/// Any malformed transaction fails the whole block.
pub fn compute_diff(height: BlockHeight, block: &Block) -> IndexerResult<BlockDiff> {
    if block.height != height {
        return Err(IndexerError::MalformedBlock {
            height,
            reason: format!("block reports height {}", block.height),
        });
    }

    let mut diff = BlockDiff::new(height);

    for tx in &block.transactions {
        if tx.inputs.is_empty() {
            return Err(malformed(tx, "transaction has no inputs".into()));
        }

        let mut indexes = HashSet::with_capacity(tx.outputs.len());
        for output in &tx.outputs {
            if !indexes.insert(output.index) {
                return Err(malformed(tx, format!("output index {} repeated", output.index)));
            }
            if output.kind.is_null_data() {
                continue;
            }

            let address = match &output.address {
                Some(address) => address.clone(),
                None if output.kind.is_addressable() => {
                    return Err(malformed(
                        tx,
                        format!("{:?} output {} has no address", output.kind, output.index),
                    ));
                }
                // Bare multisig and non-standard scripts: indexed under the
                // empty address so a later spend still finds them.
                None => String::new(),
            };

            diff.add(Utxo {
                txid: tx.txid,
                vout: output.index,
                height,
                address,
                amount: output.amount,
            });
        }

        for input in &tx.inputs {
            if let TxInput::Spend(outpoint) = input {
                diff.remove(*outpoint);
            }
        }
    }

    Ok(diff)
}

fn malformed(tx: &Transaction, reason: String) -> IndexerError {
    IndexerError::MalformedTransaction {
        txid: tx.txid.to_hex(),
        reason,
    }
}
