//! Node-backed block source, mempool source and relay

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use utxodex_core::{
    BlockHash, BlockHeight, BlockSource, FetchOutcome, IndexerError, IndexerResult,
    MempoolSource, Transaction, TransactionRelay, Txid,
};

use crate::client::{RpcClient, RPC_INVALID_ADDRESS_OR_KEY};
use crate::raw::parse_txid;

/// Full node adapter
///
/// Remembers the hashes of the last `window` delivered blocks. A block whose
/// parent hash disagrees with the remembered one triggers a walk back through
/// the window to find the first height the node no longer agrees with.
pub struct RpcBlockSource {
    client: RpcClient,
    recent: Mutex<BTreeMap<BlockHeight, BlockHash>>,
    window: u64,
}

impl RpcBlockSource {
    pub fn new(client: RpcClient, window: u64) -> Self {
        Self {
            client,
            recent: Mutex::new(BTreeMap::new()),
            window: window.max(1),
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    fn remember(&self, height: BlockHeight, hash: BlockHash) {
        let mut recent = self.recent.lock();
        recent.insert(height, hash);
        let floor = height.saturating_sub(self.window);
        while let Some((&oldest, _)) = recent.first_key_value() {
            if oldest > floor {
                break;
            }
            recent.remove(&oldest);
        }
    }

    /// First height at which the node's chain differs from what was delivered
    async fn find_divergence(&self) -> IndexerResult<BlockHeight> {
        let known: Vec<(BlockHeight, BlockHash)> = self
            .recent
            .lock()
            .iter()
            .rev()
            .map(|(height, hash)| (*height, *hash))
            .collect();

        let mut divergence = None;
        for (height, hash) in known {
            if self.client.get_block_hash(height).await? == hash {
                return Ok(height + 1);
            }
            divergence = Some(height);
        }

        match divergence {
            Some(oldest) => Err(IndexerError::StateCorruption(format!(
                "chain replaced below height {}, deeper than the reorg window of {} blocks",
                oldest, self.window
            ))),
            None => Err(IndexerError::Internal(
                "divergence search with no delivered blocks".into(),
            )),
        }
    }
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn fetch_block(&self, height: BlockHeight) -> IndexerResult<FetchOutcome> {
        let tip = self.client.get_block_count().await?;
        if height > tip {
            return Ok(FetchOutcome::NotReady);
        }

        let hash = self.client.get_block_hash(height).await?;
        let block = self.client.get_block(&hash).await?.into_block(height)?;

        let expected_parent = height
            .checked_sub(1)
            .and_then(|parent| self.recent.lock().get(&parent).copied());
        if let Some(expected) = expected_parent {
            if block.previous_hash != Some(expected) {
                let divergence = self.find_divergence().await?;
                warn!(
                    "Block {} does not extend delivered chain, diverged at {}",
                    height, divergence
                );
                return Ok(FetchOutcome::Diverged { height: divergence });
            }
        }

        self.remember(height, hash);
        Ok(FetchOutcome::Block(block))
    }

    async fn reset(&self, resume_height: BlockHeight) -> IndexerResult<()> {
        let mut recent = self.recent.lock();
        let stale = recent.split_off(&resume_height);
        info!(
            "Forgot {} delivered block hashes from height {}",
            stale.len(),
            resume_height
        );
        Ok(())
    }
}

#[async_trait]
impl MempoolSource for RpcBlockSource {
    async fn pending_transactions(&self) -> IndexerResult<Vec<Transaction>> {
        let txids = self.client.get_raw_mempool().await?;
        let mut pending = Vec::with_capacity(txids.len());

        for txid in txids {
            match self.client.get_raw_transaction(&txid).await {
                Ok(raw) => pending.push(raw.into_transaction()?),
                // Mined or evicted since the listing.
                Err(IndexerError::RpcError { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                    debug!("Mempool transaction {} disappeared", txid);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(pending)
    }
}

#[async_trait]
impl TransactionRelay for RpcBlockSource {
    async fn submit_raw_transaction(&self, raw_hex: &str) -> IndexerResult<Txid> {
        let txid = self.client.send_raw_transaction(raw_hex).await?;
        info!("Relayed transaction {}", txid);
        parse_txid(&txid)
    }
}

/// Shared node adapter
pub type SharedRpcBlockSource = Arc<RpcBlockSource>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcAuth;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Chain served by the fake node; `fork` distinguishes competing blocks
    #[derive(Default)]
    struct FakeChain {
        forks: Vec<u8>,
        mempool: Vec<Value>,
        /// Listed by `getrawmempool` but gone by the time it is fetched
        vanished: Vec<String>,
    }

    type SharedChain = Arc<Mutex<FakeChain>>;

    fn block_hash(height: usize, fork: u8) -> String {
        format!("{:02x}{:062x}", fork, height)
    }

    fn coinbase_txid(height: usize, fork: u8) -> String {
        format!("{:02x}{:062x}", fork + 0x10, height)
    }

    fn block_json(chain: &FakeChain, hash: &str) -> Option<Value> {
        let height = chain
            .forks
            .iter()
            .enumerate()
            .position(|(h, fork)| block_hash(h, *fork) == hash)?;
        let fork = chain.forks[height];
        let mut block = json!({
            "hash": hash,
            "height": height,
            "tx": [{
                "txid": coinbase_txid(height, fork),
                "vin": [{ "coinbase": "00" }],
                "vout": [{ "value": 50.0, "valueSat": 5_000_000_000u64, "n": 0,
                           "scriptPubKey": { "type": "pubkeyhash", "addresses": ["A"] } }]
            }]
        });
        if height > 0 {
            block["previousblockhash"] = json!(block_hash(height - 1, chain.forks[height - 1]));
        }
        Some(block)
    }

    async fn handle(State(chain): State<SharedChain>, Json(request): Json<Value>) -> Json<Value> {
        let chain = chain.lock();
        let params = &request["params"];
        let result = match request["method"].as_str().unwrap_or_default() {
            "getblockcount" => Ok(json!(chain.forks.len() - 1)),
            "getblockhash" => {
                let height = params[0].as_u64().unwrap_or(u64::MAX) as usize;
                chain
                    .forks
                    .get(height)
                    .map(|fork| json!(block_hash(height, *fork)))
                    .ok_or((-8, "Block height out of range"))
            }
            "getblock" => block_json(&chain, params[0].as_str().unwrap_or_default())
                .ok_or((-5, "Block not found")),
            "getrawmempool" => Ok(json!(chain
                .vanished
                .iter()
                .map(|txid| json!(txid))
                .chain(chain.mempool.iter().map(|tx| tx["txid"].clone()))
                .collect::<Vec<_>>())),
            "getrawtransaction" => chain
                .mempool
                .iter()
                .find(|tx| tx["txid"] == params[0])
                .cloned()
                .ok_or((-5, "No such mempool transaction")),
            "sendrawtransaction" => Ok(json!(coinbase_txid(7, 7))),
            _ => Err((-32601, "Method not found")),
        };

        Json(match result {
            Ok(result) => json!({ "result": result, "error": null, "id": request["id"] }),
            Err((code, message)) => json!({
                "result": null,
                "error": { "code": code, "message": message },
                "id": request["id"]
            }),
        })
    }

    async fn spawn_node(chain: SharedChain) -> String {
        let app = Router::new().route("/", post(handle)).with_state(chain);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn source_for(chain: SharedChain, window: u64) -> RpcBlockSource {
        let url = spawn_node(chain).await;
        let client = RpcClient::new(&url, RpcAuth::None, Duration::from_secs(5)).unwrap();
        RpcBlockSource::new(client, window)
    }

    fn expect_block(outcome: FetchOutcome, height: BlockHeight) {
        match outcome {
            FetchOutcome::Block(block) => assert_eq!(block.height, height),
            other => panic!("expected block {}, got {:?}", height, other),
        }
    }

    #[tokio::test]
    async fn test_fetch_until_tip() {
        let chain = Arc::new(Mutex::new(FakeChain {
            forks: vec![0; 3],
            ..Default::default()
        }));
        let source = source_for(chain, 10).await;

        expect_block(source.fetch_block(1).await.unwrap(), 1);
        expect_block(source.fetch_block(2).await.unwrap(), 2);
        assert!(matches!(
            source.fetch_block(3).await.unwrap(),
            FetchOutcome::NotReady
        ));
    }

    #[tokio::test]
    async fn test_detects_divergence_and_resumes_after_reset() {
        let chain = Arc::new(Mutex::new(FakeChain {
            forks: vec![0; 4],
            ..Default::default()
        }));
        let source = source_for(chain.clone(), 10).await;
        for height in 1..=3 {
            expect_block(source.fetch_block(height).await.unwrap(), height);
        }

        // Heights 2 and 3 are replaced and the chain grows to 4.
        chain.lock().forks = vec![0, 0, 1, 1, 1];

        assert!(matches!(
            source.fetch_block(4).await.unwrap(),
            FetchOutcome::Diverged { height: 2 }
        ));

        source.reset(2).await.unwrap();
        match source.fetch_block(2).await.unwrap() {
            FetchOutcome::Block(block) => {
                assert_eq!(block.hash.map(|h| h.to_hex()), Some(block_hash(2, 1)));
            }
            other => panic!("expected replacement block, got {:?}", other),
        }
        expect_block(source.fetch_block(3).await.unwrap(), 3);
        expect_block(source.fetch_block(4).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_reorg_deeper_than_window_is_fatal() {
        let chain = Arc::new(Mutex::new(FakeChain {
            forks: vec![0; 5],
            ..Default::default()
        }));
        let source = source_for(chain.clone(), 2).await;
        for height in 1..=4 {
            expect_block(source.fetch_block(height).await.unwrap(), height);
        }

        chain.lock().forks = vec![0, 1, 1, 1, 1, 1];

        assert!(matches!(
            source.fetch_block(5).await,
            Err(IndexerError::StateCorruption(_))
        ));
    }

    #[tokio::test]
    async fn test_mempool_skips_vanished_transactions() {
        let pending = json!({
            "txid": coinbase_txid(9, 2),
            "vin": [{ "txid": coinbase_txid(1, 0), "vout": 0 }],
            "vout": [{ "value": "1.5", "n": 0,
                       "scriptPubKey": { "type": "pubkeyhash", "address": "Y" } }]
        });
        let chain = Arc::new(Mutex::new(FakeChain {
            forks: vec![0; 2],
            mempool: vec![pending],
            vanished: vec![coinbase_txid(8, 2)],
        }));
        let source = source_for(chain, 10).await;

        let txs = source.pending_transactions().await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].outputs[0].amount.0, 150_000_000);

        let txid = source.submit_raw_transaction("0100").await.unwrap();
        assert_eq!(txid.to_hex(), coinbase_txid(7, 7));
    }

    #[tokio::test]
    async fn test_rpc_error_is_surfaced() {
        let chain = Arc::new(Mutex::new(FakeChain {
            forks: vec![0; 2],
            ..Default::default()
        }));
        let source = source_for(chain, 10).await;

        let result: IndexerResult<Value> = source.client().call("stop", vec![]).await;
        assert!(matches!(
            result,
            Err(IndexerError::RpcError { code: -32601, .. })
        ));
    }
}
