//! JSON-RPC client for the upstream full node

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use utxodex_core::{BlockHash, BlockHeight, IndexerError, IndexerResult, RpcConfig};

use crate::raw::{RawBlock, RawTransaction};

/// Node error code for an unknown transaction or block
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// Node error code for a height beyond the tip
pub const RPC_INVALID_PARAMETER: i64 = -8;

/// How requests authenticate against the node
#[derive(Debug, Clone)]
pub enum RpcAuth {
    None,
    UserPass { user: String, password: String },
    /// Re-read on every call; the node rewrites it on restart
    CookieFile(PathBuf),
}

impl RpcAuth {
    pub fn from_config(config: &RpcConfig) -> Self {
        match (&config.user, &config.password, &config.cookie_file) {
            (Some(user), Some(password), _) => RpcAuth::UserPass {
                user: user.clone(),
                password: password.clone(),
            },
            (_, _, Some(cookie)) => RpcAuth::CookieFile(expand_home(cookie)),
            _ => RpcAuth::None,
        }
    }

    fn credentials(&self) -> IndexerResult<Option<(String, String)>> {
        match self {
            RpcAuth::None => Ok(None),
            RpcAuth::UserPass { user, password } => Ok(Some((user.clone(), password.clone()))),
            RpcAuth::CookieFile(path) => read_cookie(path).map(Some),
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Full node RPC client
pub struct RpcClient {
    url: String,
    client: Client,
    auth: RpcAuth,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, auth: RpcAuth, timeout: Duration) -> IndexerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::ConfigError(format!("http client: {}", e)))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            auth,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &RpcConfig) -> IndexerResult<Self> {
        Self::new(
            &config.url,
            RpcAuth::from_config(config),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Issue one call and decode its `result`
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> IndexerResult<T> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some((user, password)) = self.auth.credentials()? {
            builder = builder.basic_auth(user, Some(password));
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(IndexerError::NetworkError(format!(
                "{} rejected credentials for {}",
                self.url, method
            )));
        }

        // The node answers RPC errors with a non-2xx status and a JSON body.
        let body = response.bytes().await.map_err(transport_error)?;
        let decoded: RpcResponse<T> = serde_json::from_slice(&body).map_err(|e| {
            if status.is_success() {
                IndexerError::DeserializationError(format!("{}: {}", method, e))
            } else {
                IndexerError::NetworkError(format!("{} returned HTTP {}", method, status))
            }
        })?;

        if let Some(error) = decoded.error {
            return Err(IndexerError::RpcError {
                code: error.code,
                message: error.message,
            });
        }
        debug!("RPC {} ok", method);

        decoded.result.ok_or_else(|| {
            IndexerError::DeserializationError(format!("{}: empty result", method))
        })
    }

    pub async fn get_block_count(&self) -> IndexerResult<BlockHeight> {
        self.call("getblockcount", vec![]).await
    }

    pub async fn get_block_hash(&self, height: BlockHeight) -> IndexerResult<BlockHash> {
        let hex: String = self.call("getblockhash", vec![json!(height)]).await?;
        BlockHash::from_hex(&hex).map_err(|e| IndexerError::MalformedBlock {
            height,
            reason: format!("bad block hash {}: {}", hex, e),
        })
    }

    /// Block with fully decoded transactions
    pub async fn get_block(&self, hash: &BlockHash) -> IndexerResult<RawBlock> {
        self.call("getblock", vec![json!(hash.to_hex()), json!(2)]).await
    }

    pub async fn get_raw_mempool(&self) -> IndexerResult<Vec<String>> {
        self.call("getrawmempool", vec![]).await
    }

    pub async fn get_raw_transaction(&self, txid: &str) -> IndexerResult<RawTransaction> {
        self.call("getrawtransaction", vec![json!(txid), json!(1)]).await
    }

    pub async fn send_raw_transaction(&self, raw_hex: &str) -> IndexerResult<String> {
        self.call("sendrawtransaction", vec![json!(raw_hex)]).await
    }
}

fn transport_error(e: reqwest::Error) -> IndexerError {
    if e.is_timeout() {
        IndexerError::Timeout(e.to_string())
    } else {
        IndexerError::NetworkError(e.to_string())
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}

/// Read `user:password` from a node cookie file
pub fn read_cookie(path: &Path) -> IndexerResult<(String, String)> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        IndexerError::NetworkError(format!("cookie file {}: {}", path.display(), e))
    })?;
    content
        .trim()
        .split_once(':')
        .map(|(user, password)| (user.to_string(), password.to_string()))
        .ok_or_else(|| {
            IndexerError::ConfigError(format!("cookie file {} is malformed", path.display()))
        })
}
