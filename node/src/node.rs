//! Indexer node: sync pipeline plus query API

use crate::api::start_api_server;
use crate::runtime::{IndexerRuntime, Upstream};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use utxodex_core::IndexerConfig;

/// Full utxodex node
pub struct IndexerNode {
    runtime: Arc<IndexerRuntime>,
}

impl IndexerNode {
    /// Open the ledger and connect to the upstream node
    pub fn new(config: IndexerConfig) -> anyhow::Result<Self> {
        let upstream = Upstream::from_config(&config)?;
        let runtime = Arc::new(IndexerRuntime::open(config, upstream)?);
        Ok(Self { runtime })
    }

    /// Run until ctrl-c or a sync halt
    pub async fn start(&self) -> anyhow::Result<()> {
        info!("Starting {} indexer...", self.runtime.config().name);

        let api_handle = if self.runtime.config().api.enabled {
            let api_runtime = self.runtime.clone();
            let api_addr = self.runtime.config().api.listen_addr.clone();
            let enable_cors = self.runtime.config().api.enable_cors;

            Some(tokio::spawn(async move {
                if let Err(e) = start_api_server(api_runtime, &api_addr, enable_cors).await {
                    error!("API server error: {}", e);
                }
            }))
        } else {
            None
        };

        let mut handles = self.runtime.start_sync()?;
        info!("Indexer started at height {}", self.runtime.status().next_height);

        let outcome = tokio::select! {
            signal = signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Shutdown signal received, stopping indexer..."),
                    Err(e) => error!("Error waiting for shutdown signal: {}", e),
                }
                // Dropping the driver closes the event channel; the worker
                // finishes the blocks already queued and stops.
                handles.driver.abort();
                (&mut handles.worker).await
            }
            finished = &mut handles.worker => {
                handles.driver.abort();
                finished
            }
        };

        if let Some(api_handle) = api_handle {
            api_handle.abort();
        }
        if let Err(e) = self.runtime.flush() {
            warn!("Final flush failed: {}", e);
        }

        match outcome {
            Ok(Ok(())) => {
                info!("Indexer stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Indexer halted: {}", e);
                Err(e.into())
            }
            Err(e) => Err(anyhow::anyhow!("sync worker panicked: {}", e)),
        }
    }

    /// Get runtime reference
    pub fn runtime(&self) -> &Arc<IndexerRuntime> {
        &self.runtime
    }
}

/// Node builder applying command line overrides on top of a config
pub struct NodeBuilder {
    config: IndexerConfig,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.config.data_dir = dir;
        self
    }

    pub fn api_addr(mut self, addr: &str) -> Self {
        self.config.api.listen_addr = addr.to_string();
        self
    }

    pub fn rpc_url(mut self, url: &str) -> Self {
        self.config.rpc.url = url.to_string();
        self
    }

    pub fn build(self) -> anyhow::Result<IndexerNode> {
        self.config.validate()?;
        IndexerNode::new(self.config)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
