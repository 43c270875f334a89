//! Per-chain configuration.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Duration;

/// Names for well-known chain ids, used in logs and progress output.
static CHAIN_NAMES: Lazy<HashMap<u64, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(1, "mainnet");
    m.insert(10, "optimism");
    m.insert(137, "polygon");
    m.insert(8453, "base");
    m.insert(42161, "arbitrum");
    m.insert(11155111, "sepolia");
    m
});

/// Static configuration for one chain the engine syncs.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Chain id the remote node is expected to report.
    pub chain_id: u64,
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Blocks behind the tip at which a block is considered final.
    pub finality_block_count: u64,
    /// Realtime polling cadence.
    pub poll_interval: Duration,
    /// Maximum concurrent in-flight RPC requests for this chain.
    pub max_rpc_concurrency: usize,
    /// Number of blocks fetched per `eth_getLogs` range request.
    pub blocks_per_log_request: u64,
    /// Maximum events emitted per historical page.
    pub events_per_page: usize,
    /// When set, the persistent sync store is not consulted at all: every
    /// fragment starts with empty cached intervals and nothing is written
    /// back. Useful for tests and for chains with low reorg resistance.
    pub disable_cache: bool,
}

impl ChainConfig {
    pub fn new(chain_id: u64, rpc_url: impl Into<String>) -> Self {
        Self {
            chain_id,
            rpc_url: rpc_url.into(),
            finality_block_count: 64,
            poll_interval: Duration::from_secs(2),
            max_rpc_concurrency: 10,
            blocks_per_log_request: 2_000,
            events_per_page: 1_000,
            disable_cache: false,
        }
    }

    pub fn finality_block_count(mut self, count: u64) -> Self {
        self.finality_block_count = count;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn disable_cache(mut self, disable: bool) -> Self {
        self.disable_cache = disable;
        self
    }

    /// Human-readable name: the well-known chain name, or `chain <id>`.
    pub fn display_name(&self) -> String {
        CHAIN_NAMES
            .get(&self.chain_id)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("chain {}", self.chain_id))
    }
}
