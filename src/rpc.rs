//! Typed JSON-RPC access.
//!
//! The drivers never talk to a provider directly: they go through a
//! [`RequestQueue`], which bounds per-chain concurrency with a semaphore,
//! retries transient failures with jittered exponential backoff, consults the
//! optional RPC response cache for deterministic range queries, and honors the
//! kill switch between attempts. [`HttpRpc`] is the production client over an
//! alloy provider; tests substitute their own [`RpcClient`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, B64, U256, U64};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types::Filter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::errors::SyncError;
use crate::store::{
    BlockRow, LogRow, SyncStore, TraceRow, TransactionReceiptRow, TransactionRow,
};

/// Attempts per request before the failure escalates.
const MAX_RETRIES: u32 = 6;
/// Base backoff; doubles per attempt, capped at 2^5 x base.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF_EXP: u32 = 5;

/// A block header with the full transaction objects it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    pub block: BlockRow,
    pub transactions: Vec<TransactionRow>,
}

/// Typed wrappers around the node RPC surface the sync engine relies on.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, SyncError>;

    /// `eth_getBlockByNumber`. `None` means the `latest` tag. `full` controls
    /// whether transaction objects are materialized.
    async fn block_by_number(
        &self,
        number: Option<u64>,
        full: bool,
    ) -> Result<Option<BlockData>, SyncError>;

    /// `eth_getBlockByHash` with full transactions.
    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockData>, SyncError>;

    /// `eth_getLogs` over an inclusive block range, optionally scoped by
    /// address and topic0.
    async fn logs_by_range(
        &self,
        from: u64,
        to: u64,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError>;

    /// `eth_getLogs` for a single block by hash.
    async fn logs_by_hash(
        &self,
        block_hash: B256,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError>;

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceiptRow>, SyncError>;

    /// `debug_traceBlockByNumber` with the call tracer, flattened into
    /// depth-first `(transaction_index, trace_index)` rows.
    async fn trace_block(&self, number: u64) -> Result<Vec<TraceRow>, SyncError>;
}

// Wire shapes for the raw requests where we need fields the typed provider
// API does not surface uniformly (signatures, deposit-type bytes, ...).

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireBlockTransactions {
    Full(Vec<WireTransaction>),
    Hashes(Vec<B256>),
}

impl Default for WireBlockTransactions {
    fn default() -> Self {
        WireBlockTransactions::Hashes(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlock {
    number: U64,
    timestamp: U64,
    hash: B256,
    parent_hash: B256,
    logs_bloom: Bloom,
    miner: Address,
    gas_used: U64,
    gas_limit: U64,
    #[serde(default)]
    base_fee_per_gas: Option<U64>,
    #[serde(default)]
    nonce: Option<B64>,
    #[serde(default)]
    mix_hash: Option<B256>,
    state_root: B256,
    receipts_root: B256,
    transactions_root: B256,
    #[serde(default)]
    sha3_uncles: Option<B256>,
    #[serde(default)]
    size: U64,
    #[serde(default)]
    difficulty: U256,
    #[serde(default)]
    total_difficulty: Option<U256>,
    #[serde(default)]
    extra_data: Bytes,
    #[serde(default)]
    transactions: WireBlockTransactions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTransaction {
    hash: B256,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    block_hash: Option<B256>,
    #[serde(default)]
    transaction_index: Option<U64>,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    input: Bytes,
    #[serde(default)]
    value: U256,
    #[serde(default)]
    nonce: U64,
    #[serde(default)]
    r: Option<U256>,
    #[serde(default)]
    s: Option<U256>,
    #[serde(default)]
    v: Option<U256>,
    #[serde(default, rename = "type")]
    tx_type: Option<U64>,
    #[serde(default)]
    gas: U64,
    #[serde(default)]
    gas_price: Option<U256>,
    #[serde(default)]
    max_fee_per_gas: Option<U256>,
    #[serde(default)]
    max_priority_fee_per_gas: Option<U256>,
    #[serde(default)]
    access_list: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceipt {
    block_number: U64,
    #[serde(default)]
    transaction_index: U64,
    transaction_hash: B256,
    block_hash: B256,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    contract_address: Option<Address>,
    logs_bloom: Bloom,
    gas_used: U64,
    cumulative_gas_used: U64,
    #[serde(default)]
    effective_gas_price: U256,
    status: U64,
    #[serde(default, rename = "type")]
    tx_type: Option<U64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTraceResult {
    #[serde(default)]
    tx_hash: Option<B256>,
    result: WireCallFrame,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCallFrame {
    #[serde(default)]
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    input: Bytes,
    #[serde(default)]
    output: Option<Bytes>,
    #[serde(default)]
    value: Option<U256>,
    #[serde(default)]
    gas: U64,
    #[serde(default)]
    gas_used: U64,
    #[serde(rename = "type")]
    call_type: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    revert_reason: Option<String>,
    #[serde(default)]
    calls: Vec<WireCallFrame>,
}

/// Production client over an alloy HTTP provider.
pub struct HttpRpc {
    provider: Arc<RootProvider>,
    chain_id: u64,
}

impl HttpRpc {
    pub fn new(url: &str, chain_id: u64) -> Result<Self, SyncError> {
        let parsed = url
            .parse()
            .map_err(|e| SyncError::Rpc(format!("invalid rpc url {url}: {e}")))?;
        let provider = Arc::new(ProviderBuilder::default().connect_http(parsed));
        Ok(Self { provider, chain_id })
    }

    fn block_from_wire(&self, wire: WireBlock) -> BlockData {
        let block = BlockRow {
            chain_id: self.chain_id,
            number: wire.number.to::<u64>(),
            timestamp: wire.timestamp.to::<u64>(),
            hash: wire.hash,
            parent_hash: wire.parent_hash,
            logs_bloom: wire.logs_bloom,
            miner: wire.miner,
            gas_used: wire.gas_used.to::<u64>(),
            gas_limit: wire.gas_limit.to::<u64>(),
            base_fee_per_gas: wire.base_fee_per_gas.map(|v| v.to::<u64>()),
            nonce: wire.nonce.map(|n| u64::from_be_bytes(n.0)),
            mix_hash: wire.mix_hash,
            state_root: wire.state_root,
            receipts_root: wire.receipts_root,
            transactions_root: wire.transactions_root,
            sha3_uncles: wire.sha3_uncles,
            size: wire.size.to::<u64>(),
            difficulty: wire.difficulty,
            total_difficulty: wire.total_difficulty,
            extra_data: wire.extra_data,
        };
        let transactions = match wire.transactions {
            WireBlockTransactions::Hashes(_) => Vec::new(),
            WireBlockTransactions::Full(txs) => txs
                .into_iter()
                .map(|tx| TransactionRow {
                    chain_id: self.chain_id,
                    block_number: tx.block_number.map(|n| n.to()).unwrap_or(block.number),
                    transaction_index: tx.transaction_index.map(|i| i.to()).unwrap_or_default(),
                    hash: tx.hash,
                    block_hash: tx.block_hash.unwrap_or(block.hash),
                    from: tx.from,
                    to: tx.to,
                    input: tx.input,
                    value: tx.value,
                    nonce: tx.nonce.to(),
                    r: tx.r,
                    s: tx.s,
                    v: tx.v,
                    tx_type: tx.tx_type.map(|t| t.to::<u64>() as u8).unwrap_or(0),
                    gas: tx.gas.to(),
                    gas_price: tx.gas_price.map(|v| v.to::<u128>()),
                    max_fee_per_gas: tx.max_fee_per_gas.map(|v| v.to::<u128>()),
                    max_priority_fee_per_gas: tx.max_priority_fee_per_gas.map(|v| v.to::<u128>()),
                    access_list: tx.access_list.map(|v| v.to_string()),
                })
                .collect(),
        };
        BlockData {
            block,
            transactions,
        }
    }

    fn log_from_rpc(&self, log: &alloy_rpc_types::Log) -> Result<LogRow, SyncError> {
        let topics = log.inner.data.topics();
        Ok(LogRow {
            chain_id: self.chain_id,
            block_number: log
                .block_number
                .ok_or(SyncError::MalformedResponse("log without blockNumber".into()))?,
            log_index: log
                .log_index
                .ok_or(SyncError::MalformedResponse("log without logIndex".into()))?,
            transaction_index: log.transaction_index.unwrap_or_default(),
            block_hash: log
                .block_hash
                .ok_or(SyncError::MalformedResponse("log without blockHash".into()))?,
            transaction_hash: log.transaction_hash,
            address: log.inner.address,
            topic0: topics.first().copied(),
            topic1: topics.get(1).copied(),
            topic2: topics.get(2).copied(),
            topic3: topics.get(3).copied(),
            data: log.inner.data.data.clone(),
        })
    }

    fn scoped_filter(
        base: Filter,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Filter {
        let mut filter = base;
        if let Some(addresses) = addresses {
            filter = filter.address(addresses);
        }
        if let Some(topic0) = topic0 {
            filter = filter.event_signature(topic0);
        }
        filter
    }

    async fn fetch_logs(&self, filter: &Filter) -> Result<Vec<LogRow>, SyncError> {
        let logs = self
            .provider
            .get_logs(filter)
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))?;
        logs.iter().map(|log| self.log_from_rpc(log)).collect()
    }

    fn flatten_frame(
        &self,
        frame: WireCallFrame,
        block_number: u64,
        transaction_index: u64,
        next_index: &mut u64,
        out: &mut Vec<TraceRow>,
    ) {
        let trace_index = *next_index;
        *next_index += 1;
        let subcalls = frame.calls.len() as u64;
        out.push(TraceRow {
            chain_id: self.chain_id,
            block_number,
            transaction_index,
            trace_index,
            from: frame.from,
            to: frame.to,
            input: frame.input,
            output: frame.output,
            value: frame.value,
            trace_type: frame.call_type,
            gas: frame.gas.to(),
            gas_used: frame.gas_used.to(),
            error: frame.error,
            revert_reason: frame.revert_reason,
            subcalls,
        });
        for call in frame.calls {
            self.flatten_frame(call, block_number, transaction_index, next_index, out);
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpc {
    async fn chain_id(&self) -> Result<u64, SyncError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))
    }

    async fn block_by_number(
        &self,
        number: Option<u64>,
        full: bool,
    ) -> Result<Option<BlockData>, SyncError> {
        let tag = match number {
            Some(n) => format!("0x{n:x}"),
            None => "latest".to_string(),
        };
        let wire: Option<WireBlock> = self
            .provider
            .raw_request("eth_getBlockByNumber".into(), (tag, full))
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))?;
        Ok(wire.map(|w| self.block_from_wire(w)))
    }

    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockData>, SyncError> {
        let wire: Option<WireBlock> = self
            .provider
            .raw_request("eth_getBlockByHash".into(), (hash, true))
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))?;
        Ok(wire.map(|w| self.block_from_wire(w)))
    }

    async fn logs_by_range(
        &self,
        from: u64,
        to: u64,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError> {
        let filter = Self::scoped_filter(
            Filter::new().from_block(from).to_block(to),
            addresses,
            topic0,
        );
        self.fetch_logs(&filter).await
    }

    async fn logs_by_hash(
        &self,
        block_hash: B256,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError> {
        let filter = Self::scoped_filter(Filter::new().at_block_hash(block_hash), addresses, topic0);
        self.fetch_logs(&filter).await
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceiptRow>, SyncError> {
        let wire: Option<WireReceipt> = self
            .provider
            .raw_request("eth_getTransactionReceipt".into(), (hash,))
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))?;
        Ok(wire.map(|r| TransactionReceiptRow {
            chain_id: self.chain_id,
            block_number: r.block_number.to(),
            transaction_index: r.transaction_index.to(),
            transaction_hash: r.transaction_hash,
            block_hash: r.block_hash,
            from: r.from,
            to: r.to,
            contract_address: r.contract_address,
            logs_bloom: r.logs_bloom,
            gas_used: r.gas_used.to(),
            cumulative_gas_used: r.cumulative_gas_used.to(),
            effective_gas_price: r.effective_gas_price.to::<u128>(),
            status: r.status.to::<u64>() == 1,
            tx_type: r.tx_type.map(|t| t.to::<u64>() as u8).unwrap_or(0),
        }))
    }

    async fn trace_block(&self, number: u64) -> Result<Vec<TraceRow>, SyncError> {
        let results: Vec<WireTraceResult> = self
            .provider
            .raw_request(
                "debug_traceBlockByNumber".into(),
                (format!("0x{number:x}"), json!({ "tracer": "callTracer" })),
            )
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))?;
        let mut out = Vec::new();
        for (transaction_index, result) in results.into_iter().enumerate() {
            let _ = result.tx_hash;
            let mut next_index = 0;
            self.flatten_frame(
                result.result,
                number,
                transaction_index as u64,
                &mut next_index,
                &mut out,
            );
        }
        Ok(out)
    }
}

struct QueueInner {
    client: Arc<dyn RpcClient>,
    semaphore: Semaphore,
    killed: AtomicBool,
    chain_id: u64,
    /// Response cache for deterministic range queries; absent when the chain
    /// runs with `disable_cache`.
    cache: Option<Arc<dyn SyncStore>>,
}

/// Per-chain request queue: bounded concurrency, retries, kill switch.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(
        client: Arc<dyn RpcClient>,
        chain_id: u64,
        concurrency: usize,
        cache: Option<Arc<dyn SyncStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                client,
                semaphore: Semaphore::new(concurrency.max(1)),
                killed: AtomicBool::new(false),
                chain_id,
                cache,
            }),
        }
    }

    /// Stop issuing requests. Pending permit waiters error out; in-flight
    /// calls finish their current attempt and stop retrying.
    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    async fn with_retries<T, Fut>(
        &self,
        label: &str,
        mut attempt: impl FnMut() -> Fut,
    ) -> Result<T, SyncError>
    where
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let _permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| SyncError::Killed)?;
        let mut backoff = INITIAL_BACKOFF;
        for tries in 0..MAX_RETRIES {
            if self.is_killed() {
                return Err(SyncError::Killed);
            }
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if tries + 1 == MAX_RETRIES {
                        return Err(SyncError::RetriesExhausted {
                            chain_id: self.inner.chain_id,
                            attempts: MAX_RETRIES,
                            last: e.to_string(),
                        });
                    }
                    warn!(chain_id = self.inner.chain_id, %label, attempt = tries + 1, error = %e, "rpc request failed, retrying");
                    let jitter = Duration::from_millis(fastrand::u64(0..=100));
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = (backoff * 2).min(INITIAL_BACKOFF * 2u32.pow(MAX_BACKOFF_EXP));
                }
            }
        }
        unreachable!("retry loop returns before exhausting iterations")
    }

    fn cache_lookup<T: for<'de> Deserialize<'de>>(&self, request_hash: &str) -> Option<T> {
        let cache = self.inner.cache.as_ref()?;
        let payload = cache
            .get_rpc_result(self.inner.chain_id, request_hash)
            .ok()??;
        serde_json::from_str(&payload).ok()
    }

    fn cache_insert<T: Serialize>(&self, request_hash: &str, block_number: Option<u64>, value: &T) {
        if let Some(cache) = self.inner.cache.as_ref() {
            if let Ok(payload) = serde_json::to_string(value) {
                let _ = cache.insert_rpc_result(
                    self.inner.chain_id,
                    request_hash,
                    block_number,
                    &payload,
                );
            }
        }
    }

    fn request_hash(&self, method: &str, params: &serde_json::Value) -> String {
        let preimage = format!("{}_{}_{}", self.inner.chain_id, method, params);
        format!("{:#x}", keccak256(preimage.as_bytes()))
    }

    pub async fn chain_id(&self) -> Result<u64, SyncError> {
        let client = self.inner.client.clone();
        self.with_retries("eth_chainId", move || {
            let client = client.clone();
            async move { client.chain_id().await }
        })
        .await
    }

    pub async fn block_by_number(
        &self,
        number: Option<u64>,
        full: bool,
    ) -> Result<Option<BlockData>, SyncError> {
        let client = self.inner.client.clone();
        self.with_retries("eth_getBlockByNumber", move || {
            let client = client.clone();
            async move { client.block_by_number(number, full).await }
        })
        .await
    }

    pub async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockData>, SyncError> {
        let client = self.inner.client.clone();
        self.with_retries("eth_getBlockByHash", move || {
            let client = client.clone();
            async move { client.block_by_hash(hash).await }
        })
        .await
    }

    pub async fn logs_by_range(
        &self,
        from: u64,
        to: u64,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError> {
        let params = json!([from, to, &addresses, &topic0]);
        let hash = self.request_hash("eth_getLogs", &params);
        if let Some(cached) = self.cache_lookup::<Vec<LogRow>>(&hash) {
            return Ok(cached);
        }
        let client = self.inner.client.clone();
        let logs = self
            .with_retries("eth_getLogs", move || {
                let client = client.clone();
                let addresses = addresses.clone();
                let topic0 = topic0.clone();
                async move { client.logs_by_range(from, to, addresses, topic0).await }
            })
            .await?;
        self.cache_insert(&hash, Some(to), &logs);
        Ok(logs)
    }

    pub async fn logs_by_hash(
        &self,
        block_hash: B256,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError> {
        let client = self.inner.client.clone();
        self.with_retries("eth_getLogs", move || {
            let client = client.clone();
            let addresses = addresses.clone();
            let topic0 = topic0.clone();
            async move { client.logs_by_hash(block_hash, addresses, topic0).await }
        })
        .await
    }

    pub async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceiptRow>, SyncError> {
        let client = self.inner.client.clone();
        self.with_retries("eth_getTransactionReceipt", move || {
            let client = client.clone();
            async move { client.transaction_receipt(hash).await }
        })
        .await
    }

    pub async fn trace_block(&self, number: u64) -> Result<Vec<TraceRow>, SyncError> {
        let params = json!([number]);
        let hash = self.request_hash("debug_traceBlockByNumber", &params);
        if let Some(cached) = self.cache_lookup::<Vec<TraceRow>>(&hash) {
            return Ok(cached);
        }
        let client = self.inner.client.clone();
        let traces = self
            .with_retries("debug_traceBlockByNumber", move || {
                let client = client.clone();
                async move { client.trace_block(number).await }
            })
            .await?;
        self.cache_insert(&hash, Some(number), &traces);
        Ok(traces)
    }
}

/// Split an inclusive block range into fetch-sized chunks.
pub fn chunk_range(from: u64, to: u64, step: u64) -> Vec<(u64, u64)> {
    assert!(step > 0, "chunk step must be positive");
    let mut out = Vec::new();
    let mut lo = from;
    while lo <= to {
        let hi = lo.saturating_add(step - 1).min(to);
        out.push((lo, hi));
        if hi == u64::MAX {
            break;
        }
        lo = hi + 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_covers_range_exactly() {
        assert_eq!(chunk_range(0, 9, 5), vec![(0, 4), (5, 9)]);
        assert_eq!(chunk_range(0, 10, 5), vec![(0, 4), (5, 9), (10, 10)]);
        assert_eq!(chunk_range(3, 3, 100), vec![(3, 3)]);
    }

    struct FlakyClient {
        failures: AtomicBool,
    }

    #[async_trait]
    impl RpcClient for FlakyClient {
        async fn chain_id(&self) -> Result<u64, SyncError> {
            if self.failures.swap(false, Ordering::SeqCst) {
                Err(SyncError::Rpc("boom".into()))
            } else {
                Ok(1)
            }
        }

        async fn block_by_number(
            &self,
            _number: Option<u64>,
            _full: bool,
        ) -> Result<Option<BlockData>, SyncError> {
            Ok(None)
        }

        async fn block_by_hash(&self, _hash: B256) -> Result<Option<BlockData>, SyncError> {
            Ok(None)
        }

        async fn logs_by_range(
            &self,
            _from: u64,
            _to: u64,
            _addresses: Option<Vec<Address>>,
            _topic0: Option<Vec<B256>>,
        ) -> Result<Vec<LogRow>, SyncError> {
            Ok(Vec::new())
        }

        async fn logs_by_hash(
            &self,
            _block_hash: B256,
            _addresses: Option<Vec<Address>>,
            _topic0: Option<Vec<B256>>,
        ) -> Result<Vec<LogRow>, SyncError> {
            Ok(Vec::new())
        }

        async fn transaction_receipt(
            &self,
            _hash: B256,
        ) -> Result<Option<TransactionReceiptRow>, SyncError> {
            Ok(None)
        }

        async fn trace_block(&self, _number: u64) -> Result<Vec<TraceRow>, SyncError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let queue = RequestQueue::new(
            Arc::new(FlakyClient {
                failures: AtomicBool::new(true),
            }),
            1,
            4,
            None,
        );
        assert_eq!(queue.chain_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn killed_queue_rejects_requests() {
        let queue = RequestQueue::new(
            Arc::new(FlakyClient {
                failures: AtomicBool::new(false),
            }),
            1,
            4,
            None,
        );
        queue.kill();
        assert!(matches!(
            queue.chain_id().await,
            Err(SyncError::Killed)
        ));
    }
}
