//! Scripted chain fixtures for driver tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::SyncError;
use crate::intervals::{Interval, IntervalSet};
use crate::rpc::{BlockData, RpcClient};
use crate::store::{
    BlockRow, ChildAddressRow, LogRow, RangeRows, SyncStore, TraceRow, TransactionReceiptRow,
    TransactionRow,
};

pub fn block_row(chain_id: u64, number: u64) -> BlockRow {
    BlockRow {
        chain_id,
        number,
        timestamp: 1_700_000_000 + number,
        hash: canonical_hash(number),
        parent_hash: canonical_hash(number.wrapping_sub(1)),
        logs_bloom: Bloom::ZERO,
        miner: Address::ZERO,
        gas_used: 0,
        gas_limit: 30_000_000,
        base_fee_per_gas: Some(7),
        nonce: None,
        mix_hash: None,
        state_root: B256::ZERO,
        receipts_root: B256::ZERO,
        transactions_root: B256::ZERO,
        sha3_uncles: None,
        size: 0,
        difficulty: U256::ZERO,
        total_difficulty: None,
        extra_data: Bytes::new(),
    }
}

pub fn canonical_hash(number: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&number.to_be_bytes());
    bytes[31] = 0xc4;
    B256::from(bytes)
}

pub fn tx_row(block: &BlockRow, index: u64, from: Address, to: Option<Address>) -> TransactionRow {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&block.number.to_be_bytes());
    hash[8..16].copy_from_slice(&index.to_be_bytes());
    hash[31] = 0x7f;
    TransactionRow {
        chain_id: block.chain_id,
        block_number: block.number,
        transaction_index: index,
        hash: B256::from(hash),
        block_hash: block.hash,
        from,
        to,
        input: Bytes::new(),
        value: U256::ZERO,
        nonce: index,
        r: None,
        s: None,
        v: None,
        tx_type: 2,
        gas: 21_000,
        gas_price: None,
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
        access_list: None,
    }
}

pub fn log_row(
    block: &BlockRow,
    tx: &TransactionRow,
    log_index: u64,
    address: Address,
    topics: &[B256],
    data: Bytes,
) -> LogRow {
    LogRow {
        chain_id: block.chain_id,
        block_number: block.number,
        log_index,
        transaction_index: tx.transaction_index,
        block_hash: block.hash,
        transaction_hash: Some(tx.hash),
        address,
        topic0: topics.first().copied(),
        topic1: topics.get(1).copied(),
        topic2: topics.get(2).copied(),
        topic3: topics.get(3).copied(),
        data,
    }
}

#[derive(Default)]
struct MockChainData {
    blocks: Vec<BlockData>,
    logs: Vec<LogRow>,
    traces: Vec<TraceRow>,
    receipts: Vec<TransactionReceiptRow>,
}

/// Scripted RPC node. Every request is recorded for assertions about what
/// the drivers actually fetched.
#[derive(Default)]
pub struct MockRpc {
    chain_id: u64,
    data: Mutex<MockChainData>,
    pub requests: Mutex<Vec<String>>,
}

impl MockRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    pub fn push_block(&self, data: BlockData) {
        self.data.lock().blocks.push(data);
    }

    pub fn push_blocks(&self, blocks: impl IntoIterator<Item = BlockData>) {
        self.data.lock().blocks.extend(blocks);
    }

    pub fn push_log(&self, log: LogRow) {
        self.data.lock().logs.push(log);
    }

    /// Replace the canonical tip, dropping same-or-higher blocks first. Used
    /// to script a reorg.
    pub fn reorg_to(&self, data: BlockData) {
        let mut inner = self.data.lock();
        inner
            .blocks
            .retain(|b| b.block.number < data.block.number);
        inner.blocks.push(data);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    pub fn requests_matching(&self, prefix: &str) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn record(&self, request: String) {
        self.requests.lock().push(request);
    }
}

#[async_trait]
impl RpcClient for MockRpc {
    async fn chain_id(&self) -> Result<u64, SyncError> {
        self.record("chain_id".into());
        Ok(self.chain_id)
    }

    async fn block_by_number(
        &self,
        number: Option<u64>,
        _full: bool,
    ) -> Result<Option<BlockData>, SyncError> {
        let inner = self.data.lock();
        let data = match number {
            Some(n) => {
                self.record(format!("block:{n}"));
                inner.blocks.iter().find(|b| b.block.number == n)
            }
            None => {
                self.record("block:latest".into());
                inner.blocks.iter().max_by_key(|b| b.block.number)
            }
        };
        Ok(data.cloned())
    }

    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockData>, SyncError> {
        self.record(format!("block_by_hash:{hash:#x}"));
        let inner = self.data.lock();
        Ok(inner
            .blocks
            .iter()
            .find(|b| b.block.hash == hash)
            .cloned())
    }

    async fn logs_by_range(
        &self,
        from: u64,
        to: u64,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError> {
        self.record(format!("logs:{from}-{to}"));
        let inner = self.data.lock();
        Ok(inner
            .logs
            .iter()
            .filter(|log| log.block_number >= from && log.block_number <= to)
            .filter(|log| {
                addresses
                    .as_ref()
                    .map(|a| a.contains(&log.address))
                    .unwrap_or(true)
            })
            .filter(|log| {
                topic0
                    .as_ref()
                    .map(|t| log.topic0.map(|t0| t.contains(&t0)).unwrap_or(false))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn logs_by_hash(
        &self,
        block_hash: B256,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<LogRow>, SyncError> {
        self.record(format!("logs_by_hash:{block_hash:#x}"));
        let inner = self.data.lock();
        Ok(inner
            .logs
            .iter()
            .filter(|log| log.block_hash == block_hash)
            .filter(|log| {
                addresses
                    .as_ref()
                    .map(|a| a.contains(&log.address))
                    .unwrap_or(true)
            })
            .filter(|log| {
                topic0
                    .as_ref()
                    .map(|t| log.topic0.map(|t0| t.contains(&t0)).unwrap_or(false))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceiptRow>, SyncError> {
        self.record(format!("receipt:{hash:#x}"));
        let inner = self.data.lock();
        Ok(inner
            .receipts
            .iter()
            .find(|r| r.transaction_hash == hash)
            .cloned())
    }

    async fn trace_block(&self, number: u64) -> Result<Vec<TraceRow>, SyncError> {
        self.record(format!("trace:{number}"));
        let inner = self.data.lock();
        Ok(inner
            .traces
            .iter()
            .filter(|t| t.block_number == number)
            .cloned()
            .collect())
    }
}

/// Store wrapper counting writes; reads pass through uncounted.
pub struct CountingStore {
    inner: Arc<dyn SyncStore>,
    pub writes: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn SyncStore>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl SyncStore for CountingStore {
    fn insert_blocks(&self, blocks: &[BlockRow]) -> Result<(), SyncError> {
        self.bump();
        self.inner.insert_blocks(blocks)
    }

    fn insert_logs(&self, logs: &[LogRow]) -> Result<(), SyncError> {
        self.bump();
        self.inner.insert_logs(logs)
    }

    fn insert_transactions(&self, transactions: &[TransactionRow]) -> Result<(), SyncError> {
        self.bump();
        self.inner.insert_transactions(transactions)
    }

    fn insert_receipts(&self, receipts: &[TransactionReceiptRow]) -> Result<(), SyncError> {
        self.bump();
        self.inner.insert_receipts(receipts)
    }

    fn insert_traces(&self, traces: &[TraceRow]) -> Result<(), SyncError> {
        self.bump();
        self.inner.insert_traces(traces)
    }

    fn insert_interval(
        &self,
        chain_id: u64,
        fragment_id: &str,
        interval: Interval,
    ) -> Result<(), SyncError> {
        self.bump();
        self.inner.insert_interval(chain_id, fragment_id, interval)
    }

    fn get_intervals(
        &self,
        chain_id: u64,
        fragment_ids: &[String],
    ) -> Result<IntervalSet, SyncError> {
        self.inner.get_intervals(chain_id, fragment_ids)
    }

    fn insert_factory(&self, chain_id: u64, factory_id: &str, spec: &str) -> Result<(), SyncError> {
        self.bump();
        self.inner.insert_factory(chain_id, factory_id, spec)
    }

    fn insert_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
        children: &[ChildAddressRow],
    ) -> Result<(), SyncError> {
        self.bump();
        self.inner
            .insert_child_addresses(chain_id, factory_id, children)
    }

    fn get_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
    ) -> Result<Vec<ChildAddressRow>, SyncError> {
        self.inner.get_child_addresses(chain_id, factory_id)
    }

    fn read_range(&self, chain_id: u64, lo: u64, hi: u64) -> Result<RangeRows, SyncError> {
        self.inner.read_range(chain_id, lo, hi)
    }

    fn delete_above(&self, chain_id: u64, block_number: u64) -> Result<(), SyncError> {
        self.bump();
        self.inner.delete_above(chain_id, block_number)
    }

    fn get_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
    ) -> Result<Option<String>, SyncError> {
        self.inner.get_rpc_result(chain_id, request_hash)
    }

    fn insert_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
        block_number: Option<u64>,
        result: &str,
    ) -> Result<(), SyncError> {
        self.bump();
        self.inner
            .insert_rpc_result(chain_id, request_hash, block_number, result)
    }
}
