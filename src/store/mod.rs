//! Sync store contract.
//!
//! The store is the single shared mutable resource of the engine: the
//! historical driver writes at or below the finalized block, the realtime
//! driver writes above it and deletes above the common ancestor on reorg.
//! Raw chain data is persisted here exactly once and read back in onchain
//! execution order for event assembly, and per-fragment cached intervals are
//! what let a re-run skip work already done.

use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::intervals::{Interval, IntervalSet};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A block header row. Primary key `(chain_id, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub chain_id: u64,
    pub number: u64,
    pub timestamp: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub logs_bloom: Bloom,
    pub miner: Address,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<u64>,
    pub nonce: Option<u64>,
    pub mix_hash: Option<B256>,
    pub state_root: B256,
    pub receipts_root: B256,
    pub transactions_root: B256,
    pub sha3_uncles: Option<B256>,
    pub size: u64,
    pub difficulty: U256,
    pub total_difficulty: Option<U256>,
    pub extra_data: Bytes,
}

/// A log row. Primary key `(chain_id, block_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRow {
    pub chain_id: u64,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_index: u64,
    pub block_hash: B256,
    /// Absent on chains where a log can exist without a transaction.
    pub transaction_hash: Option<B256>,
    pub address: Address,
    pub topic0: Option<B256>,
    pub topic1: Option<B256>,
    pub topic2: Option<B256>,
    pub topic3: Option<B256>,
    pub data: Bytes,
}

impl LogRow {
    pub fn topics(&self) -> Vec<B256> {
        [self.topic0, self.topic1, self.topic2, self.topic3]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// A transaction row. Primary key `(chain_id, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub hash: B256,
    pub block_hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub r: Option<U256>,
    pub s: Option<U256>,
    pub v: Option<U256>,
    /// Raw type byte. Known types are 0x00/0x01/0x02/0x03 plus the 0x7e
    /// deposit type; unknown bytes are preserved verbatim.
    pub tx_type: u8,
    pub gas: u64,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    /// JSON-encoded access list, when present.
    pub access_list: Option<String>,
}

/// A transaction receipt row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceiptRow {
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
    pub logs_bloom: Bloom,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub effective_gas_price: u128,
    pub status: bool,
    pub tx_type: u8,
}

/// A call-trace row, flattened from the per-transaction call tree in
/// depth-first order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRow {
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub trace_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub output: Option<Bytes>,
    pub value: Option<U256>,
    pub trace_type: String,
    pub gas: u64,
    pub gas_used: u64,
    pub error: Option<String>,
    pub revert_reason: Option<String>,
    pub subcalls: u64,
}

/// A factory child address with the block it was first observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildAddressRow {
    pub address: Address,
    pub block_number: u64,
}

/// Everything persisted for one block range, read back in execution order by
/// the event assembler.
#[derive(Debug, Clone, Default)]
pub struct RangeRows {
    pub blocks: Vec<BlockRow>,
    pub transactions: Vec<TransactionRow>,
    pub receipts: Vec<TransactionReceiptRow>,
    pub logs: Vec<LogRow>,
    pub traces: Vec<TraceRow>,
}

/// Contract the sync drivers persist through and read back from.
///
/// Implementations serialize concurrent writers internally; historical and
/// realtime drivers coexist because they touch disjoint block ranges.
pub trait SyncStore: Send + Sync {
    fn insert_blocks(&self, blocks: &[BlockRow]) -> Result<(), SyncError>;
    fn insert_logs(&self, logs: &[LogRow]) -> Result<(), SyncError>;
    fn insert_transactions(&self, transactions: &[TransactionRow]) -> Result<(), SyncError>;
    fn insert_receipts(&self, receipts: &[TransactionReceiptRow]) -> Result<(), SyncError>;
    fn insert_traces(&self, traces: &[TraceRow]) -> Result<(), SyncError>;

    /// Merge `interval` into the cached set for `fragment_id`.
    fn insert_interval(
        &self,
        chain_id: u64,
        fragment_id: &str,
        interval: Interval,
    ) -> Result<(), SyncError>;

    /// Union of cached intervals across a list of fragment ids (a fragment
    /// plus its adjacents).
    fn get_intervals(&self, chain_id: u64, fragment_ids: &[String])
        -> Result<IntervalSet, SyncError>;

    /// Register a factory spec under its fragment id.
    fn insert_factory(&self, chain_id: u64, factory_id: &str, spec: &str) -> Result<(), SyncError>;

    /// Record child addresses, keeping the earliest first-seen block per
    /// address.
    fn insert_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
        children: &[ChildAddressRow],
    ) -> Result<(), SyncError>;

    fn get_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
    ) -> Result<Vec<ChildAddressRow>, SyncError>;

    /// Read back every persisted row for `[lo, hi]`, each table ordered by
    /// `(block_number, transaction_index, index-within-transaction)`.
    fn read_range(&self, chain_id: u64, lo: u64, hi: u64) -> Result<RangeRows, SyncError>;

    /// Delete all block data strictly above `block_number`. Used by the
    /// realtime driver when reconciling a reorg.
    fn delete_above(&self, chain_id: u64, block_number: u64) -> Result<(), SyncError>;

    /// Cached RPC response lookup, keyed by a stable request hash.
    fn get_rpc_result(&self, chain_id: u64, request_hash: &str)
        -> Result<Option<String>, SyncError>;

    fn insert_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
        block_number: Option<u64>,
        result: &str,
    ) -> Result<(), SyncError>;
}
