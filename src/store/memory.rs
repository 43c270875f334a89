//! In-memory sync store.
//!
//! Used by tests and by chains configured with `disable_cache`: every run
//! starts from empty interval sets and nothing outlives the process.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::B256;
use parking_lot::Mutex;

use crate::errors::SyncError;
use crate::intervals::{Interval, IntervalSet};

use super::{
    BlockRow, ChildAddressRow, LogRow, RangeRows, SyncStore, TraceRow, TransactionReceiptRow,
    TransactionRow,
};

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<(u64, u64, B256), BlockRow>,
    transactions: BTreeMap<(u64, u64, u64), TransactionRow>,
    receipts: BTreeMap<(u64, u64, u64), TransactionReceiptRow>,
    logs: BTreeMap<(u64, u64, u64, u64), LogRow>,
    traces: BTreeMap<(u64, u64, u64, u64), TraceRow>,
    intervals: HashMap<(u64, String), IntervalSet>,
    factories: HashMap<(u64, String), String>,
    children: HashMap<(u64, String), BTreeMap<alloy_primitives::Address, u64>>,
    rpc_results: HashMap<(u64, String), String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStore for MemoryStore {
    fn insert_blocks(&self, blocks: &[BlockRow]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        for b in blocks {
            inner
                .blocks
                .insert((b.chain_id, b.number, b.hash), b.clone());
        }
        Ok(())
    }

    fn insert_logs(&self, logs: &[LogRow]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        for l in logs {
            inner.logs.insert(
                (l.chain_id, l.block_number, l.transaction_index, l.log_index),
                l.clone(),
            );
        }
        Ok(())
    }

    fn insert_transactions(&self, transactions: &[TransactionRow]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        for t in transactions {
            inner
                .transactions
                .insert((t.chain_id, t.block_number, t.transaction_index), t.clone());
        }
        Ok(())
    }

    fn insert_receipts(&self, receipts: &[TransactionReceiptRow]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        for r in receipts {
            inner
                .receipts
                .insert((r.chain_id, r.block_number, r.transaction_index), r.clone());
        }
        Ok(())
    }

    fn insert_traces(&self, traces: &[TraceRow]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        for t in traces {
            inner.traces.insert(
                (t.chain_id, t.block_number, t.transaction_index, t.trace_index),
                t.clone(),
            );
        }
        Ok(())
    }

    fn insert_interval(
        &self,
        chain_id: u64,
        fragment_id: &str,
        interval: Interval,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        inner
            .intervals
            .entry((chain_id, fragment_id.to_string()))
            .or_default()
            .insert(interval);
        Ok(())
    }

    fn get_intervals(
        &self,
        chain_id: u64,
        fragment_ids: &[String],
    ) -> Result<IntervalSet, SyncError> {
        let inner = self.inner.lock();
        let mut out = IntervalSet::new();
        for id in fragment_ids {
            if let Some(set) = inner.intervals.get(&(chain_id, id.clone())) {
                out = out.union(set);
            }
        }
        Ok(out)
    }

    fn insert_factory(&self, chain_id: u64, factory_id: &str, spec: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        inner
            .factories
            .insert((chain_id, factory_id.to_string()), spec.to_string());
        Ok(())
    }

    fn insert_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
        children: &[ChildAddressRow],
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        let map = inner
            .children
            .entry((chain_id, factory_id.to_string()))
            .or_default();
        for child in children {
            // Keep the earliest observation.
            map.entry(child.address)
                .and_modify(|first| *first = (*first).min(child.block_number))
                .or_insert(child.block_number);
        }
        Ok(())
    }

    fn get_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
    ) -> Result<Vec<ChildAddressRow>, SyncError> {
        let inner = self.inner.lock();
        Ok(inner
            .children
            .get(&(chain_id, factory_id.to_string()))
            .map(|map| {
                map.iter()
                    .map(|(address, block_number)| ChildAddressRow {
                        address: *address,
                        block_number: *block_number,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read_range(&self, chain_id: u64, lo: u64, hi: u64) -> Result<RangeRows, SyncError> {
        let inner = self.inner.lock();
        let mut rows = RangeRows::default();
        rows.blocks = inner
            .blocks
            .range((chain_id, lo, B256::ZERO)..=(chain_id, hi, B256::repeat_byte(0xff)))
            .map(|(_, b)| b.clone())
            .collect();
        rows.transactions = inner
            .transactions
            .range((chain_id, lo, 0)..=(chain_id, hi, u64::MAX))
            .map(|(_, t)| t.clone())
            .collect();
        rows.receipts = inner
            .receipts
            .range((chain_id, lo, 0)..=(chain_id, hi, u64::MAX))
            .map(|(_, r)| r.clone())
            .collect();
        rows.logs = inner
            .logs
            .range((chain_id, lo, 0, 0)..=(chain_id, hi, u64::MAX, u64::MAX))
            .map(|(_, l)| l.clone())
            .collect();
        rows.traces = inner
            .traces
            .range((chain_id, lo, 0, 0)..=(chain_id, hi, u64::MAX, u64::MAX))
            .map(|(_, t)| t.clone())
            .collect();
        Ok(rows)
    }

    fn delete_above(&self, chain_id: u64, block_number: u64) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        inner
            .blocks
            .retain(|(c, n, _), _| *c != chain_id || *n <= block_number);
        inner
            .transactions
            .retain(|(c, n, _), _| *c != chain_id || *n <= block_number);
        inner
            .receipts
            .retain(|(c, n, _), _| *c != chain_id || *n <= block_number);
        inner
            .logs
            .retain(|(c, n, _, _), _| *c != chain_id || *n <= block_number);
        inner
            .traces
            .retain(|(c, n, _, _), _| *c != chain_id || *n <= block_number);
        Ok(())
    }

    fn get_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
    ) -> Result<Option<String>, SyncError> {
        let inner = self.inner.lock();
        Ok(inner
            .rpc_results
            .get(&(chain_id, request_hash.to_string()))
            .cloned())
    }

    fn insert_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
        _block_number: Option<u64>,
        result: &str,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        inner
            .rpc_results
            .insert((chain_id, request_hash.to_string()), result.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    #[test]
    fn interval_inserts_union() {
        let store = MemoryStore::new();
        store.insert_interval(1, "frag", (0, 10)).unwrap();
        store.insert_interval(1, "frag", (11, 20)).unwrap();
        store.insert_interval(1, "other", (50, 60)).unwrap();
        let set = store
            .get_intervals(1, &["frag".into(), "other".into()])
            .unwrap();
        assert_eq!(set.intervals(), &[(0, 20), (50, 60)]);
        // Unknown ids contribute nothing.
        let empty = store.get_intervals(1, &["missing".into()]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn child_addresses_keep_earliest_block() {
        let store = MemoryStore::new();
        let addr = Address::with_last_byte(7);
        store
            .insert_child_addresses(
                1,
                "factory",
                &[ChildAddressRow {
                    address: addr,
                    block_number: 100,
                }],
            )
            .unwrap();
        store
            .insert_child_addresses(
                1,
                "factory",
                &[ChildAddressRow {
                    address: addr,
                    block_number: 90,
                }],
            )
            .unwrap();
        let children = store.get_child_addresses(1, "factory").unwrap();
        assert_eq!(children, vec![ChildAddressRow { address: addr, block_number: 90 }]);
    }
}
