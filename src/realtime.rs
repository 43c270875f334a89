//! Realtime sync driver.
//!
//! Once historical sync reaches the finalized block, this driver follows the
//! tip: it polls for new blocks, keeps a parent-hash-linked local chain of
//! unfinalized blocks, ingests matching data block by block, advances the
//! finalized boundary, and walks reorgs back to a common ancestor. A reorg
//! that would cross the finalized boundary is unrecoverable and stops the
//! chain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::{Address, Bloom, BloomInput, B256};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain::ChainConfig;
use crate::checkpoint::Checkpoint;
use crate::errors::SyncError;
use crate::events::{assemble_range, decode_events, ChildAddressMaps};
use crate::filter::{log_filter_matches, AddressSpec, Filter, TopicSpec};
use crate::fragments::{decompose, factory_id};
use crate::historical::SyncPage;
use crate::merge::ChainStreamItem;
use crate::progress::LightBlock;
use crate::rpc::{BlockData, RequestQueue};
use crate::source::Source;
use crate::store::{ChildAddressRow, LogRow, RangeRows, SyncStore};

/// Parent-hash-linked blocks above the finalized boundary, oldest first.
#[derive(Debug, Clone)]
pub struct LocalChain {
    finalized: LightBlock,
    blocks: VecDeque<LightBlock>,
}

impl LocalChain {
    pub fn new(finalized: LightBlock) -> Self {
        Self {
            finalized,
            blocks: VecDeque::new(),
        }
    }

    pub fn finalized(&self) -> &LightBlock {
        &self.finalized
    }

    /// Tip of the unfinalized chain, or the finalized block when empty.
    pub fn tip(&self) -> LightBlock {
        self.blocks.back().copied().unwrap_or(self.finalized)
    }

    pub fn blocks(&self) -> &VecDeque<LightBlock> {
        &self.blocks
    }

    /// Append a block. Linkage is a construction invariant; breaking it is a
    /// programming error in the state machine.
    pub fn push(&mut self, block: LightBlock) {
        let tip = self.tip();
        assert_eq!(
            block.parent_hash, tip.hash,
            "local chain linkage broken at block {}",
            block.number
        );
        assert_eq!(
            block.number,
            tip.number + 1,
            "local chain numbering broken at block {}",
            block.number
        );
        self.blocks.push_back(block);
    }

    /// Drop the tip, returning it.
    pub fn pop(&mut self) -> Option<LightBlock> {
        self.blocks.pop_back()
    }

    /// Evict blocks now at or below the new finalized boundary.
    pub fn finalize(&mut self, new_finalized: LightBlock) {
        while self
            .blocks
            .front()
            .map(|b| b.number <= new_finalized.number)
            .unwrap_or(false)
        {
            self.blocks.pop_front();
        }
        self.finalized = new_finalized;
    }
}

pub struct RealtimeSync {
    chain: ChainConfig,
    sources: Arc<Vec<Source>>,
    store: Arc<dyn SyncStore>,
    rpc: RequestQueue,
    children: Arc<RwLock<ChildAddressMaps>>,
    killed: Arc<AtomicBool>,
    local: LocalChain,
    /// Blocks fetched but not yet applied, in ascending order.
    queue: VecDeque<BlockData>,
}

impl RealtimeSync {
    pub fn new(
        chain: ChainConfig,
        sources: Arc<Vec<Source>>,
        store: Arc<dyn SyncStore>,
        rpc: RequestQueue,
        children: Arc<RwLock<ChildAddressMaps>>,
        killed: Arc<AtomicBool>,
        finalized: LightBlock,
    ) -> Self {
        Self {
            chain,
            sources,
            store,
            rpc,
            children,
            killed,
            local: LocalChain::new(finalized),
            queue: VecDeque::new(),
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Follow the tip until killed or a fatal error.
    pub async fn run(&mut self, tx: &mpsc::Sender<ChainStreamItem>) -> Result<(), SyncError> {
        info!(
            chain_id = self.chain.chain_id,
            finalized = self.local.finalized().number,
            "starting realtime sync"
        );
        let mut poll = tokio::time::interval(self.chain.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if self.is_killed() {
                return Ok(());
            }
            poll.tick().await;
            if self.is_killed() {
                return Ok(());
            }
            self.tick(tx).await?;
        }
    }

    pub(crate) async fn tick(
        &mut self,
        tx: &mpsc::Sender<ChainStreamItem>,
    ) -> Result<(), SyncError> {
        let latest = self
            .rpc
            .block_by_number(None, true)
            .await?
            .ok_or_else(|| SyncError::MalformedResponse("node has no latest block".into()))?;
        let latest_number = latest.block.number;
        self.queue.push_back(latest);
        self.drain_queue(tx).await?;
        self.maybe_advance_finality(latest_number).await?;
        Ok(())
    }

    async fn drain_queue(&mut self, tx: &mpsc::Sender<ChainStreamItem>) -> Result<(), SyncError> {
        while let Some(block) = self.queue.pop_front() {
            if self.is_killed() {
                return Ok(());
            }
            let tip = self.local.tip();
            if block.block.hash == tip.hash {
                continue;
            }
            if block.block.number <= tip.number {
                // Same-height or shorter chain with a different tip hash.
                self.handle_reorg(block, tx).await?;
                continue;
            }
            if block.block.number > tip.number + 1 {
                // Fill the gap, then retry this block after the backfill.
                let mut fetched = Vec::new();
                for number in (tip.number + 1)..block.block.number {
                    let data = self.rpc.block_by_number(Some(number), true).await?.ok_or_else(
                        || SyncError::MalformedResponse(format!("missing block {number}")),
                    )?;
                    fetched.push(data);
                }
                fetched.push(block);
                for data in fetched.into_iter().rev() {
                    self.queue.push_front(data);
                }
                continue;
            }
            if block.block.parent_hash != tip.hash {
                self.handle_reorg(block, tx).await?;
                continue;
            }
            self.ingest(block, tx).await?;
        }
        Ok(())
    }

    fn light(data: &BlockData) -> LightBlock {
        LightBlock {
            number: data.block.number,
            hash: data.block.hash,
            parent_hash: data.block.parent_hash,
            timestamp: data.block.timestamp,
        }
    }

    fn has_factories(&self) -> bool {
        self.sources
            .iter()
            .any(|s| !s.filter.factories().is_empty())
    }

    fn has_trace_sources(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s.filter, Filter::Trace(_) | Filter::Transfer(_)))
    }

    fn has_transaction_sources(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s.filter, Filter::Transaction(_)))
    }

    fn wants_any_receipt(&self) -> bool {
        self.sources
            .iter()
            .any(|s| crate::filter::should_get_transaction_receipt(&s.filter))
    }

    /// Union of concrete topic0 values across log sources and factory event
    /// selectors; `None` if any log filter is unscoped on topic0.
    fn topic0_union(&self) -> Option<Vec<B256>> {
        let mut topics = Vec::new();
        for source in self.sources.iter() {
            match &source.filter {
                Filter::Log(f) => match &f.topic0 {
                    TopicSpec::Any => return None,
                    spec => topics.extend(spec.values()),
                },
                _ => {}
            }
            for factory in source.filter.factories() {
                topics.push(factory.event_selector);
            }
        }
        topics.sort();
        topics.dedup();
        if topics.is_empty() {
            None
        } else {
            Some(topics)
        }
    }

    /// Bloom prefilter: true when the per-block log request can be skipped
    /// entirely.
    fn can_skip_logs(&self, bloom: &Bloom) -> bool {
        if self.has_factories() {
            return false;
        }
        let log_filters: Vec<_> = self
            .sources
            .iter()
            .filter_map(|s| match &s.filter {
                Filter::Log(f) => Some(f),
                _ => None,
            })
            .collect();
        if log_filters.is_empty() {
            return true;
        }
        if bloom.is_zero() {
            return true;
        }
        log_filters.iter().all(|f| {
            let addresses: Vec<Address> = match &f.address {
                AddressSpec::Single(a) => vec![*a],
                AddressSpec::Set(set) => set.iter().copied().collect(),
                _ => Vec::new(),
            };
            if !addresses.is_empty() {
                return addresses
                    .iter()
                    .all(|a| !bloom.contains_input(BloomInput::Raw(a.as_slice())));
            }
            let topics = f.topic0.values();
            if !topics.is_empty() {
                return topics
                    .iter()
                    .all(|t| !bloom.contains_input(BloomInput::Raw(t.as_slice())));
            }
            false
        })
    }

    /// Logs of this block that any log source matches statically, with
    /// factory children discovered along the way.
    fn match_block_logs(&self, logs: Vec<LogRow>) -> Result<Vec<LogRow>, SyncError> {
        // Factory discovery first so children emitted in this very block are
        // visible to its own later logs.
        for source in self.sources.iter() {
            for factory in source.filter.factories() {
                let id = factory_id(factory);
                let mut rows = Vec::new();
                for log in &logs {
                    if log.address == factory.address
                        && log.topic0 == Some(factory.event_selector)
                    {
                        if let Some(address) = factory.child_location.extract(log) {
                            rows.push(ChildAddressRow {
                                address,
                                block_number: log.block_number,
                            });
                        }
                    }
                }
                if rows.is_empty() {
                    continue;
                }
                self.store
                    .insert_child_addresses(self.chain.chain_id, &id, &rows)?;
                let mut children = self.children.write();
                let map = children.entry(id).or_default();
                for row in rows {
                    map.entry(row.address)
                        .and_modify(|b| *b = (*b).min(row.block_number))
                        .or_insert(row.block_number);
                }
            }
        }

        let children = self.children.read();
        let matched = logs
            .into_iter()
            .filter(|log| {
                self.sources.iter().any(|source| match &source.filter {
                    Filter::Log(f) => {
                        if !log_filter_matches(f, log) {
                            return false;
                        }
                        match &f.address {
                            AddressSpec::Factory(factory) => children
                                .get(&factory_id(factory))
                                .map(|m| m.contains_key(&log.address))
                                .unwrap_or(false),
                            _ => true,
                        }
                    }
                    _ => false,
                })
            })
            .collect();
        Ok(matched)
    }

    /// Apply one linking block: fetch its data, persist, extend the local
    /// chain, emit the block's events and checkpoint.
    async fn ingest(
        &mut self,
        data: BlockData,
        tx: &mpsc::Sender<ChainStreamItem>,
    ) -> Result<(), SyncError> {
        let light = Self::light(&data);
        debug!(
            chain_id = self.chain.chain_id,
            number = light.number,
            hash = %light.hash,
            "ingesting block"
        );

        let matched_logs = if self.can_skip_logs(&data.block.logs_bloom) {
            Vec::new()
        } else {
            let logs = self
                .rpc
                .logs_by_hash(data.block.hash, None, self.topic0_union())
                .await?;
            self.match_block_logs(logs)?
        };

        let traces = if self.has_trace_sources() {
            self.rpc.trace_block(data.block.number).await?
        } else {
            Vec::new()
        };

        // Keep transactions referenced by matched logs or traces, or all of
        // them when transaction sources exist.
        let log_tx_hashes: Vec<B256> =
            matched_logs.iter().filter_map(|l| l.transaction_hash).collect();
        let trace_tx_indices: Vec<u64> = traces.iter().map(|t| t.transaction_index).collect();
        let transactions: Vec<_> = data
            .transactions
            .iter()
            .filter(|t| {
                self.has_transaction_sources()
                    || log_tx_hashes.contains(&t.hash)
                    || trace_tx_indices.contains(&t.transaction_index)
            })
            .cloned()
            .collect();

        let mut receipts = Vec::new();
        if self.wants_any_receipt() {
            for tx_row in &transactions {
                if let Some(receipt) = self.rpc.transaction_receipt(tx_row.hash).await? {
                    receipts.push(receipt);
                }
            }
        }

        self.store.insert_blocks(std::slice::from_ref(&data.block))?;
        self.store.insert_transactions(&transactions)?;
        self.store.insert_logs(&matched_logs)?;
        self.store.insert_traces(&traces)?;
        self.store.insert_receipts(&receipts)?;

        let rows = RangeRows {
            blocks: vec![data.block.clone()],
            transactions,
            receipts,
            logs: matched_logs,
            traces,
        };
        let children_snapshot = self.children.read().clone();
        let raw = assemble_range(&self.sources, &children_snapshot, &rows);
        let events = decode_events(&self.sources, raw);

        self.local.push(light);
        let page = SyncPage {
            chain_id: self.chain.chain_id,
            events,
            checkpoint: Checkpoint::block_bound(
                light.timestamp,
                self.chain.chain_id,
                light.number,
            )
            .encode(),
            block_range: (light.number, light.number),
        };
        if tx.send(ChainStreamItem::Page(page)).await.is_err() {
            return Err(SyncError::Killed);
        }
        Ok(())
    }

    /// Walk a mismatching probe back to the common ancestor, evict the
    /// abandoned branch, and resume from the probe.
    async fn handle_reorg(
        &mut self,
        probe: BlockData,
        tx: &mpsc::Sender<ChainStreamItem>,
    ) -> Result<(), SyncError> {
        warn!(
            chain_id = self.chain.chain_id,
            probe_number = probe.block.number,
            probe_hash = %probe.block.hash,
            "reorg detected"
        );
        let mut remote = probe;
        let ancestor = loop {
            // Drop local blocks the probe's branch cannot contain.
            while self
                .local
                .blocks()
                .back()
                .map(|b| b.number >= remote.block.number)
                .unwrap_or(false)
            {
                self.local.pop();
            }
            let tip = self.local.tip();
            if tip.hash == remote.block.parent_hash && tip.number + 1 == remote.block.number {
                break tip;
            }
            if remote.block.number <= self.local.finalized().number + 1 {
                // The remote branch diverges at or below the finalized block.
                return Err(SyncError::UnrecoverableReorg {
                    chain_id: self.chain.chain_id,
                    finalized: self.local.finalized().number,
                });
            }
            remote = self
                .rpc
                .block_by_hash(remote.block.parent_hash)
                .await?
                .ok_or_else(|| {
                    SyncError::MalformedResponse("reorg parent block missing".into())
                })?;
        };

        self.store.delete_above(self.chain.chain_id, ancestor.number)?;
        info!(
            chain_id = self.chain.chain_id,
            ancestor = ancestor.number,
            "reorg reconciled"
        );
        let safe_checkpoint =
            Checkpoint::block_bound(ancestor.timestamp, self.chain.chain_id, ancestor.number)
                .encode();
        if tx
            .send(ChainStreamItem::Reorg { safe_checkpoint })
            .await
            .is_err()
        {
            return Err(SyncError::Killed);
        }

        // Resume normal ingestion from the surviving remote block.
        self.queue.clear();
        self.queue.push_back(remote);
        Ok(())
    }

    /// Nominate a new finalized block once the tip is far enough ahead, with
    /// a soft reconciliation of the newly finalized span.
    async fn maybe_advance_finality(&mut self, latest_number: u64) -> Result<(), SyncError> {
        let finalized = *self.local.finalized();
        if latest_number < finalized.number + 2 * self.chain.finality_block_count {
            return Ok(());
        }
        let target = latest_number - self.chain.finality_block_count;
        let Some(new_finalized) = self
            .local
            .blocks()
            .iter()
            .rev()
            .find(|b| b.number <= target)
            .copied()
        else {
            return Ok(());
        };
        if new_finalized.number <= finalized.number {
            return Ok(());
        }

        // Soft reconciliation: ask the node again for the span and compare to
        // what we stored; disagreement is logged, not fatal.
        let remote_logs = self
            .rpc
            .logs_by_range(
                finalized.number + 1,
                new_finalized.number,
                None,
                self.topic0_union(),
            )
            .await?;
        let remote_matched: Vec<(B256, u64)> = remote_logs
            .iter()
            .filter(|log| {
                self.sources.iter().any(|source| match &source.filter {
                    Filter::Log(f) => log_filter_matches(f, log),
                    _ => false,
                })
            })
            .map(|l| (l.block_hash, l.log_index))
            .collect();
        let stored = self
            .store
            .read_range(self.chain.chain_id, finalized.number + 1, new_finalized.number)?;
        let stored_keys: Vec<(B256, u64)> = stored
            .logs
            .iter()
            .map(|l| (l.block_hash, l.log_index))
            .collect();
        for key in &remote_matched {
            if !stored_keys.contains(key) {
                warn!(
                    chain_id = self.chain.chain_id,
                    block_hash = %key.0,
                    log_index = key.1,
                    "finalized span has a log missing from local data"
                );
            }
        }
        for key in &stored_keys {
            if !remote_matched.contains(key) {
                warn!(
                    chain_id = self.chain.chain_id,
                    block_hash = %key.0,
                    log_index = key.1,
                    "local data holds a log the finalized span no longer reports"
                );
            }
        }

        // The span is now final: record it under every filter fragment.
        let mut filters: Vec<Filter> = Vec::new();
        for source in self.sources.iter() {
            if !filters.contains(&source.filter) {
                filters.push(source.filter.clone());
            }
        }
        for filter in &filters {
            for spec in decompose(filter) {
                self.store.insert_interval(
                    self.chain.chain_id,
                    &spec.fragment.id(),
                    (finalized.number + 1, new_finalized.number),
                )?;
            }
        }

        info!(
            chain_id = self.chain.chain_id,
            from = finalized.number,
            to = new_finalized.number,
            "advanced finalized block"
        );
        self.local.finalize(new_finalized);
        Ok(())
    }
}
