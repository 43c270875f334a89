//! Historical sync driver.
//!
//! Per chain: work out which block ranges each filter still needs (via the
//! fragment interval cache), fill the gaps over RPC, persist everything, then
//! read the window back in execution order and page decoded events downstream.
//! A fully cached re-run computes empty gaps everywhere and issues no RPC
//! requests and no store writes at all.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain::ChainConfig;
use crate::checkpoint::{Checkpoint, MAX_TIMESTAMP};
use crate::errors::SyncError;
use crate::events::{assemble_range, decode_events, ChildAddressMaps, Event};
use crate::filter::{AddressSpec, Factory, Filter, LogFilter, TopicSpec};
use crate::fragments::{decompose, factory_fragment, factory_id, recover_filter, Fragment};
use crate::intervals::IntervalSet;
use crate::merge::ChainStreamItem;
use crate::progress::{LightBlock, SyncProgress};
use crate::rpc::{chunk_range, BlockData, RequestQueue};
use crate::source::Source;
use crate::store::{ChildAddressRow, SyncStore};

/// Blocks processed per main-loop window.
const WINDOW_SIZE: u64 = 5_000;

/// One page of the historical event stream.
#[derive(Debug, Clone)]
pub struct SyncPage {
    pub chain_id: u64,
    /// Checkpoint-ordered events.
    pub events: Vec<Event>,
    /// Upper bound: every checkpoint at or below this has been fully
    /// delivered for this chain.
    pub checkpoint: String,
    pub block_range: (u64, u64),
}

/// How the historical phase finished.
#[derive(Debug, Clone)]
pub enum HistoricalOutcome {
    /// Caught up with the finalized block; realtime takes over.
    ReachedFinalized,
    /// The user-declared end block was reached; the chain is done.
    Ended,
}

pub struct HistoricalSync {
    chain: ChainConfig,
    sources: Arc<Vec<Source>>,
    store: Arc<dyn SyncStore>,
    rpc: RequestQueue,
    children: Arc<RwLock<ChildAddressMaps>>,
    killed: Arc<AtomicBool>,
    chain_id_checked: AtomicBool,
}

impl HistoricalSync {
    pub fn new(
        chain: ChainConfig,
        sources: Arc<Vec<Source>>,
        store: Arc<dyn SyncStore>,
        rpc: RequestQueue,
        children: Arc<RwLock<ChildAddressMaps>>,
        killed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain,
            sources,
            store,
            rpc,
            children,
            killed,
            chain_id_checked: AtomicBool::new(false),
        }
    }

    fn check_killed(&self) -> Result<(), SyncError> {
        if self.killed.load(Ordering::SeqCst) {
            Err(SyncError::Killed)
        } else {
            Ok(())
        }
    }

    /// Distinct filters across sources; several sources may share one.
    fn distinct_filters(&self) -> Vec<Filter> {
        let mut filters: Vec<Filter> = Vec::new();
        for source in self.sources.iter() {
            if !filters.contains(&source.filter) {
                filters.push(source.filter.clone());
            }
        }
        filters
    }

    fn distinct_factories(&self, filters: &[Filter]) -> Vec<Factory> {
        let mut factories: Vec<Factory> = Vec::new();
        for filter in filters {
            for factory in filter.factories() {
                if !factories.contains(factory) {
                    factories.push(factory.clone());
                }
            }
        }
        factories
    }

    /// Verify the remote chain id against configuration before the first
    /// fetch. Deferred so that fully cached runs stay offline.
    async fn ensure_chain_id(&self) -> Result<(), SyncError> {
        if self.chain_id_checked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let remote = self.rpc.chain_id().await?;
        if remote != self.chain.chain_id {
            warn!(
                configured = self.chain.chain_id,
                remote, "remote chain id differs from configuration"
            );
        }
        Ok(())
    }

    /// Run historical sync to `min(finalized, end)`, paging events into `tx`.
    pub async fn run(
        &self,
        finalized: LightBlock,
        tx: &mpsc::Sender<ChainStreamItem>,
    ) -> Result<HistoricalOutcome, SyncError> {
        let filters = self.distinct_filters();
        if filters.is_empty() {
            return Err(SyncError::NoSources(self.chain.chain_id));
        }
        let factories = self.distinct_factories(&filters);

        // Seed the in-memory child maps from the store.
        {
            let mut children = self.children.write();
            for factory in &factories {
                let id = factory_id(factory);
                let rows = self.store.get_child_addresses(self.chain.chain_id, &id)?;
                let map = children.entry(id).or_default();
                for row in rows {
                    map.entry(row.address)
                        .and_modify(|b| *b = (*b).min(row.block_number))
                        .or_insert(row.block_number);
                }
            }
        }

        let start_number = filters
            .iter()
            .map(|f| f.from_block())
            .chain(factories.iter().map(|f| f.from_block))
            .min()
            .unwrap_or(0);
        let start = self.light_block_from_store(start_number)?.unwrap_or(LightBlock {
            number: start_number,
            hash: B256::ZERO,
            parent_hash: B256::ZERO,
            timestamp: 0,
        });

        // An end block exists only if every filter is bounded.
        let end = if filters.iter().all(|f| f.to_block().is_some()) {
            let end_number = filters.iter().filter_map(|f| f.to_block()).max().unwrap_or(0);
            if end_number > finalized.number {
                // The user asked for blocks that do not exist yet.
                Some(LightBlock {
                    number: end_number,
                    hash: B256::ZERO,
                    parent_hash: B256::ZERO,
                    timestamp: MAX_TIMESTAMP,
                })
            } else {
                Some(
                    self.light_block_from_store(end_number)?
                        .unwrap_or(LightBlock {
                            number: end_number,
                            hash: B256::ZERO,
                            parent_hash: B256::ZERO,
                            timestamp: MAX_TIMESTAMP,
                        }),
                )
            }
        } else {
            None
        };

        let mut progress = SyncProgress::new(
            LightBlock {
                number: start.number.min(finalized.number),
                ..start
            },
            finalized,
            end,
        );
        let target = progress.target_number();

        if start.number > target {
            info!(
                chain_id = self.chain.chain_id,
                start = start.number,
                target,
                "nothing to sync historically"
            );
            return Ok(if progress.end.as_ref().map(|e| e.number <= target).unwrap_or(false) {
                HistoricalOutcome::Ended
            } else {
                HistoricalOutcome::ReachedFinalized
            });
        }

        info!(
            chain_id = self.chain.chain_id,
            start = start.number,
            target,
            "starting historical sync"
        );
        let progress_bar = self.backfill_progress_bar(target - start.number + 1);

        let mut last_timestamp = start.timestamp;
        let mut next = start.number;
        while next <= target {
            self.check_killed()?;
            let window = (next, next.saturating_add(WINDOW_SIZE - 1).min(target));

            // Factories first: filters depending on their children are only
            // valid once the children for this window are known.
            for factory in &factories {
                self.sync_factory_window(factory, window).await?;
            }

            for filter in &filters {
                self.sync_filter_window(filter, window).await?;
            }

            // Read the window back in execution order and hand it to the
            // assembler.
            let rows = self.store.read_range(self.chain.chain_id, window.0, window.1)?;
            if let Some(block) = rows.blocks.last() {
                last_timestamp = last_timestamp.max(block.timestamp);
            }
            let children_snapshot = self.children.read().clone();
            let raw = assemble_range(&self.sources, &children_snapshot, &rows);
            let events = decode_events(&self.sources, raw);

            let window_bound =
                Checkpoint::block_bound(last_timestamp, self.chain.chain_id, window.1).encode();
            self.emit_pages(tx, events, window, window_bound).await?;

            progress.current = Some(LightBlock {
                number: window.1,
                hash: rows.blocks.last().map(|b| b.hash).unwrap_or(B256::ZERO),
                parent_hash: rows
                    .blocks
                    .last()
                    .map(|b| b.parent_hash)
                    .unwrap_or(B256::ZERO),
                timestamp: last_timestamp,
            });
            progress_bar.inc(window.1 - window.0 + 1);
            next = window.1 + 1;
        }
        progress_bar.finish_and_clear();

        info!(
            chain_id = self.chain.chain_id,
            target, "historical sync complete"
        );
        Ok(if progress.is_ended() {
            HistoricalOutcome::Ended
        } else {
            HistoricalOutcome::ReachedFinalized
        })
    }

    /// Backfill progress over the historical block range, labeled per chain
    /// and counted in blocks.
    fn backfill_progress_bar(&self, total_blocks: u64) -> ProgressBar {
        let pb = ProgressBar::new(total_blocks);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{elapsed_precise}} {} backfill {{bar:40.cyan/blue}} {{pos}}/{{len}} blocks",
                    self.chain.display_name()
                ))
                .unwrap()
                .progress_chars("##-"),
        );
        pb.tick();
        pb
    }

    async fn emit_pages(
        &self,
        tx: &mpsc::Sender<ChainStreamItem>,
        events: Vec<Event>,
        window: (u64, u64),
        window_bound: String,
    ) -> Result<(), SyncError> {
        let limit = self.chain.events_per_page.max(1);
        let total = events.len();
        let mut pages: Vec<Vec<Event>> = Vec::new();
        let mut events = events;
        while events.len() > limit {
            let rest = events.split_off(limit);
            pages.push(std::mem::replace(&mut events, rest));
        }
        pages.push(events);

        let page_count = pages.len();
        for (i, page) in pages.into_iter().enumerate() {
            let checkpoint = if i + 1 == page_count {
                window_bound.clone()
            } else {
                page.last()
                    .map(|e| e.id.clone())
                    .unwrap_or_else(|| window_bound.clone())
            };
            let page = SyncPage {
                chain_id: self.chain.chain_id,
                events: page,
                checkpoint,
                block_range: window,
            };
            if tx.send(ChainStreamItem::Page(page)).await.is_err() {
                // Consumer went away; stop producing.
                return Err(SyncError::Killed);
            }
        }
        debug!(
            chain_id = self.chain.chain_id,
            window_lo = window.0,
            window_hi = window.1,
            events = total,
            "emitted historical window"
        );
        Ok(())
    }

    fn light_block_from_store(&self, number: u64) -> Result<Option<LightBlock>, SyncError> {
        let rows = self.store.read_range(self.chain.chain_id, number, number)?;
        Ok(rows.blocks.first().map(|b| LightBlock {
            number: b.number,
            hash: b.hash,
            parent_hash: b.parent_hash,
            timestamp: b.timestamp,
        }))
    }

    /// Fill one factory's gap in `window`: sweep its creation logs, record
    /// child addresses with their first-seen block.
    async fn sync_factory_window(
        &self,
        factory: &Factory,
        window: (u64, u64),
    ) -> Result<(), SyncError> {
        let spec = factory_fragment(factory);
        let needed = IntervalSet::single(window.0, window.1).intersection(&IntervalSet::single(
            factory.from_block,
            factory.to_block.unwrap_or(u64::MAX),
        ));
        if needed.is_empty() {
            return Ok(());
        }
        let cached = self
            .store
            .get_intervals(self.chain.chain_id, &spec.adjacent_ids)?;
        let missing = needed.difference(&cached);
        if missing.is_empty() {
            return Ok(());
        }
        self.ensure_chain_id().await?;

        let id = spec.fragment.id();
        self.store.insert_factory(
            self.chain.chain_id,
            &id,
            &serde_json::to_string(factory)?,
        )?;

        for &(lo, hi) in missing.intervals() {
            let logs = self
                .fetch_logs_chunked(
                    lo,
                    hi,
                    Some(vec![factory.address]),
                    Some(vec![factory.event_selector]),
                )
                .await?;
            let mut rows = Vec::new();
            for log in &logs {
                if log.topic0 != Some(factory.event_selector) {
                    continue;
                }
                let Some(address) = factory.child_location.extract(log) else {
                    debug!(chain_id = self.chain.chain_id, "factory log without a child address");
                    continue;
                };
                rows.push(ChildAddressRow {
                    address,
                    block_number: log.block_number,
                });
            }
            if !rows.is_empty() {
                self.store
                    .insert_child_addresses(self.chain.chain_id, &id, &rows)?;
                let mut children = self.children.write();
                let map = children.entry(id.clone()).or_default();
                for row in rows {
                    map.entry(row.address)
                        .and_modify(|b| *b = (*b).min(row.block_number))
                        .or_insert(row.block_number);
                }
            }
        }
        for &interval in needed.intervals() {
            self.store
                .insert_interval(self.chain.chain_id, &id, interval)?;
        }
        Ok(())
    }

    /// Fill one filter's gaps in `window`.
    ///
    /// Fragments with identical missing coverage are grouped and recovered
    /// into a narrower filter, so values that are already cached are not
    /// fetched again.
    async fn sync_filter_window(
        &self,
        filter: &Filter,
        window: (u64, u64),
    ) -> Result<(), SyncError> {
        let specs = decompose(filter);
        let needed = IntervalSet::single(window.0, window.1).intersection(&IntervalSet::single(
            filter.from_block(),
            filter.to_block().unwrap_or(u64::MAX),
        ));
        if needed.is_empty() {
            return Ok(());
        }

        let mut groups: Vec<(IntervalSet, Vec<Fragment>)> = Vec::new();
        for spec in &specs {
            let cached = self
                .store
                .get_intervals(self.chain.chain_id, &spec.adjacent_ids)?;
            let missing = needed.difference(&cached);
            match groups.iter_mut().find(|(m, _)| *m == missing) {
                Some((_, frags)) => frags.push(spec.fragment.clone()),
                None => groups.push((missing, vec![spec.fragment.clone()])),
            }
        }

        for (missing, frags) in &groups {
            if missing.is_empty() {
                continue;
            }
            self.ensure_chain_id().await?;
            let recovered = recover_filter(filter, frags);
            debug!(
                chain_id = self.chain.chain_id,
                gaps = ?missing.intervals(),
                "fetching filter gap"
            );
            match &recovered {
                Filter::Log(f) => self.fetch_log_gap(f, missing).await?,
                Filter::Transaction(_) => self.fetch_block_gap(missing, true, true).await?,
                Filter::Trace(_) | Filter::Transfer(_) => {
                    let wants_receipt =
                        crate::filter::should_get_transaction_receipt(&recovered);
                    self.fetch_trace_gap(missing, wants_receipt).await?
                }
                Filter::Block(f) => self.fetch_block_filter_gap(f, missing).await?,
            }
        }

        // Everything the window needed is now present; record coverage under
        // each exact fragment id.
        if groups.iter().any(|(m, _)| !m.is_empty()) {
            for spec in &specs {
                for &interval in needed.intervals() {
                    self.store
                        .insert_interval(self.chain.chain_id, &spec.fragment.id(), interval)?;
                }
            }
        }
        Ok(())
    }

    async fn fetch_logs_chunked(
        &self,
        lo: u64,
        hi: u64,
        addresses: Option<Vec<Address>>,
        topic0: Option<Vec<B256>>,
    ) -> Result<Vec<crate::store::LogRow>, SyncError> {
        let chunks = chunk_range(lo, hi, self.chain.blocks_per_log_request);
        let results: Vec<Result<Vec<crate::store::LogRow>, SyncError>> = stream::iter(chunks)
            .map(|(from, to)| {
                let rpc = self.rpc.clone();
                let addresses = addresses.clone();
                let topic0 = topic0.clone();
                async move { rpc.logs_by_range(from, to, addresses, topic0).await }
            })
            .buffer_unordered(self.chain.max_rpc_concurrency)
            .collect()
            .await;
        let mut logs = Vec::new();
        for result in results {
            logs.extend(result?);
        }
        // Fan-out may complete out of order; rows within a block keep their
        // onchain order, so sorting by position restores the full order.
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    async fn fetch_blocks_buffered(
        &self,
        numbers: Vec<u64>,
        full: bool,
    ) -> Result<Vec<BlockData>, SyncError> {
        let results: Vec<Result<Option<BlockData>, SyncError>> = stream::iter(numbers)
            .map(|number| {
                let rpc = self.rpc.clone();
                async move { rpc.block_by_number(Some(number), full).await }
            })
            .buffer_unordered(self.chain.max_rpc_concurrency)
            .collect()
            .await;
        let mut blocks = Vec::new();
        for result in results {
            let data = result?.ok_or_else(|| {
                SyncError::MalformedResponse("historical block missing from node".into())
            })?;
            blocks.push(data);
        }
        blocks.sort_by_key(|b| b.block.number);
        Ok(blocks)
    }

    async fn fetch_receipts(&self, hashes: Vec<B256>) -> Result<(), SyncError> {
        let results: Vec<Result<_, SyncError>> = stream::iter(hashes)
            .map(|hash| {
                let rpc = self.rpc.clone();
                async move { rpc.transaction_receipt(hash).await }
            })
            .buffer_unordered(self.chain.max_rpc_concurrency)
            .collect()
            .await;
        let mut receipts = Vec::new();
        for result in results {
            if let Some(receipt) = result? {
                receipts.push(receipt);
            }
        }
        if !receipts.is_empty() {
            self.store.insert_receipts(&receipts)?;
        }
        Ok(())
    }

    /// Log filter gap: `eth_getLogs` scoped to the filter's addresses and
    /// topic0 values, then the blocks and transactions the logs sit in.
    async fn fetch_log_gap(
        &self,
        filter: &LogFilter,
        missing: &IntervalSet,
    ) -> Result<(), SyncError> {
        let addresses = match &filter.address {
            AddressSpec::Any => None,
            AddressSpec::Single(a) => Some(vec![*a]),
            AddressSpec::Set(set) => Some(set.iter().copied().collect()),
            AddressSpec::Factory(factory) => {
                let children = self.children.read();
                let known: Vec<Address> = children
                    .get(&factory_id(factory))
                    .map(|m| m.keys().copied().collect())
                    .unwrap_or_default();
                if known.is_empty() {
                    // No children discovered yet; nothing can match.
                    return Ok(());
                }
                Some(known)
            }
        };
        let topic0 = match &filter.topic0 {
            TopicSpec::Any => None,
            spec => Some(spec.values()),
        };
        let wants_receipt = crate::filter::should_get_transaction_receipt(&Filter::Log(
            filter.clone(),
        ));

        for &(lo, hi) in missing.intervals() {
            self.check_killed()?;
            let logs = self
                .fetch_logs_chunked(lo, hi, addresses.clone(), topic0.clone())
                .await?;
            if logs.is_empty() {
                continue;
            }
            self.store.insert_logs(&logs)?;

            let block_numbers: Vec<u64> = {
                let mut numbers: Vec<u64> = logs.iter().map(|l| l.block_number).collect();
                numbers.sort_unstable();
                numbers.dedup();
                numbers
            };
            let tx_hashes: HashSet<B256> =
                logs.iter().filter_map(|l| l.transaction_hash).collect();

            let blocks = self.fetch_blocks_buffered(block_numbers, true).await?;
            let mut block_rows = Vec::new();
            let mut tx_rows = Vec::new();
            for data in blocks {
                block_rows.push(data.block.clone());
                for tx in data.transactions {
                    if tx_hashes.contains(&tx.hash) {
                        tx_rows.push(tx);
                    }
                }
            }
            self.store.insert_blocks(&block_rows)?;
            self.store.insert_transactions(&tx_rows)?;

            if wants_receipt {
                self.fetch_receipts(tx_hashes.into_iter().collect()).await?;
            }
        }
        Ok(())
    }

    /// Transaction filter gap: enumerate every block in the gap with its full
    /// transactions; receipts always, for revert status.
    async fn fetch_block_gap(
        &self,
        missing: &IntervalSet,
        with_transactions: bool,
        with_receipts: bool,
    ) -> Result<(), SyncError> {
        for &(lo, hi) in missing.intervals() {
            self.check_killed()?;
            let numbers: Vec<u64> = (lo..=hi).collect();
            let blocks = self.fetch_blocks_buffered(numbers, with_transactions).await?;
            let mut block_rows = Vec::new();
            let mut tx_rows = Vec::new();
            let mut tx_hashes = Vec::new();
            for data in blocks {
                block_rows.push(data.block.clone());
                for tx in data.transactions {
                    tx_hashes.push(tx.hash);
                    tx_rows.push(tx);
                }
            }
            self.store.insert_blocks(&block_rows)?;
            if with_transactions {
                self.store.insert_transactions(&tx_rows)?;
            }
            if with_receipts {
                self.fetch_receipts(tx_hashes).await?;
            }
        }
        Ok(())
    }

    /// Trace/transfer filter gap: the call tracer per block, plus the blocks
    /// and transactions to anchor the traces.
    async fn fetch_trace_gap(
        &self,
        missing: &IntervalSet,
        wants_receipt: bool,
    ) -> Result<(), SyncError> {
        for &(lo, hi) in missing.intervals() {
            self.check_killed()?;
            let numbers: Vec<u64> = (lo..=hi).collect();
            let trace_results: Vec<Result<_, SyncError>> = stream::iter(numbers.clone())
                .map(|number| {
                    let rpc = self.rpc.clone();
                    async move { rpc.trace_block(number).await }
                })
                .buffer_unordered(self.chain.max_rpc_concurrency)
                .collect()
                .await;
            let mut traces = Vec::new();
            for result in trace_results {
                traces.extend(result?);
            }
            traces.sort_by_key(|t| (t.block_number, t.transaction_index, t.trace_index));

            let blocks = self.fetch_blocks_buffered(numbers, true).await?;
            let mut block_rows = Vec::new();
            let mut tx_rows = Vec::new();
            let mut tx_hashes = Vec::new();
            for data in blocks {
                block_rows.push(data.block.clone());
                for tx in data.transactions {
                    tx_hashes.push(tx.hash);
                    tx_rows.push(tx);
                }
            }
            self.store.insert_blocks(&block_rows)?;
            self.store.insert_transactions(&tx_rows)?;
            self.store.insert_traces(&traces)?;
            if wants_receipt {
                self.fetch_receipts(tx_hashes).await?;
            }
        }
        Ok(())
    }

    /// Block filter gap: only the headers on the filter's arithmetic
    /// progression.
    async fn fetch_block_filter_gap(
        &self,
        filter: &crate::filter::BlockFilter,
        missing: &IntervalSet,
    ) -> Result<(), SyncError> {
        for &(lo, hi) in missing.intervals() {
            self.check_killed()?;
            let numbers = progression_in_range(filter.interval, filter.offset, lo, hi);
            if numbers.is_empty() {
                continue;
            }
            let blocks = self.fetch_blocks_buffered(numbers, false).await?;
            let block_rows: Vec<_> = blocks.into_iter().map(|b| b.block).collect();
            self.store.insert_blocks(&block_rows)?;
        }
        Ok(())
    }
}

/// Block numbers `n` in `[lo, hi]` with `n >= offset` and
/// `(n - offset) % interval == 0`.
fn progression_in_range(interval: u64, offset: u64, lo: u64, hi: u64) -> Vec<u64> {
    if interval == 0 {
        return Vec::new();
    }
    let first = if lo <= offset {
        offset
    } else {
        let delta = lo - offset;
        offset + delta.div_ceil(interval) * interval
    };
    let mut out = Vec::new();
    let mut n = first;
    while n <= hi {
        out.push(n);
        match n.checked_add(interval) {
            Some(next) => n = next,
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progression_respects_offset_and_bounds() {
        assert_eq!(progression_in_range(10, 3, 0, 35), vec![3, 13, 23, 33]);
        assert_eq!(progression_in_range(10, 3, 14, 35), vec![23, 33]);
        assert_eq!(progression_in_range(1, 0, 5, 8), vec![5, 6, 7, 8]);
        assert_eq!(progression_in_range(10, 50, 0, 40), Vec::<u64>::new());
    }
}
