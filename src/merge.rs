//! Omnichain event stream merging.
//!
//! Each chain produces pages of checkpoint-ordered events plus an upper-bound
//! checkpoint. The merger holds the most recent pending page per chain,
//! computes the barrier (the minimum pending checkpoint) and flushes every
//! buffered event at or below it, totally ordered. A chain that stalls stalls
//! the merge: correctness before liveness.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::debug;

use crate::events::Event;
use crate::historical::SyncPage;

/// What a per-chain pipeline feeds the merger.
#[derive(Debug, Clone)]
pub enum ChainStreamItem {
    Page(SyncPage),
    /// A reorg below previously delivered blocks. Everything after
    /// `safe_checkpoint` must be rolled back downstream.
    Reorg { safe_checkpoint: String },
    /// The chain's driver hit an unrecoverable error.
    Fatal { message: String },
}

/// Per-chain commit marker for one merged round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBarrier {
    pub chain_id: u64,
    pub checkpoint: String,
}

/// One output record of the merged stream.
#[derive(Debug, Clone)]
pub enum MergedItem {
    Batch {
        /// Totally ordered across chains.
        events: Vec<Event>,
        /// One marker per live chain: the position downstream can commit
        /// through for that chain.
        barriers: Vec<ChainBarrier>,
    },
    Reorg {
        chain_id: u64,
        safe_checkpoint: String,
    },
    /// Terminates the joint stream: a chain failed fatally.
    Fatal { chain_id: u64, message: String },
}

struct ChainState {
    chain_id: u64,
    rx: mpsc::Receiver<ChainStreamItem>,
    /// Events delivered by the current page, not yet flushed.
    buffer: VecDeque<Event>,
    /// Upper bound checkpoint of the current page; `None` when a fresh page
    /// is needed.
    checkpoint: Option<String>,
    done: bool,
}

/// Handle to one chain's stream for the merger.
pub struct ChainStream {
    pub chain_id: u64,
    pub rx: mpsc::Receiver<ChainStreamItem>,
}

/// Merge N per-chain streams into one totally ordered stream.
///
/// Terminates when every input has closed and drained. Returns `Err` only if
/// the output side goes away.
pub async fn merge_chain_streams(
    streams: Vec<ChainStream>,
    out: mpsc::Sender<MergedItem>,
) -> Result<(), ()> {
    let mut chains: Vec<ChainState> = streams
        .into_iter()
        .map(|s| ChainState {
            chain_id: s.chain_id,
            rx: s.rx,
            buffer: VecDeque::new(),
            checkpoint: None,
            done: false,
        })
        .collect();

    loop {
        // Refill: every live chain must have a pending page before a barrier
        // can be computed. Await the laggards.
        for chain in chains.iter_mut() {
            while !chain.done && chain.checkpoint.is_none() {
                match chain.rx.recv().await {
                    Some(ChainStreamItem::Page(page)) => {
                        debug!(
                            chain_id = chain.chain_id,
                            checkpoint = %page.checkpoint,
                            events = page.events.len(),
                            "merger received page"
                        );
                        chain.buffer.extend(page.events);
                        chain.checkpoint = Some(page.checkpoint);
                    }
                    Some(ChainStreamItem::Reorg { safe_checkpoint }) => {
                        // Drop pending events past the safe point, then tell
                        // downstream to roll back.
                        chain.buffer.retain(|e| e.id <= safe_checkpoint);
                        if out
                            .send(MergedItem::Reorg {
                                chain_id: chain.chain_id,
                                safe_checkpoint,
                            })
                            .await
                            .is_err()
                        {
                            return Err(());
                        }
                    }
                    Some(ChainStreamItem::Fatal { message }) => {
                        let _ = out
                            .send(MergedItem::Fatal {
                                chain_id: chain.chain_id,
                                message,
                            })
                            .await;
                        return Ok(());
                    }
                    None => {
                        chain.done = true;
                    }
                }
            }
        }

        // Drop chains that are finished and fully drained.
        chains.retain(|c| !(c.done && c.buffer.is_empty() && c.checkpoint.is_none()));
        if chains.is_empty() {
            return Ok(());
        }

        let Some(barrier) = chains
            .iter()
            .filter_map(|c| c.checkpoint.as_deref())
            .min()
            .map(|b| b.to_string())
        else {
            // Only finished chains with straggler events remain: flush them
            // and terminate.
            let mut events: Vec<Event> =
                chains.iter_mut().flat_map(|c| c.buffer.drain(..)).collect();
            events.sort_by(|a, b| a.id.cmp(&b.id));
            if !events.is_empty() {
                let barriers = chains
                    .iter()
                    .map(|c| ChainBarrier {
                        chain_id: c.chain_id,
                        checkpoint: events.last().expect("nonempty").id.clone(),
                    })
                    .collect();
                if out.send(MergedItem::Batch { events, barriers }).await.is_err() {
                    return Err(());
                }
            }
            return Ok(());
        };

        // Flush everything at or below the barrier, totally ordered.
        let mut events: Vec<Event> = Vec::new();
        let mut barriers = Vec::new();
        for chain in chains.iter_mut() {
            let mut delivered_max: Option<String> = None;
            while chain
                .buffer
                .front()
                .map(|e| e.id <= barrier)
                .unwrap_or(false)
            {
                let event = chain.buffer.pop_front().expect("checked front");
                delivered_max = Some(event.id.clone());
                events.push(event);
            }
            barriers.push(ChainBarrier {
                chain_id: chain.chain_id,
                checkpoint: delivered_max
                    .map(|max| max.min(barrier.clone()))
                    .unwrap_or_else(|| barrier.clone()),
            });
            // The chain owning the barrier is the laggard: its generator is
            // advanced next round.
            if chain.checkpoint.as_deref() == Some(barrier.as_str()) {
                chain.checkpoint = None;
            }
        }
        events.sort_by(|a, b| a.id.cmp(&b.id));

        if out.send(MergedItem::Batch { events, barriers }).await.is_err() {
            return Err(());
        }
    }
}
