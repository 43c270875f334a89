//! Top-level sync engine.
//!
//! One historical driver, one realtime driver and one request queue per
//! chain; the omnichain merger joins the per-chain streams into the single
//! totally ordered stream handed to the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::builder::ChainSyncBuilder;
use crate::chain::ChainConfig;
use crate::errors::SyncError;
use crate::historical::{HistoricalOutcome, HistoricalSync};
use crate::merge::{merge_chain_streams, ChainStream, ChainStreamItem, MergedItem};
use crate::progress::LightBlock;
use crate::realtime::RealtimeSync;
use crate::rpc::{RequestQueue, RpcClient};
use crate::source::Source;
use crate::store::{MemoryStore, SyncStore};

/// Everything one chain's pipeline needs.
pub(crate) struct ChainRuntime {
    pub config: ChainConfig,
    pub sources: Arc<Vec<Source>>,
    pub store: Arc<dyn SyncStore>,
    pub client: Arc<dyn RpcClient>,
}

pub struct ChainSync {
    pub(crate) chains: Vec<ChainRuntime>,
    pub(crate) merged_buffer: usize,
}

/// Running engine: the merged stream plus cancellation.
pub struct SyncHandle {
    rx: mpsc::Receiver<MergedItem>,
    kill_flags: Vec<Arc<AtomicBool>>,
    queues: Vec<RequestQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Next merged item; `None` once every chain has finished.
    pub async fn next(&mut self) -> Option<MergedItem> {
        self.rx.recv().await
    }

    /// Stop every driver. Idempotent: flags are checked at each suspension
    /// point and the request queues reject further work immediately.
    pub fn kill(&self) {
        for flag in &self.kill_flags {
            flag.store(true, Ordering::SeqCst);
        }
        for queue in &self.queues {
            queue.kill();
        }
    }

    /// Kill and wait for in-flight work to settle.
    pub async fn shutdown(mut self) {
        self.kill();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl ChainSync {
    pub fn builder() -> ChainSyncBuilder {
        ChainSyncBuilder::default()
    }

    /// Spawn every per-chain pipeline and the merger.
    pub fn start(self) -> SyncHandle {
        let (out_tx, out_rx) = mpsc::channel(self.merged_buffer);
        let mut streams = Vec::new();
        let mut kill_flags = Vec::new();
        let mut queues = Vec::new();
        let mut tasks = Vec::new();

        for runtime in self.chains {
            let chain_id = runtime.config.chain_id;
            let (tx, rx) = mpsc::channel(4);
            streams.push(ChainStream { chain_id, rx });

            // A chain that opts out of caching gets a run-scoped store and no
            // response cache: every fragment starts empty and nothing
            // persists.
            let (store, rpc_cache): (Arc<dyn SyncStore>, Option<Arc<dyn SyncStore>>) =
                if runtime.config.disable_cache {
                    (Arc::new(MemoryStore::new()), None)
                } else {
                    (runtime.store.clone(), Some(runtime.store.clone()))
                };

            let killed = Arc::new(AtomicBool::new(false));
            let queue = RequestQueue::new(
                runtime.client.clone(),
                chain_id,
                runtime.config.max_rpc_concurrency,
                rpc_cache,
            );
            kill_flags.push(killed.clone());
            queues.push(queue.clone());

            tasks.push(tokio::spawn(run_chain(
                runtime.config,
                runtime.sources,
                store,
                queue,
                killed,
                tx,
            )));
        }

        tasks.push(tokio::spawn(async move {
            let _ = merge_chain_streams(streams, out_tx).await;
        }));

        SyncHandle {
            rx: out_rx,
            kill_flags,
            queues,
            tasks,
        }
    }
}

async fn run_chain(
    config: ChainConfig,
    sources: Arc<Vec<Source>>,
    store: Arc<dyn SyncStore>,
    rpc: RequestQueue,
    killed: Arc<AtomicBool>,
    tx: mpsc::Sender<ChainStreamItem>,
) {
    let chain_id = config.chain_id;
    match drive_chain(config, sources, store, rpc, killed, &tx).await {
        Ok(()) => info!(chain_id, "chain pipeline finished"),
        Err(SyncError::Killed) => info!(chain_id, "chain pipeline killed"),
        Err(e) => {
            error!(chain_id, error = %e, "chain pipeline failed");
            let _ = tx
                .send(ChainStreamItem::Fatal {
                    message: e.to_string(),
                })
                .await;
        }
    }
}

async fn drive_chain(
    config: ChainConfig,
    sources: Arc<Vec<Source>>,
    store: Arc<dyn SyncStore>,
    rpc: RequestQueue,
    killed: Arc<AtomicBool>,
    tx: &mpsc::Sender<ChainStreamItem>,
) -> Result<(), SyncError> {
    // The finalized block anchors both drivers.
    let latest = rpc
        .block_by_number(None, false)
        .await?
        .ok_or_else(|| SyncError::MalformedResponse("node has no latest block".into()))?;
    let finalized_number = latest
        .block
        .number
        .saturating_sub(config.finality_block_count);
    let finalized_data = rpc
        .block_by_number(Some(finalized_number), false)
        .await?
        .ok_or_else(|| SyncError::MalformedResponse("finalized block missing".into()))?;
    let finalized = LightBlock {
        number: finalized_data.block.number,
        hash: finalized_data.block.hash,
        parent_hash: finalized_data.block.parent_hash,
        timestamp: finalized_data.block.timestamp,
    };

    let children = Arc::new(parking_lot::RwLock::new(Default::default()));
    let historical = HistoricalSync::new(
        config.clone(),
        sources.clone(),
        store.clone(),
        rpc.clone(),
        children.clone(),
        killed.clone(),
    );
    match historical.run(finalized, tx).await? {
        HistoricalOutcome::Ended => {
            info!(chain_id = config.chain_id, "chain reached its end block");
            Ok(())
        }
        HistoricalOutcome::ReachedFinalized => {
            let mut realtime = RealtimeSync::new(
                config, sources, store, rpc, children, killed, finalized,
            );
            realtime.run(tx).await
        }
    }
}
