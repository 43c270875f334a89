use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chain_sync::{
    BlockFilter, ChainConfig, ChainSync, Filter, MergedItem, Source,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let rpc_url = std::env::var("RPC_URL")?;
    let chain_id: u64 = std::env::var("CHAIN_ID")
        .unwrap_or_else(|_| "1".to_string())
        .parse()?;

    // Index every 100th block as a minimal smoke test of the pipeline.
    let engine = ChainSync::builder()
        .chain(ChainConfig::new(chain_id, rpc_url))
        .source(Source::block(
            "Century",
            Filter::Block(BlockFilter {
                chain_id,
                from_block: 0,
                to_block: None,
                interval: 100,
                offset: 0,
                include: None,
            }),
        ))
        .database("chain_sync.db")
        .build()?;

    let mut handle = engine.start();
    while let Some(item) = handle.next().await {
        match item {
            MergedItem::Batch { events, barriers } => {
                if let Some(last) = events.last() {
                    info!(
                        count = events.len(),
                        last = %last.name,
                        block = last.block.number,
                        "batch"
                    );
                }
                for barrier in barriers {
                    info!(chain_id = barrier.chain_id, checkpoint = %barrier.checkpoint, "barrier");
                }
            }
            MergedItem::Reorg {
                chain_id,
                safe_checkpoint,
            } => {
                warn!(chain_id, %safe_checkpoint, "reorg; roll back past the safe checkpoint");
            }
            MergedItem::Fatal { chain_id, message } => {
                error!(chain_id, %message, "chain failed");
                break;
            }
        }
    }
    Ok(())
}
