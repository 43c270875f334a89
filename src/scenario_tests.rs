//! End-to-end driver scenarios against a scripted node and an in-memory
//! store.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use alloy_json_abi::Event as AbiEvent;
use alloy_primitives::{address, b256, Address, B256, U256};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::chain::ChainConfig;
use crate::checkpoint::{Checkpoint, MAX_FIELD};
use crate::errors::SyncError;
use crate::filter::{
    AddressSpec, BlockFilter, ChildLocation, Factory, Filter, LogFilter, TopicSpec,
};
use crate::historical::{HistoricalOutcome, HistoricalSync, SyncPage};
use crate::merge::ChainStreamItem;
use crate::progress::LightBlock;
use crate::realtime::RealtimeSync;
use crate::rpc::{BlockData, RequestQueue, RpcClient};
use crate::source::{AbiMetadata, Source};
use crate::store::{BlockRow, MemoryStore, SyncStore};
use crate::testutil::{block_row, canonical_hash, log_row, tx_row, CountingStore, MockRpc};

const TOKEN: Address = address!("00000000000000000000000000000000000000aa");
const HOLDER: Address = address!("00000000000000000000000000000000000000bb");
const FACTORY_ADDR: Address = address!("00000000000000000000000000000000000000fa");
const POOL_A: Address = address!("00000000000000000000000000000000000000a1");
const POOL_CREATED: B256 =
    b256!("00000000000000000000000000000000000000000000000000000000000000fc");

fn light(block: &BlockRow) -> LightBlock {
    LightBlock {
        number: block.number,
        hash: block.hash,
        parent_hash: block.parent_hash,
        timestamp: block.timestamp,
    }
}

fn empty_chain(rpc: &MockRpc, through: u64) {
    rpc.push_blocks((0..=through).map(|n| BlockData {
        block: block_row(1, n),
        transactions: Vec::new(),
    }));
}

async fn run_historical(
    sources: Vec<Source>,
    store: Arc<dyn SyncStore>,
    rpc_client: Arc<MockRpc>,
    finalized: LightBlock,
) -> Result<(HistoricalOutcome, Vec<SyncPage>), SyncError> {
    let chain = ChainConfig::new(1, "http://unused.invalid");
    let queue = RequestQueue::new(rpc_client as Arc<dyn RpcClient>, 1, 4, None);
    let driver = HistoricalSync::new(
        chain,
        Arc::new(sources),
        store,
        queue,
        Arc::new(RwLock::new(Default::default())),
        Arc::new(AtomicBool::new(false)),
    );
    let (tx, mut rx) = mpsc::channel(1024);
    let outcome = driver.run(finalized, &tx).await?;
    drop(tx);
    let mut pages = Vec::new();
    while let Some(item) = rx.recv().await {
        if let ChainStreamItem::Page(page) = item {
            pages.push(page);
        }
    }
    Ok((outcome, pages))
}

fn block_interval_source(to_block: Option<u64>) -> Source {
    Source::block(
        "Blocks",
        Filter::Block(BlockFilter {
            chain_id: 1,
            from_block: 0,
            to_block,
            interval: 1,
            offset: 0,
            include: None,
        }),
    )
}

fn transfer_abi() -> AbiEvent {
    AbiEvent::parse("event Transfer(address indexed from, address indexed to, uint256 value)")
        .unwrap()
}

#[tokio::test]
async fn empty_chain_single_block_event() {
    // A chain with one block and a block filter pinned to it yields exactly
    // one event at the block's saturated-transaction-index checkpoint.
    let rpc = Arc::new(MockRpc::new(1));
    empty_chain(&rpc, 0);
    let genesis = block_row(1, 0);

    let (outcome, pages) = run_historical(
        vec![block_interval_source(Some(0))],
        Arc::new(MemoryStore::new()),
        rpc,
        light(&genesis),
    )
    .await
    .unwrap();

    assert!(matches!(outcome, HistoricalOutcome::Ended));
    let events: Vec<_> = pages.into_iter().flat_map(|p| p.events).collect();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.name, "Blocks:block");
    assert_eq!(
        event.checkpoint,
        Checkpoint {
            block_timestamp: genesis.timestamp,
            chain_id: 1,
            block_number: 0,
            transaction_index: MAX_FIELD,
            event_type: 5,
            event_index: 0,
        }
    );
}

#[tokio::test]
async fn erc20_mint_is_decoded() {
    // Deploy in block 1, mint in block 2; only the mint's Transfer surfaces.
    let rpc = Arc::new(MockRpc::new(1));
    let block0 = block_row(1, 0);
    let block1 = block_row(1, 1);
    let block2 = block_row(1, 2);
    let mint_tx = tx_row(&block2, 0, HOLDER, Some(TOKEN));
    let abi = transfer_abi();
    let value = U256::from(10u8).pow(U256::from(18u8));
    let mint_log = log_row(
        &block2,
        &mint_tx,
        0,
        TOKEN,
        &[
            abi.selector(),
            B256::left_padding_from(Address::ZERO.as_slice()),
            B256::left_padding_from(HOLDER.as_slice()),
        ],
        B256::from(value).0.to_vec().into(),
    );
    rpc.push_block(BlockData {
        block: block0,
        transactions: Vec::new(),
    });
    rpc.push_block(BlockData {
        block: block1,
        transactions: Vec::new(),
    });
    rpc.push_block(BlockData {
        block: block2.clone(),
        transactions: vec![mint_tx],
    });
    rpc.push_log(mint_log);

    let source = Source::contract(
        "Token",
        Filter::Log(LogFilter {
            chain_id: 1,
            from_block: 0,
            to_block: None,
            address: AddressSpec::Single(TOKEN),
            topic0: TopicSpec::Single(abi.selector()),
            topic1: TopicSpec::Any,
            topic2: TopicSpec::Any,
            topic3: TopicSpec::Any,
            include: Some(["log.address".to_string()].into_iter().collect()),
        }),
        AbiMetadata::from_items([abi], []),
    );

    let (_, pages) = run_historical(
        vec![source],
        Arc::new(MemoryStore::new()),
        rpc,
        light(&block2),
    )
    .await
    .unwrap();

    let events: Vec<_> = pages.into_iter().flat_map(|p| p.events).collect();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.name, "Token:Transfer");
    assert_eq!(event.checkpoint.block_number, 2);
    assert_eq!(event.checkpoint.event_index, 0);
    assert_eq!(
        event.args.as_ref().unwrap()["value"],
        serde_json::json!("1000000000000000000")
    );
    assert!(event.transaction.is_some());
}

#[tokio::test]
async fn partial_cache_refetches_only_the_gap() {
    let rpc = Arc::new(MockRpc::new(1));
    empty_chain(&rpc, 26);
    let store = Arc::new(CountingStore::new(Arc::new(MemoryStore::new())));
    let source = || vec![block_interval_source(Some(100))];

    // First run reaches block 24.
    let finalized_24 = light(&block_row(1, 24));
    run_historical(source(), store.clone(), rpc.clone(), finalized_24)
        .await
        .unwrap();
    assert_eq!(rpc.requests_matching("block:").len(), 25);

    // Two more blocks appear; only [25, 26] is fetched.
    rpc.clear_requests();
    let finalized_26 = light(&block_row(1, 26));
    run_historical(source(), store.clone(), rpc.clone(), finalized_26)
        .await
        .unwrap();
    let mut fetched = rpc.requests_matching("block:");
    fetched.sort();
    assert_eq!(
        fetched,
        vec!["block:25".to_string(), "block:26".to_string()]
    );
    let cached = store.get_intervals(1, &["block_1_1_0".to_string()]).unwrap();
    assert_eq!(cached.intervals(), &[(0, 26)]);

    // Fully cached re-run: zero RPC requests, zero store writes.
    rpc.clear_requests();
    let writes_before = store.write_count();
    let (_, pages) = run_historical(source(), store.clone(), rpc.clone(), finalized_26)
        .await
        .unwrap();
    assert_eq!(rpc.request_count(), 0);
    assert_eq!(store.write_count(), writes_before);
    // The cached data is still delivered.
    assert_eq!(pages.iter().map(|p| p.events.len()).sum::<usize>(), 27);
}

fn realtime_log_source() -> Source {
    Source::contract(
        "Token",
        Filter::Log(LogFilter {
            chain_id: 1,
            from_block: 0,
            to_block: None,
            address: AddressSpec::Single(TOKEN),
            topic0: TopicSpec::Single(transfer_abi().selector()),
            topic1: TopicSpec::Any,
            topic2: TopicSpec::Any,
            topic3: TopicSpec::Any,
            include: Some(["log.address".to_string()].into_iter().collect()),
        }),
        AbiMetadata::from_items([transfer_abi()], []),
    )
}

fn realtime_driver(
    rpc: Arc<MockRpc>,
    store: Arc<dyn SyncStore>,
    finalized: LightBlock,
    finality_block_count: u64,
) -> RealtimeSync {
    let chain = ChainConfig::new(1, "http://unused.invalid")
        .finality_block_count(finality_block_count);
    let queue = RequestQueue::new(rpc as Arc<dyn RpcClient>, 1, 4, None);
    RealtimeSync::new(
        chain,
        Arc::new(vec![realtime_log_source()]),
        store,
        queue,
        Arc::new(RwLock::new(Default::default())),
        Arc::new(AtomicBool::new(false)),
        finalized,
    )
}

#[tokio::test]
async fn depth_one_reorg_is_reconciled() {
    let rpc = Arc::new(MockRpc::new(1));
    empty_chain(&rpc, 10);
    let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
    let finalized = light(&block_row(1, 5));
    let mut driver = realtime_driver(rpc.clone(), store.clone(), finalized, 64);

    let (tx, mut rx) = mpsc::channel(64);

    // First tick walks up to the tip, ingesting 6..=10.
    driver.tick(&tx).await.unwrap();
    let mut ingested = Vec::new();
    while let Ok(item) = rx.try_recv() {
        match item {
            ChainStreamItem::Page(page) => ingested.push(page.block_range.0),
            other => panic!("unexpected item {other:?}"),
        }
    }
    assert_eq!(ingested, vec![6, 7, 8, 9, 10]);
    assert!(!store.read_range(1, 10, 10).unwrap().blocks.is_empty());

    // A competing block 10 arrives.
    let mut new_tip = block_row(1, 10);
    new_tip.hash = b256!("00000000000000000000000000000000000000000000000000000000000000ff");
    new_tip.parent_hash = canonical_hash(9);
    rpc.reorg_to(BlockData {
        block: new_tip.clone(),
        transactions: Vec::new(),
    });

    driver.tick(&tx).await.unwrap();
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    assert_eq!(items.len(), 2);
    match &items[0] {
        ChainStreamItem::Reorg { safe_checkpoint } => {
            let block9 = block_row(1, 9);
            assert_eq!(
                *safe_checkpoint,
                Checkpoint::block_bound(block9.timestamp, 1, 9).encode()
            );
        }
        other => panic!("expected reorg, got {other:?}"),
    }
    match &items[1] {
        ChainStreamItem::Page(page) => assert_eq!(page.block_range, (10, 10)),
        other => panic!("expected page, got {other:?}"),
    }
    // The store now holds the new branch's block 10.
    let stored = store.read_range(1, 10, 10).unwrap().blocks;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].hash, new_tip.hash);
}

#[tokio::test]
async fn finality_advances_and_records_intervals() {
    let rpc = Arc::new(MockRpc::new(1));
    empty_chain(&rpc, 6);
    let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
    let finalized = light(&block_row(1, 0));
    let mut driver = realtime_driver(rpc.clone(), store.clone(), finalized, 2);

    let (tx, mut rx) = mpsc::channel(64);
    driver.tick(&tx).await.unwrap();
    while rx.try_recv().is_ok() {}

    // latest=6, finality=2: blocks through 4 are now final and their span is
    // recorded under the filter's fragments.
    let specs = crate::fragments::decompose(&realtime_log_source().filter);
    let ids: Vec<String> = specs.iter().map(|s| s.fragment.id()).collect();
    let cached = store.get_intervals(1, &ids).unwrap();
    assert_eq!(cached.intervals(), &[(1, 4)]);
}

#[tokio::test]
async fn factory_child_visibility_is_first_seen_scoped() {
    // The factory announces POOL_A at block 100; POOL_A's swap at block 95
    // must not surface, its swap at block 105 must.
    let rpc = Arc::new(MockRpc::new(1));
    let swap_abi = AbiEvent::parse("event Swap()").unwrap();

    let mut blocks = Vec::new();
    for n in 0..=110u64 {
        let block = block_row(1, n);
        let transactions = if n == 95 || n == 105 {
            vec![tx_row(&block, 0, HOLDER, Some(POOL_A))]
        } else {
            Vec::new()
        };
        blocks.push(BlockData {
            block,
            transactions,
        });
    }
    rpc.push_blocks(blocks);

    for number in [95u64, 105] {
        let block = block_row(1, number);
        let tx = tx_row(&block, 0, HOLDER, Some(POOL_A));
        rpc.push_log(log_row(
            &block,
            &tx,
            0,
            POOL_A,
            &[swap_abi.selector()],
            Default::default(),
        ));
    }
    {
        let block = block_row(1, 100);
        let tx = tx_row(&block, 0, HOLDER, Some(FACTORY_ADDR));
        rpc.push_log(log_row(
            &block,
            &tx,
            0,
            FACTORY_ADDR,
            &[POOL_CREATED, B256::left_padding_from(POOL_A.as_slice())],
            Default::default(),
        ));
    }

    let factory = Factory {
        chain_id: 1,
        address: FACTORY_ADDR,
        event_selector: POOL_CREATED,
        child_location: ChildLocation::Topic(1),
        from_block: 0,
        to_block: None,
    };
    let source = Source::contract(
        "Pool",
        Filter::Log(LogFilter {
            chain_id: 1,
            from_block: 0,
            to_block: None,
            address: AddressSpec::Factory(factory),
            topic0: TopicSpec::Single(swap_abi.selector()),
            topic1: TopicSpec::Any,
            topic2: TopicSpec::Any,
            topic3: TopicSpec::Any,
            include: Some(["log.address".to_string()].into_iter().collect()),
        }),
        AbiMetadata::from_items([swap_abi], []),
    );

    let (_, pages) = run_historical(
        vec![source],
        Arc::new(MemoryStore::new()),
        rpc,
        light(&block_row(1, 110)),
    )
    .await
    .unwrap();

    let events: Vec<_> = pages.into_iter().flat_map(|p| p.events).collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "Pool:Swap");
    assert_eq!(events[0].checkpoint.block_number, 105);
}
