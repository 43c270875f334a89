//! chain-sync: the synchronization core of a multi-chain EVM indexing
//! framework.
//!
//! Given a set of declared event subscriptions (logs, transactions, traces,
//! native transfers, block intervals, optionally scoped to the children of a
//! factory contract), this library backfills the relevant historical chain
//! data over JSON-RPC, caches completed block ranges in a shared sync store
//! so re-runs skip finished work, follows each chain's tip with reorg
//! detection and finality tracking, and merges every chain's decoded events
//! into one totally ordered omnichain stream.

// Public re-exports
pub use builder::ChainSyncBuilder;
pub use chain::ChainConfig;
pub use checkpoint::{Checkpoint, CHECKPOINT_LENGTH, MAX_CHECKPOINT, ZERO_CHECKPOINT};
pub use errors::SyncError;
pub use events::{split_events, Event, EventBlockGroup, TransferData};
pub use filter::{
    AddressSpec, BlockFilter, ChildLocation, Factory, Filter, LogFilter, SelectorSpec, TopicSpec,
    TraceFilter, TransactionFilter, TransferFilter,
};
pub use fragments::{decompose, recover_filter, Fragment, FragmentSpec};
pub use historical::SyncPage;
pub use intervals::{Interval, IntervalSet};
pub use merge::{ChainBarrier, MergedItem};
pub use progress::{LightBlock, SyncProgress};
pub use rpc::{BlockData, HttpRpc, RequestQueue, RpcClient};
pub use source::{AbiMetadata, Source, SourceKind};
pub use store::{
    BlockRow, ChildAddressRow, LogRow, MemoryStore, SqliteStore, SyncStore, TraceRow,
    TransactionReceiptRow, TransactionRow,
};
pub use sync::{ChainSync, SyncHandle};

// Internal modules
mod builder;
mod chain;
mod checkpoint;
mod errors;
mod events;
mod filter;
mod fragments;
mod historical;
mod intervals;
mod merge;
mod progress;
mod realtime;
mod rpc;
mod source;
mod store;
mod sync;

#[cfg(test)]
mod scenario_tests;
#[cfg(test)]
mod testutil;
