//! Event filters and their matchers.
//!
//! A filter declares which chain data a source wants. Matching is pure: the
//! functions here look at one row at a time and decide membership. Factory
//! address fields are the one exception: the matcher waves them through and
//! the event assembler checks child-address membership with the visible-by
//! rule, because which addresses a factory has produced depends on sync
//! progress, not on the row alone.

use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{Address, FixedBytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::store::{BlockRow, LogRow, TraceRow, TransactionRow};

/// Where a factory log carries the child address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChildLocation {
    /// Indexed topic 1..=3.
    Topic(u8),
    /// Byte offset into the log data.
    Offset(usize),
}

impl ChildLocation {
    pub fn token(&self) -> String {
        match self {
            ChildLocation::Topic(n) => format!("topic{n}"),
            ChildLocation::Offset(n) => format!("offset{n}"),
        }
    }

    /// Extract the child address from a matching factory log, if the log is
    /// well formed.
    pub fn extract(&self, log: &LogRow) -> Option<Address> {
        let word = match self {
            ChildLocation::Topic(1) => log.topic1?,
            ChildLocation::Topic(2) => log.topic2?,
            ChildLocation::Topic(3) => log.topic3?,
            ChildLocation::Topic(_) => return None,
            ChildLocation::Offset(offset) => {
                let bytes = log.data.get(*offset..*offset + 32)?;
                B256::from_slice(bytes)
            }
        };
        Some(Address::from_slice(&word[12..]))
    }
}

/// A log-emitting contract whose logs enumerate addresses to track.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Factory {
    pub chain_id: u64,
    pub address: Address,
    pub event_selector: B256,
    pub child_location: ChildLocation,
    pub from_block: u64,
    pub to_block: Option<u64>,
}

/// Address constraint on a filter field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSpec {
    /// Matches any address.
    Any,
    Single(Address),
    Set(BTreeSet<Address>),
    /// Matches addresses produced by a factory; resolved by the assembler.
    Factory(Factory),
}

impl AddressSpec {
    pub fn factory(&self) -> Option<&Factory> {
        match self {
            AddressSpec::Factory(f) => Some(f),
            _ => None,
        }
    }

    /// Static membership test. Factory fields match here unconditionally;
    /// their child sets are enforced by the assembler.
    fn matches(&self, address: &Address) -> bool {
        match self {
            AddressSpec::Any => true,
            AddressSpec::Single(a) => a == address,
            AddressSpec::Set(set) => set.contains(address),
            AddressSpec::Factory(_) => true,
        }
    }

    fn matches_opt(&self, address: Option<&Address>) -> bool {
        match address {
            Some(a) => self.matches(a),
            // A missing address (contract creation `to`) only matches an
            // unconstrained field.
            None => matches!(self, AddressSpec::Any),
        }
    }
}

/// Topic constraint for one topic position. A null position matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicSpec {
    Any,
    Single(B256),
    Set(BTreeSet<B256>),
}

impl TopicSpec {
    fn matches(&self, topic: Option<&B256>) -> bool {
        match self {
            TopicSpec::Any => true,
            TopicSpec::Single(t) => topic == Some(t),
            TopicSpec::Set(set) => topic.map(|t| set.contains(t)).unwrap_or(false),
        }
    }

    /// The concrete values this position constrains to, if any.
    pub fn values(&self) -> Vec<B256> {
        match self {
            TopicSpec::Any => Vec::new(),
            TopicSpec::Single(t) => vec![*t],
            TopicSpec::Set(set) => set.iter().copied().collect(),
        }
    }
}

/// Function selector constraint on a trace filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorSpec {
    Any,
    Single(FixedBytes<4>),
    Set(BTreeSet<FixedBytes<4>>),
}

impl SelectorSpec {
    fn matches(&self, input: &[u8]) -> bool {
        match self {
            SelectorSpec::Any => true,
            _ if input.len() < 4 => false,
            SelectorSpec::Single(s) => &input[..4] == s.as_slice(),
            SelectorSpec::Set(set) => set.contains(&FixedBytes::<4>::from_slice(&input[..4])),
        }
    }

    pub fn values(&self) -> Vec<FixedBytes<4>> {
        match self {
            SelectorSpec::Any => Vec::new(),
            SelectorSpec::Single(s) => vec![*s],
            SelectorSpec::Set(set) => set.iter().copied().collect(),
        }
    }
}

/// Projection keys the downstream user reads. `None` means unspecified, which
/// conservatively implies everything (receipts included).
pub type Include = Option<BTreeSet<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub address: AddressSpec,
    pub topic0: TopicSpec,
    pub topic1: TopicSpec,
    pub topic2: TopicSpec,
    pub topic3: TopicSpec,
    pub include: Include,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub from_address: AddressSpec,
    pub to_address: AddressSpec,
    pub include_reverted: bool,
    pub include: Include,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFilter {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub from_address: AddressSpec,
    pub to_address: AddressSpec,
    pub function_selector: SelectorSpec,
    /// Stored for output tagging only; never consulted during matching so
    /// cached intervals stay broad.
    pub call_type: Option<String>,
    pub include_reverted: bool,
    pub include: Include,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFilter {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub from_address: AddressSpec,
    pub to_address: AddressSpec,
    pub include_reverted: bool,
    pub include: Include,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFilter {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: Option<u64>,
    /// Period in blocks.
    pub interval: u64,
    /// First match within each period.
    pub offset: u64,
    pub include: Include,
}

/// Tagged union over everything a source can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    Log(LogFilter),
    Transaction(TransactionFilter),
    Trace(TraceFilter),
    Transfer(TransferFilter),
    Block(BlockFilter),
}

impl Filter {
    pub fn chain_id(&self) -> u64 {
        match self {
            Filter::Log(f) => f.chain_id,
            Filter::Transaction(f) => f.chain_id,
            Filter::Trace(f) => f.chain_id,
            Filter::Transfer(f) => f.chain_id,
            Filter::Block(f) => f.chain_id,
        }
    }

    pub fn from_block(&self) -> u64 {
        match self {
            Filter::Log(f) => f.from_block,
            Filter::Transaction(f) => f.from_block,
            Filter::Trace(f) => f.from_block,
            Filter::Transfer(f) => f.from_block,
            Filter::Block(f) => f.from_block,
        }
    }

    pub fn to_block(&self) -> Option<u64> {
        match self {
            Filter::Log(f) => f.to_block,
            Filter::Transaction(f) => f.to_block,
            Filter::Trace(f) => f.to_block,
            Filter::Transfer(f) => f.to_block,
            Filter::Block(f) => f.to_block,
        }
    }

    pub fn include(&self) -> &Include {
        match self {
            Filter::Log(f) => &f.include,
            Filter::Transaction(f) => &f.include,
            Filter::Trace(f) => &f.include,
            Filter::Transfer(f) => &f.include,
            Filter::Block(f) => &f.include,
        }
    }

    /// Every factory referenced by this filter's address fields.
    pub fn factories(&self) -> Vec<&Factory> {
        let mut out = Vec::new();
        match self {
            Filter::Log(f) => out.extend(f.address.factory()),
            Filter::Transaction(f) => {
                out.extend(f.from_address.factory());
                out.extend(f.to_address.factory());
            }
            Filter::Trace(f) => {
                out.extend(f.from_address.factory());
                out.extend(f.to_address.factory());
            }
            Filter::Transfer(f) => {
                out.extend(f.from_address.factory());
                out.extend(f.to_address.factory());
            }
            Filter::Block(_) => {}
        }
        out
    }

    pub fn block_in_range(&self, block_number: u64) -> bool {
        in_range(self.from_block(), self.to_block(), block_number)
    }
}

fn in_range(from: u64, to: Option<u64>, block_number: u64) -> bool {
    block_number >= from && to.map(|t| block_number <= t).unwrap_or(true)
}

/// `include_reverted`, `call_type` and `function_selector` are advisory at
/// this layer: interval coverage ignores them so caches stay broad, and the
/// assembler enforces them so output is exact.
pub fn log_filter_matches(filter: &LogFilter, log: &LogRow) -> bool {
    in_range(filter.from_block, filter.to_block, log.block_number)
        && filter.address.matches(&log.address)
        && filter.topic0.matches(log.topic0.as_ref())
        && filter.topic1.matches(log.topic1.as_ref())
        && filter.topic2.matches(log.topic2.as_ref())
        && filter.topic3.matches(log.topic3.as_ref())
}

pub fn transaction_filter_matches(filter: &TransactionFilter, tx: &TransactionRow) -> bool {
    in_range(filter.from_block, filter.to_block, tx.block_number)
        && filter.from_address.matches(&tx.from)
        && filter.to_address.matches_opt(tx.to.as_ref())
}

pub fn trace_filter_matches(filter: &TraceFilter, trace: &TraceRow) -> bool {
    in_range(filter.from_block, filter.to_block, trace.block_number)
        && filter.from_address.matches(&trace.from)
        && filter.to_address.matches_opt(trace.to.as_ref())
        && filter.function_selector.matches(&trace.input)
}

pub fn transfer_filter_matches(filter: &TransferFilter, trace: &TraceRow) -> bool {
    in_range(filter.from_block, filter.to_block, trace.block_number)
        && trace.value.map(|v| v > U256::ZERO).unwrap_or(false)
        && filter.from_address.matches(&trace.from)
        && filter.to_address.matches_opt(trace.to.as_ref())
}

pub fn block_filter_matches(filter: &BlockFilter, block: &BlockRow) -> bool {
    in_range(filter.from_block, filter.to_block, block.number)
        && filter.interval > 0
        && block.number >= filter.offset
        && (block.number - filter.offset) % filter.interval == 0
}

pub fn filter_matches(
    filter: &Filter,
    block: Option<&BlockRow>,
    tx: Option<&TransactionRow>,
    log: Option<&LogRow>,
    trace: Option<&TraceRow>,
) -> bool {
    match filter {
        Filter::Log(f) => log.map(|l| log_filter_matches(f, l)).unwrap_or(false),
        Filter::Transaction(f) => tx
            .map(|t| transaction_filter_matches(f, t))
            .unwrap_or(false),
        Filter::Trace(f) => trace.map(|t| trace_filter_matches(f, t)).unwrap_or(false),
        Filter::Transfer(f) => trace.map(|t| transfer_filter_matches(f, t)).unwrap_or(false),
        Filter::Block(f) => block.map(|b| block_filter_matches(f, b)).unwrap_or(false),
    }
}

/// Child addresses a factory has produced so far, with the block each was
/// first observed in.
pub type ChildAddresses = BTreeMap<Address, u64>;

/// Visible-by membership: a child address emitted by its factory at block N
/// must not retroactively match events before N, even if the same address
/// also appears in some static list.
pub fn is_address_matched(
    address: &Address,
    block_number: u64,
    child_addresses: &ChildAddresses,
) -> bool {
    child_addresses
        .get(address)
        .map(|first_seen| *first_seen <= block_number)
        .unwrap_or(false)
}

/// Whether fetching this filter's data requires transaction receipts.
pub fn should_get_transaction_receipt(filter: &Filter) -> bool {
    match filter {
        Filter::Transaction(_) => true,
        Filter::Block(_) => false,
        Filter::Log(_) | Filter::Trace(_) | Filter::Transfer(_) => match filter.include() {
            Some(include) => include
                .iter()
                .any(|key| key.starts_with("transactionReceipt.")),
            // Unspecified projection: assume the user reads everything.
            None => true,
        },
    }
}
