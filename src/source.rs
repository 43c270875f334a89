//! Named event sources.
//!
//! A source pairs one filter with the decoding metadata and user-assigned
//! name the downstream handler layer addresses it by. Several sources may
//! share one filter; the sync driver works per filter, the assembler stamps
//! events per source.

use std::collections::BTreeMap;

use alloy_json_abi::{Event as AbiEvent, Function as AbiFunction};
use alloy_primitives::{FixedBytes, B256};

use crate::filter::{AddressSpec, Filter};

/// What flavor of user declaration produced this source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A contract with an ABI: log and trace filters.
    Contract,
    /// An externally owned account: transaction and transfer filters.
    Account,
    /// A block interval subscription.
    Block,
}

/// ABI items a contract source can decode, keyed by selector.
#[derive(Debug, Clone, Default)]
pub struct AbiMetadata {
    /// Events by topic0.
    pub events: BTreeMap<B256, AbiEvent>,
    /// Functions by 4-byte input selector.
    pub functions: BTreeMap<FixedBytes<4>, AbiFunction>,
}

impl AbiMetadata {
    pub fn from_items(
        events: impl IntoIterator<Item = AbiEvent>,
        functions: impl IntoIterator<Item = AbiFunction>,
    ) -> Self {
        Self {
            events: events.into_iter().map(|e| (e.selector(), e)).collect(),
            functions: functions.into_iter().map(|f| (f.selector(), f)).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub kind: SourceKind,
    pub filter: Filter,
    pub abi: AbiMetadata,
}

impl Source {
    pub fn contract(name: impl Into<String>, filter: Filter, abi: AbiMetadata) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Contract,
            filter,
            abi,
        }
    }

    pub fn account(name: impl Into<String>, filter: Filter) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Account,
            filter,
            abi: AbiMetadata::default(),
        }
    }

    pub fn block(name: impl Into<String>, filter: Filter) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Block,
            filter,
            abi: AbiMetadata::default(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.filter.chain_id()
    }

    /// For account sources: which side of the transfer the filter pins down.
    /// Determined by which address field the user constrained.
    pub fn account_direction(&self) -> &'static str {
        let (from, to) = match &self.filter {
            Filter::Transaction(f) => (&f.from_address, &f.to_address),
            Filter::Transfer(f) => (&f.from_address, &f.to_address),
            Filter::Trace(f) => (&f.from_address, &f.to_address),
            _ => return "from",
        };
        if !matches!(from, AddressSpec::Any) {
            "from"
        } else if !matches!(to, AddressSpec::Any) {
            "to"
        } else {
            "from"
        }
    }
}
