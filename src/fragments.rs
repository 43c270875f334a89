//! Filter decomposition into cacheable fragments.
//!
//! Two filters that overlap partially can still share cached work if the
//! overlap is expressible as a common sub-key. A fragment is that sub-key:
//! the minimal exact cache key for one "slice" of a filter. Every fragment
//! also knows the ids of all equal-or-looser fragments (`adjacent_ids`);
//! cached intervals stored under any adjacent id are valid for the fragment,
//! so coverage is the union across them.

use alloy_primitives::{Address, FixedBytes, B256};

use crate::filter::{
    should_get_transaction_receipt, AddressSpec, ChildLocation, Factory, Filter, SelectorSpec,
    TopicSpec,
};

/// Address position token inside a fragment id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressToken {
    Null,
    Address(Address),
    Factory {
        address: Address,
        event_selector: B256,
        child_location: ChildLocation,
    },
}

impl AddressToken {
    fn encode(&self) -> String {
        match self {
            AddressToken::Null => "null".to_string(),
            AddressToken::Address(a) => format!("{a:#x}"),
            AddressToken::Factory {
                address,
                event_selector,
                child_location,
            } => format!(
                "{address:#x}_{event_selector:#x}_{}",
                child_location.token()
            ),
        }
    }

    /// The loosenings of this token, loosest last. Both a concrete address
    /// and a factory triple are covered by an unconstrained (`null`) cache.
    fn widenings(&self) -> Vec<AddressToken> {
        match self {
            AddressToken::Null => vec![AddressToken::Null],
            other => vec![other.clone(), AddressToken::Null],
        }
    }
}

fn hex_token(value: Option<B256>) -> String {
    value.map(|v| format!("{v:#x}")).unwrap_or("null".into())
}

fn selector_token(value: Option<FixedBytes<4>>) -> String {
    value.map(|v| format!("{v:#x}")).unwrap_or("null".into())
}

fn topic_widenings(value: Option<B256>) -> Vec<Option<B256>> {
    match value {
        Some(t) => vec![Some(t), None],
        None => vec![None],
    }
}

fn selector_widenings(value: Option<FixedBytes<4>>) -> Vec<Option<FixedBytes<4>>> {
    match value {
        Some(s) => vec![Some(s), None],
        None => vec![None],
    }
}

/// A receipt-less cache never covers a receipt-needing fragment; the reverse
/// does.
fn receipt_widenings(wants_receipt: bool) -> Vec<bool> {
    if wants_receipt {
        vec![true]
    } else {
        vec![false, true]
    }
}

/// Canonical cacheable sub-key of a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Block {
        chain_id: u64,
        interval: u64,
        offset: u64,
    },
    Transaction {
        chain_id: u64,
        from: AddressToken,
        to: AddressToken,
    },
    Log {
        chain_id: u64,
        address: AddressToken,
        topic0: Option<B256>,
        topic1: Option<B256>,
        topic2: Option<B256>,
        topic3: Option<B256>,
        wants_receipt: bool,
    },
    Trace {
        chain_id: u64,
        from: AddressToken,
        to: AddressToken,
        function_selector: Option<FixedBytes<4>>,
        wants_receipt: bool,
    },
    Transfer {
        chain_id: u64,
        from: AddressToken,
        to: AddressToken,
        wants_receipt: bool,
    },
    FactoryLog {
        chain_id: u64,
        address: Address,
        event_selector: B256,
        child_location: ChildLocation,
        from_block: u64,
        to_block: Option<u64>,
    },
}

impl Fragment {
    /// Stable id string. This grammar is compatibility-critical: it is the
    /// cache key persisted in the store's `intervals` table.
    pub fn id(&self) -> String {
        match self {
            Fragment::Block {
                chain_id,
                interval,
                offset,
            } => format!("block_{chain_id}_{interval}_{offset}"),
            Fragment::Transaction { chain_id, from, to } => {
                format!("transaction_{chain_id}_{}_{}", from.encode(), to.encode())
            }
            Fragment::Log {
                chain_id,
                address,
                topic0,
                topic1,
                topic2,
                topic3,
                wants_receipt,
            } => format!(
                "log_{chain_id}_{}_{}_{}_{}_{}_{}",
                address.encode(),
                hex_token(*topic0),
                hex_token(*topic1),
                hex_token(*topic2),
                hex_token(*topic3),
                u8::from(*wants_receipt),
            ),
            Fragment::Trace {
                chain_id,
                from,
                to,
                function_selector,
                wants_receipt,
            } => format!(
                "trace_{chain_id}_{}_{}_{}_{}",
                from.encode(),
                to.encode(),
                selector_token(*function_selector),
                u8::from(*wants_receipt),
            ),
            Fragment::Transfer {
                chain_id,
                from,
                to,
                wants_receipt,
            } => format!(
                "transfer_{chain_id}_{}_{}_{}",
                from.encode(),
                to.encode(),
                u8::from(*wants_receipt),
            ),
            Fragment::FactoryLog {
                chain_id,
                address,
                event_selector,
                child_location,
                from_block,
                to_block,
            } => format!(
                "factory_log_{chain_id}_{address:#x}_{event_selector:#x}_{}_{from_block}_{}",
                child_location.token(),
                to_block.map(|b| b.to_string()).unwrap_or("null".into()),
            ),
        }
    }

    /// All fragment ids strictly no-narrower than this one, own id included.
    pub fn adjacent_ids(&self) -> Vec<String> {
        match self {
            Fragment::Block { .. } | Fragment::FactoryLog { .. } => vec![self.id()],
            Fragment::Transaction { chain_id, from, to } => {
                let mut out = Vec::new();
                for f in from.widenings() {
                    for t in to.widenings() {
                        out.push(
                            Fragment::Transaction {
                                chain_id: *chain_id,
                                from: f.clone(),
                                to: t,
                            }
                            .id(),
                        );
                    }
                }
                out
            }
            Fragment::Log {
                chain_id,
                address,
                topic0,
                topic1,
                topic2,
                topic3,
                wants_receipt,
            } => {
                let mut out = Vec::new();
                for a in address.widenings() {
                    for t0 in topic_widenings(*topic0) {
                        for t1 in topic_widenings(*topic1) {
                            for t2 in topic_widenings(*topic2) {
                                for t3 in topic_widenings(*topic3) {
                                    for r in receipt_widenings(*wants_receipt) {
                                        out.push(
                                            Fragment::Log {
                                                chain_id: *chain_id,
                                                address: a.clone(),
                                                topic0: t0,
                                                topic1: t1,
                                                topic2: t2,
                                                topic3: t3,
                                                wants_receipt: r,
                                            }
                                            .id(),
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
                out
            }
            Fragment::Trace {
                chain_id,
                from,
                to,
                function_selector,
                wants_receipt,
            } => {
                let mut out = Vec::new();
                for f in from.widenings() {
                    for t in to.widenings() {
                        for s in selector_widenings(*function_selector) {
                            for r in receipt_widenings(*wants_receipt) {
                                out.push(
                                    Fragment::Trace {
                                        chain_id: *chain_id,
                                        from: f.clone(),
                                        to: t.clone(),
                                        function_selector: s,
                                        wants_receipt: r,
                                    }
                                    .id(),
                                );
                            }
                        }
                    }
                }
                out
            }
            Fragment::Transfer {
                chain_id,
                from,
                to,
                wants_receipt,
            } => {
                let mut out = Vec::new();
                for f in from.widenings() {
                    for t in to.widenings() {
                        for r in receipt_widenings(*wants_receipt) {
                            out.push(
                                Fragment::Transfer {
                                    chain_id: *chain_id,
                                    from: f.clone(),
                                    to: t.clone(),
                                    wants_receipt: r,
                                }
                                .id(),
                            );
                        }
                    }
                }
                out
            }
        }
    }
}

/// A fragment together with the id list coverage reads go through.
#[derive(Debug, Clone)]
pub struct FragmentSpec {
    pub fragment: Fragment,
    pub adjacent_ids: Vec<String>,
}

impl FragmentSpec {
    fn new(fragment: Fragment) -> Self {
        let adjacent_ids = fragment.adjacent_ids();
        Self {
            fragment,
            adjacent_ids,
        }
    }
}

fn address_tokens(spec: &AddressSpec) -> Vec<AddressToken> {
    match spec {
        AddressSpec::Any => vec![AddressToken::Null],
        AddressSpec::Single(a) => vec![AddressToken::Address(*a)],
        AddressSpec::Set(set) => set.iter().map(|a| AddressToken::Address(*a)).collect(),
        AddressSpec::Factory(f) => vec![AddressToken::Factory {
            address: f.address,
            event_selector: f.event_selector,
            child_location: f.child_location,
        }],
    }
}

/// Exploded values for topic1..3: sets cross-product into one fragment per
/// member.
fn exploded_topics(spec: &TopicSpec) -> Vec<Option<B256>> {
    match spec {
        TopicSpec::Any => vec![None],
        TopicSpec::Single(t) => vec![Some(*t)],
        TopicSpec::Set(set) => set.iter().map(|t| Some(*t)).collect(),
    }
}

/// topic0 is never exploded: a multi-valued topic0 keys the cache at the
/// looser `null` position and the matcher recovers the union when reading.
fn topic0_token(spec: &TopicSpec) -> Option<B256> {
    match spec {
        TopicSpec::Single(t) => Some(*t),
        TopicSpec::Set(set) if set.len() == 1 => set.iter().next().copied(),
        _ => None,
    }
}

fn exploded_selectors(spec: &SelectorSpec) -> Vec<Option<FixedBytes<4>>> {
    match spec {
        SelectorSpec::Any => vec![None],
        SelectorSpec::Single(s) => vec![Some(*s)],
        SelectorSpec::Set(set) => set.iter().map(|s| Some(*s)).collect(),
    }
}

/// Split a filter into its cacheable fragments.
pub fn decompose(filter: &Filter) -> Vec<FragmentSpec> {
    let wants_receipt = should_get_transaction_receipt(filter);
    match filter {
        Filter::Block(f) => vec![FragmentSpec::new(Fragment::Block {
            chain_id: f.chain_id,
            interval: f.interval,
            offset: f.offset,
        })],
        Filter::Transaction(f) => {
            let mut out = Vec::new();
            for from in address_tokens(&f.from_address) {
                for to in address_tokens(&f.to_address) {
                    out.push(FragmentSpec::new(Fragment::Transaction {
                        chain_id: f.chain_id,
                        from: from.clone(),
                        to,
                    }));
                }
            }
            out
        }
        Filter::Log(f) => {
            let topic0 = topic0_token(&f.topic0);
            let mut out = Vec::new();
            for address in address_tokens(&f.address) {
                for topic1 in exploded_topics(&f.topic1) {
                    for topic2 in exploded_topics(&f.topic2) {
                        for topic3 in exploded_topics(&f.topic3) {
                            out.push(FragmentSpec::new(Fragment::Log {
                                chain_id: f.chain_id,
                                address: address.clone(),
                                topic0,
                                topic1,
                                topic2,
                                topic3,
                                wants_receipt,
                            }));
                        }
                    }
                }
            }
            out
        }
        Filter::Trace(f) => {
            let mut out = Vec::new();
            for from in address_tokens(&f.from_address) {
                for to in address_tokens(&f.to_address) {
                    for selector in exploded_selectors(&f.function_selector) {
                        out.push(FragmentSpec::new(Fragment::Trace {
                            chain_id: f.chain_id,
                            from: from.clone(),
                            to: to.clone(),
                            function_selector: selector,
                            wants_receipt,
                        }));
                    }
                }
            }
            out
        }
        Filter::Transfer(f) => {
            let mut out = Vec::new();
            for from in address_tokens(&f.from_address) {
                for to in address_tokens(&f.to_address) {
                    out.push(FragmentSpec::new(Fragment::Transfer {
                        chain_id: f.chain_id,
                        from: from.clone(),
                        to,
                        wants_receipt,
                    }));
                }
            }
            out
        }
    }
}

/// Fragment id a factory's child-address set is stored under.
pub fn factory_id(factory: &Factory) -> String {
    factory_fragment(factory).fragment.id()
}

/// The cache fragment a factory's own log sweep is keyed under.
pub fn factory_fragment(factory: &Factory) -> FragmentSpec {
    FragmentSpec::new(Fragment::FactoryLog {
        chain_id: factory.chain_id,
        address: factory.address,
        event_selector: factory.event_selector,
        child_location: factory.child_location,
        from_block: factory.from_block,
        to_block: factory.to_block,
    })
}

fn tokens_to_address_spec(base: &AddressSpec, tokens: Vec<AddressToken>) -> AddressSpec {
    match base {
        AddressSpec::Any | AddressSpec::Factory(_) => base.clone(),
        _ => {
            let mut addresses: Vec<Address> = tokens
                .into_iter()
                .filter_map(|t| match t {
                    AddressToken::Address(a) => Some(a),
                    _ => None,
                })
                .collect();
            addresses.sort();
            addresses.dedup();
            match addresses.len() {
                0 => base.clone(),
                1 => AddressSpec::Single(addresses[0]),
                _ => AddressSpec::Set(addresses.into_iter().collect()),
            }
        }
    }
}

fn values_to_topic_spec(base: &TopicSpec, values: Vec<B256>) -> TopicSpec {
    match base {
        TopicSpec::Any => TopicSpec::Any,
        _ => {
            let mut values = values;
            values.sort();
            values.dedup();
            match values.len() {
                0 => base.clone(),
                1 => TopicSpec::Single(values[0]),
                _ => TopicSpec::Set(values.into_iter().collect()),
            }
        }
    }
}

/// Invert `decompose` over a (possibly narrowed) fragment list.
///
/// When the store reports coverage for only a subset of a filter's
/// fragments, the driver rebuilds a filter over exactly that subset to know
/// which values still need fetching.
pub fn recover_filter(base: &Filter, fragments: &[Fragment]) -> Filter {
    match base {
        Filter::Block(_) => base.clone(),
        Filter::Transaction(f) => {
            let mut from_tokens = Vec::new();
            let mut to_tokens = Vec::new();
            for fragment in fragments {
                if let Fragment::Transaction { from, to, .. } = fragment {
                    from_tokens.push(from.clone());
                    to_tokens.push(to.clone());
                }
            }
            let mut out = f.clone();
            out.from_address = tokens_to_address_spec(&f.from_address, from_tokens);
            out.to_address = tokens_to_address_spec(&f.to_address, to_tokens);
            Filter::Transaction(out)
        }
        Filter::Log(f) => {
            let mut addr_tokens = Vec::new();
            let (mut t1, mut t2, mut t3) = (Vec::new(), Vec::new(), Vec::new());
            for fragment in fragments {
                if let Fragment::Log {
                    address,
                    topic1,
                    topic2,
                    topic3,
                    ..
                } = fragment
                {
                    addr_tokens.push(address.clone());
                    t1.extend(*topic1);
                    t2.extend(*topic2);
                    t3.extend(*topic3);
                }
            }
            let mut out = f.clone();
            out.address = tokens_to_address_spec(&f.address, addr_tokens);
            out.topic1 = values_to_topic_spec(&f.topic1, t1);
            out.topic2 = values_to_topic_spec(&f.topic2, t2);
            out.topic3 = values_to_topic_spec(&f.topic3, t3);
            Filter::Log(out)
        }
        Filter::Trace(f) => {
            let mut from_tokens = Vec::new();
            let mut to_tokens = Vec::new();
            let mut selectors = Vec::new();
            for fragment in fragments {
                if let Fragment::Trace {
                    from,
                    to,
                    function_selector,
                    ..
                } = fragment
                {
                    from_tokens.push(from.clone());
                    to_tokens.push(to.clone());
                    selectors.extend(*function_selector);
                }
            }
            let mut out = f.clone();
            out.from_address = tokens_to_address_spec(&f.from_address, from_tokens);
            out.to_address = tokens_to_address_spec(&f.to_address, to_tokens);
            if !matches!(f.function_selector, SelectorSpec::Any) {
                selectors.sort();
                selectors.dedup();
                out.function_selector = match selectors.len() {
                    0 => f.function_selector.clone(),
                    1 => SelectorSpec::Single(selectors[0]),
                    _ => SelectorSpec::Set(selectors.into_iter().collect()),
                };
            }
            Filter::Trace(out)
        }
        Filter::Transfer(f) => {
            let mut from_tokens = Vec::new();
            let mut to_tokens = Vec::new();
            for fragment in fragments {
                if let Fragment::Transfer { from, to, .. } = fragment {
                    from_tokens.push(from.clone());
                    to_tokens.push(to.clone());
                }
            }
            let mut out = f.clone();
            out.from_address = tokens_to_address_spec(&f.from_address, from_tokens);
            out.to_address = tokens_to_address_spec(&f.to_address, to_tokens);
            Filter::Transfer(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{log_filter_matches, LogFilter};
    use crate::store::LogRow;
    use alloy_primitives::{address, b256, Bytes};

    const ADDR_A: Address = address!("00000000000000000000000000000000000000aa");
    const ADDR_B: Address = address!("00000000000000000000000000000000000000bb");
    const T0: B256 = b256!("1010101010101010101010101010101010101010101010101010101010101010");
    const T1: B256 = b256!("2020202020202020202020202020202020202020202020202020202020202020");
    const T1B: B256 = b256!("3030303030303030303030303030303030303030303030303030303030303030");

    fn log_filter(address: AddressSpec, topic0: TopicSpec, topic1: TopicSpec) -> LogFilter {
        LogFilter {
            chain_id: 1,
            from_block: 0,
            to_block: None,
            address,
            topic0,
            topic1,
            topic2: TopicSpec::Any,
            topic3: TopicSpec::Any,
            include: Some(["log.address".to_string()].into_iter().collect()),
        }
    }

    #[test]
    fn block_fragment_id() {
        let filter = Filter::Block(crate::filter::BlockFilter {
            chain_id: 8453,
            from_block: 0,
            to_block: None,
            interval: 10,
            offset: 3,
            include: None,
        });
        let specs = decompose(&filter);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].fragment.id(), "block_8453_10_3");
        assert_eq!(specs[0].adjacent_ids, vec!["block_8453_10_3".to_string()]);
    }

    #[test]
    fn log_sets_cross_product_on_topic1_but_not_topic0() {
        let filter = Filter::Log(log_filter(
            AddressSpec::Set([ADDR_A, ADDR_B].into_iter().collect()),
            TopicSpec::Set([T0, T1].into_iter().collect()),
            TopicSpec::Set([T1, T1B].into_iter().collect()),
        ));
        let specs = decompose(&filter);
        // 2 addresses x 1 (topic0 collapses to null) x 2 topic1 values.
        assert_eq!(specs.len(), 4);
        for spec in &specs {
            if let Fragment::Log { topic0, .. } = &spec.fragment {
                assert_eq!(*topic0, None);
            } else {
                panic!("expected log fragment");
            }
        }
    }

    #[test]
    fn log_adjacents_enumerate_loosenings() {
        let filter = Filter::Log(log_filter(
            AddressSpec::Single(ADDR_A),
            TopicSpec::Single(T0),
            TopicSpec::Single(T1),
        ));
        let specs = decompose(&filter);
        assert_eq!(specs.len(), 1);
        let adjacents = &specs[0].adjacent_ids;
        // address x topic0 x topic1 each widen to {value, null}; receipt is
        // pinned at 0 but widens to 1 as well.
        assert_eq!(adjacents.len(), 2 * 2 * 2 * 2);
        assert!(adjacents.contains(&specs[0].fragment.id()));
        assert!(adjacents.contains(&"log_1_null_null_null_null_null_0".to_string()));
        assert!(adjacents.contains(&"log_1_null_null_null_null_null_1".to_string()));
    }

    #[test]
    fn receipt_wanting_fragment_has_no_receiptless_adjacent() {
        let mut f = log_filter(AddressSpec::Single(ADDR_A), TopicSpec::Any, TopicSpec::Any);
        f.include = Some(
            ["transactionReceipt.status".to_string()]
                .into_iter()
                .collect(),
        );
        let specs = decompose(&Filter::Log(f));
        for id in &specs[0].adjacent_ids {
            assert!(id.ends_with("_1"), "unexpected adjacent {id}");
        }
    }

    #[test]
    fn factory_fragment_id_round() {
        let factory = Factory {
            chain_id: 1,
            address: ADDR_A,
            event_selector: T0,
            child_location: ChildLocation::Topic(1),
            from_block: 5,
            to_block: None,
        };
        let spec = factory_fragment(&factory);
        assert_eq!(
            spec.fragment.id(),
            format!("factory_log_1_{ADDR_A:#x}_{T0:#x}_topic1_5_null")
        );
    }

    #[test]
    fn recovered_filter_is_sound() {
        // Any row accepted by a fragment-recovered filter must be accepted
        // by the original filter.
        let original = log_filter(
            AddressSpec::Set([ADDR_A, ADDR_B].into_iter().collect()),
            TopicSpec::Single(T0),
            TopicSpec::Set([T1, T1B].into_iter().collect()),
        );
        let specs = decompose(&Filter::Log(original.clone()));
        // Narrow to the fragments mentioning ADDR_A only.
        let narrowed: Vec<Fragment> = specs
            .iter()
            .map(|s| s.fragment.clone())
            .filter(|f| matches!(f, Fragment::Log { address: AddressToken::Address(a), .. } if *a == ADDR_A))
            .collect();
        let recovered = recover_filter(&Filter::Log(original.clone()), &narrowed);

        let mut rng = fastrand::Rng::with_seed(21);
        let addresses = [ADDR_A, ADDR_B, Address::ZERO];
        let topics = [Some(T0), Some(T1), Some(T1B), None];
        for _ in 0..500 {
            let row = LogRow {
                chain_id: 1,
                block_number: rng.u64(0..100),
                log_index: 0,
                transaction_index: 0,
                block_hash: B256::ZERO,
                transaction_hash: None,
                address: addresses[rng.usize(0..addresses.len())],
                topic0: topics[rng.usize(0..topics.len())],
                topic1: topics[rng.usize(0..topics.len())],
                topic2: None,
                topic3: None,
                data: Bytes::new(),
            };
            let recovered_filter = match &recovered {
                Filter::Log(f) => f,
                _ => unreachable!(),
            };
            if log_filter_matches(recovered_filter, &row) {
                assert!(log_filter_matches(&original, &row), "unsound for {row:?}");
            }
        }
    }

    #[test]
    fn transaction_fragment_tokens() {
        let filter = Filter::Transaction(crate::filter::TransactionFilter {
            chain_id: 1,
            from_block: 0,
            to_block: None,
            from_address: AddressSpec::Single(ADDR_A),
            to_address: AddressSpec::Any,
            include_reverted: false,
            include: None,
        });
        let specs = decompose(&filter);
        assert_eq!(specs.len(), 1);
        assert_eq!(
            specs[0].fragment.id(),
            format!("transaction_1_{ADDR_A:#x}_null")
        );
        assert_eq!(specs[0].adjacent_ids.len(), 2);
    }
}
