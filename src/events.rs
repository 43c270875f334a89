//! Event assembly and decoding.
//!
//! The assembler walks persisted rows in onchain execution order and produces
//! raw events whose checkpoint order is a construction invariant: per block,
//! transactions by index, each transaction's logs then traces by their own
//! indices, and block events last (they carry the maximum transaction index).
//! The decoder then turns raw events into named, ABI-decoded events; rows
//! that fail to decode are logged and dropped, so the output may be shorter
//! than the input.

use std::collections::{BTreeMap, HashMap};

use alloy_dyn_abi::{DynSolValue, EventExt, FunctionExt};
use alloy_json_abi::JsonAbiExt;
use alloy_primitives::{Address, U256};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::checkpoint::{
    Checkpoint, EVENT_TYPE_BLOCK, EVENT_TYPE_LOG, EVENT_TYPE_TRACE, EVENT_TYPE_TRANSACTION,
    MAX_FIELD,
};
use crate::filter::{
    block_filter_matches, is_address_matched, log_filter_matches, should_get_transaction_receipt,
    trace_filter_matches, transaction_filter_matches, transfer_filter_matches, AddressSpec,
    ChildAddresses, Filter,
};
use crate::fragments::factory_id;
use crate::source::{Source, SourceKind};
use crate::store::{BlockRow, LogRow, RangeRows, TraceRow, TransactionReceiptRow, TransactionRow};

/// An assembled but not yet decoded event row.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub chain_id: u64,
    pub source_index: usize,
    pub checkpoint: Checkpoint,
    pub block: BlockRow,
    pub transaction: Option<TransactionRow>,
    pub transaction_receipt: Option<TransactionReceiptRow>,
    pub log: Option<LogRow>,
    pub trace: Option<TraceRow>,
}

/// Native value transfer lifted out of a matching trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferData {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
}

/// A decoded event, ready for the downstream handler runtime.
#[derive(Debug, Clone)]
pub struct Event {
    /// `{source}:{event}` style name per the assembly rules.
    pub name: String,
    /// Encoded checkpoint; doubles as the event id.
    pub id: String,
    pub checkpoint: Checkpoint,
    pub chain_id: u64,
    pub source_index: usize,
    /// ABI-decoded arguments for log and trace events.
    pub args: Option<Value>,
    pub transfer: Option<TransferData>,
    /// The trace filter's declared call type. Tags the output only; it is
    /// never consulted during matching.
    pub call_type: Option<String>,
    pub block: BlockRow,
    pub transaction: Option<TransactionRow>,
    pub transaction_receipt: Option<TransactionReceiptRow>,
    pub log: Option<LogRow>,
    pub trace: Option<TraceRow>,
}

/// Per-block slice of a sorted event stream.
#[derive(Debug, Clone)]
pub struct EventBlockGroup {
    /// Upper bound checkpoint a downstream transaction can commit at: the
    /// block's saturated checkpoint.
    pub checkpoint: String,
    pub events: Vec<Event>,
}

/// Child-address maps keyed by factory fragment id.
pub type ChildAddressMaps = HashMap<String, ChildAddresses>;

fn factory_field_visible(
    spec: &AddressSpec,
    address: Option<&Address>,
    block_number: u64,
    children: &ChildAddressMaps,
) -> bool {
    let factory = match spec {
        AddressSpec::Factory(f) => f,
        _ => return true,
    };
    let Some(address) = address else {
        return false;
    };
    let empty = ChildAddresses::new();
    let known = children.get(&factory_id(factory)).unwrap_or(&empty);
    is_address_matched(address, block_number, known)
}

fn reverted(receipt: Option<&TransactionReceiptRow>, trace: Option<&TraceRow>) -> bool {
    if let Some(trace) = trace {
        if trace.error.is_some() {
            return true;
        }
    }
    receipt.map(|r| !r.status).unwrap_or(false)
}

struct BlockBundle<'a> {
    block: &'a BlockRow,
    transactions: BTreeMap<u64, &'a TransactionRow>,
    receipts: BTreeMap<u64, &'a TransactionReceiptRow>,
    logs: BTreeMap<u64, Vec<&'a LogRow>>,
    traces: BTreeMap<u64, Vec<&'a TraceRow>>,
}

fn bundle_rows(rows: &RangeRows) -> Vec<BlockBundle<'_>> {
    let mut by_number: BTreeMap<u64, BlockBundle<'_>> = BTreeMap::new();
    for block in &rows.blocks {
        by_number.insert(
            block.number,
            BlockBundle {
                block,
                transactions: BTreeMap::new(),
                receipts: BTreeMap::new(),
                logs: BTreeMap::new(),
                traces: BTreeMap::new(),
            },
        );
    }
    for tx in &rows.transactions {
        if let Some(bundle) = by_number.get_mut(&tx.block_number) {
            bundle.transactions.insert(tx.transaction_index, tx);
        }
    }
    for receipt in &rows.receipts {
        if let Some(bundle) = by_number.get_mut(&receipt.block_number) {
            bundle.receipts.insert(receipt.transaction_index, receipt);
        }
    }
    for log in &rows.logs {
        if let Some(bundle) = by_number.get_mut(&log.block_number) {
            bundle
                .logs
                .entry(log.transaction_index)
                .or_default()
                .push(log);
        }
    }
    for trace in &rows.traces {
        if let Some(bundle) = by_number.get_mut(&trace.block_number) {
            bundle
                .traces
                .entry(trace.transaction_index)
                .or_default()
                .push(trace);
        }
    }
    for bundle in by_number.values_mut() {
        for logs in bundle.logs.values_mut() {
            logs.sort_by_key(|l| l.log_index);
        }
        for traces in bundle.traces.values_mut() {
            traces.sort_by_key(|t| t.trace_index);
        }
    }
    by_number.into_values().collect()
}

/// Assemble raw events for every source over a window of persisted rows.
///
/// The result is checkpoint-ordered without a final sort.
pub fn assemble_range(
    sources: &[Source],
    children: &ChildAddressMaps,
    rows: &RangeRows,
) -> Vec<RawEvent> {
    let mut out = Vec::new();
    for bundle in bundle_rows(rows) {
        assemble_block(sources, children, &bundle, &mut out);
    }
    out
}

fn assemble_block(
    sources: &[Source],
    children: &ChildAddressMaps,
    bundle: &BlockBundle<'_>,
    out: &mut Vec<RawEvent>,
) {
    let block = bundle.block;

    // Transaction indices can come from transactions, logs or traces: on some
    // chains a log has no transaction row at all.
    let mut tx_indices: Vec<u64> = bundle
        .transactions
        .keys()
        .chain(bundle.logs.keys())
        .chain(bundle.traces.keys())
        .copied()
        .collect();
    tx_indices.sort_unstable();
    tx_indices.dedup();

    for tx_index in tx_indices {
        let transaction = bundle.transactions.get(&tx_index).copied();
        let receipt = bundle.receipts.get(&tx_index).copied();

        if let Some(tx) = transaction {
            for (source_index, source) in sources.iter().enumerate() {
                let Filter::Transaction(f) = &source.filter else {
                    continue;
                };
                if !transaction_filter_matches(f, tx)
                    || !factory_field_visible(
                        &f.from_address,
                        Some(&tx.from),
                        block.number,
                        children,
                    )
                    || !factory_field_visible(
                        &f.to_address,
                        tx.to.as_ref(),
                        block.number,
                        children,
                    )
                {
                    continue;
                }
                if !f.include_reverted && reverted(receipt, None) {
                    continue;
                }
                out.push(RawEvent {
                    chain_id: block.chain_id,
                    source_index,
                    checkpoint: Checkpoint {
                        block_timestamp: block.timestamp,
                        chain_id: block.chain_id,
                        block_number: block.number,
                        transaction_index: tx_index,
                        event_type: EVENT_TYPE_TRANSACTION,
                        event_index: 0,
                    },
                    block: block.clone(),
                    transaction: Some(tx.clone()),
                    transaction_receipt: receipt.cloned(),
                    log: None,
                    trace: None,
                });
            }
        }

        for &log in bundle.logs.get(&tx_index).into_iter().flatten() {
            for (source_index, source) in sources.iter().enumerate() {
                let Filter::Log(f) = &source.filter else {
                    continue;
                };
                if !log_filter_matches(f, log)
                    || !factory_field_visible(
                        &f.address,
                        Some(&log.address),
                        block.number,
                        children,
                    )
                {
                    continue;
                }
                let wants_receipt = should_get_transaction_receipt(&source.filter);
                out.push(RawEvent {
                    chain_id: block.chain_id,
                    source_index,
                    checkpoint: Checkpoint {
                        block_timestamp: block.timestamp,
                        chain_id: block.chain_id,
                        block_number: block.number,
                        transaction_index: tx_index,
                        event_type: EVENT_TYPE_LOG,
                        event_index: log.log_index,
                    },
                    block: block.clone(),
                    transaction: transaction.cloned(),
                    transaction_receipt: wants_receipt.then(|| receipt.cloned()).flatten(),
                    log: Some(log.clone()),
                    trace: None,
                });
            }
        }

        for &trace in bundle.traces.get(&tx_index).into_iter().flatten() {
            for (source_index, source) in sources.iter().enumerate() {
                match &source.filter {
                    Filter::Trace(f) => {
                        if !trace_filter_matches(f, trace)
                            || !factory_field_visible(
                                &f.from_address,
                                Some(&trace.from),
                                block.number,
                                children,
                            )
                            || !factory_field_visible(
                                &f.to_address,
                                trace.to.as_ref(),
                                block.number,
                                children,
                            )
                        {
                            continue;
                        }
                        if !f.include_reverted && reverted(receipt, Some(trace)) {
                            continue;
                        }
                    }
                    Filter::Transfer(f) => {
                        if !transfer_filter_matches(f, trace)
                            || !factory_field_visible(
                                &f.from_address,
                                Some(&trace.from),
                                block.number,
                                children,
                            )
                            || !factory_field_visible(
                                &f.to_address,
                                trace.to.as_ref(),
                                block.number,
                                children,
                            )
                        {
                            continue;
                        }
                        if !f.include_reverted && reverted(receipt, Some(trace)) {
                            continue;
                        }
                    }
                    _ => continue,
                }
                let wants_receipt = should_get_transaction_receipt(&source.filter);
                out.push(RawEvent {
                    chain_id: block.chain_id,
                    source_index,
                    checkpoint: Checkpoint {
                        block_timestamp: block.timestamp,
                        chain_id: block.chain_id,
                        block_number: block.number,
                        transaction_index: tx_index,
                        event_type: EVENT_TYPE_TRACE,
                        event_index: trace.trace_index,
                    },
                    block: block.clone(),
                    transaction: transaction.cloned(),
                    transaction_receipt: wants_receipt.then(|| receipt.cloned()).flatten(),
                    log: None,
                    trace: Some(trace.clone()),
                });
            }
        }
    }

    for (source_index, source) in sources.iter().enumerate() {
        let Filter::Block(f) = &source.filter else {
            continue;
        };
        if !block_filter_matches(f, block) {
            continue;
        }
        out.push(RawEvent {
            chain_id: block.chain_id,
            source_index,
            checkpoint: Checkpoint {
                block_timestamp: block.timestamp,
                chain_id: block.chain_id,
                block_number: block.number,
                transaction_index: MAX_FIELD,
                event_type: EVENT_TYPE_BLOCK,
                event_index: 0,
            },
            block: block.clone(),
            transaction: None,
            transaction_receipt: None,
            log: None,
            trace: None,
        });
    }
}

fn dyn_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Int(i, _) => json!(i.to_string()),
        DynSolValue::Uint(u, _) => json!(u.to_string()),
        DynSolValue::FixedBytes(bytes, size) => json!(format!(
            "0x{}",
            alloy_primitives::hex::encode(&bytes.as_slice()[..*size])
        )),
        DynSolValue::Address(a) => json!(format!("{a:#x}")),
        DynSolValue::Function(f) => json!(format!("{:#x}", f.as_address_and_selector().0)),
        DynSolValue::Bytes(b) => json!(format!("0x{}", alloy_primitives::hex::encode(b))),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.iter().map(dyn_to_json).collect())
        }
        DynSolValue::Tuple(items) => Value::Array(items.iter().map(dyn_to_json).collect()),
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}

fn is_address_scoped(filter: &Filter) -> bool {
    match filter {
        Filter::Log(f) => !matches!(f.address, AddressSpec::Any),
        Filter::Trace(f) => {
            !matches!(f.from_address, AddressSpec::Any)
                || !matches!(f.to_address, AddressSpec::Any)
        }
        _ => false,
    }
}

fn decode_log_args(source: &Source, log: &LogRow) -> Result<Value, String> {
    let selector = log.topic0.ok_or("log has no topic0")?;
    let abi_event = source
        .abi
        .events
        .get(&selector)
        .ok_or_else(|| format!("no ABI event for selector {selector:#x}"))?;
    let decoded = abi_event
        .decode_log_parts(log.topics().into_iter(), &log.data)
        .map_err(|e| e.to_string())?;
    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let mut args = serde_json::Map::new();
    for input in &abi_event.inputs {
        let value = if input.indexed {
            indexed.next()
        } else {
            body.next()
        }
        .ok_or("decoded parameter count mismatch")?;
        args.insert(input.name.clone(), dyn_to_json(&value));
    }
    Ok(Value::Object(args))
}

fn decode_trace_args(source: &Source, trace: &TraceRow) -> Result<(String, Value), String> {
    if trace.input.len() < 4 {
        return Err("trace input shorter than a selector".into());
    }
    let selector = alloy_primitives::FixedBytes::<4>::from_slice(&trace.input[..4]);
    let function = source
        .abi
        .functions
        .get(&selector)
        .ok_or_else(|| format!("no ABI function for selector {selector:#x}"))?;
    let decoded = function
        .abi_decode_input(&trace.input[4..])
        .map_err(|e| e.to_string())?;
    let mut args = serde_json::Map::new();
    for (input, value) in function.inputs.iter().zip(decoded.iter()) {
        args.insert(input.name.clone(), dyn_to_json(value));
    }
    Ok((function.name.clone(), Value::Object(args)))
}

/// Decode one raw event. `None` means the event is dropped (ABI mismatch or
/// a source kind that cannot produce this row shape).
pub fn decode_event(sources: &[Source], raw: RawEvent) -> Option<Event> {
    let source = &sources[raw.source_index];
    let call_type = match &source.filter {
        Filter::Trace(f) => f.call_type.clone(),
        _ => None,
    };
    let (name, args, transfer) = match (&source.filter, &raw.log, &raw.trace) {
        (Filter::Log(_), Some(log), _) => match decode_log_args(source, log) {
            Ok(args) => {
                let event_name = source
                    .abi
                    .events
                    .get(&log.topic0.unwrap_or_default())
                    .map(|e| e.name.clone())
                    .unwrap_or_default();
                (format!("{}:{}", source.name, event_name), Some(args), None)
            }
            Err(reason) => {
                if is_address_scoped(&source.filter) {
                    warn!(source = %source.name, %reason, "failed to decode log, skipping event");
                } else {
                    debug!(source = %source.name, %reason, "failed to decode log, skipping event");
                }
                return None;
            }
        },
        (Filter::Trace(_), _, Some(trace)) => match decode_trace_args(source, trace) {
            Ok((function_name, args)) => (
                format!("{}.{}()", source.name, function_name),
                Some(args),
                None,
            ),
            Err(reason) => {
                if is_address_scoped(&source.filter) {
                    warn!(source = %source.name, %reason, "failed to decode trace, skipping event");
                } else {
                    debug!(source = %source.name, %reason, "failed to decode trace, skipping event");
                }
                return None;
            }
        },
        (Filter::Transaction(_), _, _) => (
            format!(
                "{}:transaction:{}",
                source.name,
                source.account_direction()
            ),
            None,
            None,
        ),
        (Filter::Transfer(_), _, Some(trace)) => {
            let transfer = TransferData {
                from: trace.from,
                to: trace.to,
                value: trace.value.unwrap_or(U256::ZERO),
            };
            (
                format!("{}:transfer:{}", source.name, source.account_direction()),
                None,
                Some(transfer),
            )
        }
        (Filter::Block(_), _, _) => (format!("{}:block", source.name), None, None),
        _ => return None,
    };

    debug_assert!(source.kind != SourceKind::Contract || args.is_some());

    Some(Event {
        name,
        id: raw.checkpoint.encode(),
        checkpoint: raw.checkpoint,
        chain_id: raw.chain_id,
        source_index: raw.source_index,
        args,
        transfer,
        call_type,
        block: raw.block,
        transaction: raw.transaction,
        transaction_receipt: raw.transaction_receipt,
        log: raw.log,
        trace: raw.trace,
    })
}

/// Decode a raw event batch, dropping undecodable rows.
pub fn decode_events(sources: &[Source], raw: Vec<RawEvent>) -> Vec<Event> {
    raw.into_iter()
        .filter_map(|event| decode_event(sources, event))
        .collect()
}

/// Group a sorted event stream by block hash. Each group carries the block's
/// saturated checkpoint, the safe commit position for that block.
pub fn split_events(events: Vec<Event>) -> Vec<EventBlockGroup> {
    let mut out: Vec<EventBlockGroup> = Vec::new();
    let mut current_hash = None;
    for event in events {
        let bound =
            Checkpoint::block_bound(event.block.timestamp, event.chain_id, event.block.number)
                .encode();
        if current_hash != Some(event.block.hash) {
            current_hash = Some(event.block.hash);
            out.push(EventBlockGroup {
                checkpoint: bound,
                events: Vec::new(),
            });
        }
        out.last_mut().expect("group exists").events.push(event);
    }
    out
}
