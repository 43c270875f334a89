//! SQLite-backed sync store.
//!
//! One connection behind a mutex; writers batch related rows into a single
//! transaction. Hashes, addresses and wide integers are stored as lowercase
//! hex text, interval sets as a JSON payload column.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::SyncError;
use crate::intervals::{Interval, IntervalSet};

use super::{
    BlockRow, ChildAddressRow, LogRow, RangeRows, SyncStore, TraceRow, TransactionReceiptRow,
    TransactionRow,
};

pub struct SqliteStore {
    connection: Mutex<Connection>,
}

fn hex<T: std::fmt::LowerHex>(value: &T) -> String {
    format!("{value:#x}")
}

fn opt_hex<T: std::fmt::LowerHex>(value: &Option<T>) -> Option<String> {
    value.as_ref().map(hex)
}

fn parse<T: FromStr>(text: String) -> Result<T, SyncError> {
    text.parse::<T>()
        .map_err(|_| SyncError::Store(format!("unparseable column value: {text}")))
}

fn parse_opt<T: FromStr>(text: Option<String>) -> Result<Option<T>, SyncError> {
    text.map(parse).transpose()
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let connection = Connection::open(path)?;
        let store = Self {
            connection: Mutex::new(connection),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, SyncError> {
        let connection = Connection::open_in_memory()?;
        let store = Self {
            connection: Mutex::new(connection),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                chain_id INTEGER NOT NULL,
                number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                hash TEXT NOT NULL,
                parent_hash TEXT NOT NULL,
                logs_bloom TEXT NOT NULL,
                miner TEXT NOT NULL,
                gas_used INTEGER NOT NULL,
                gas_limit INTEGER NOT NULL,
                base_fee_per_gas INTEGER,
                nonce INTEGER,
                mix_hash TEXT,
                state_root TEXT NOT NULL,
                receipts_root TEXT NOT NULL,
                transactions_root TEXT NOT NULL,
                sha3_uncles TEXT,
                size INTEGER NOT NULL,
                difficulty TEXT NOT NULL,
                total_difficulty TEXT,
                extra_data TEXT NOT NULL,
                PRIMARY KEY (chain_id, hash)
            );
            CREATE INDEX IF NOT EXISTS idx_blocks_number ON blocks (chain_id, number);

            CREATE TABLE IF NOT EXISTS logs (
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                transaction_index INTEGER NOT NULL,
                block_hash TEXT NOT NULL,
                transaction_hash TEXT,
                address TEXT NOT NULL,
                topic0 TEXT,
                topic1 TEXT,
                topic2 TEXT,
                topic3 TEXT,
                data TEXT NOT NULL,
                PRIMARY KEY (chain_id, block_hash, log_index)
            );
            CREATE INDEX IF NOT EXISTS idx_logs_number ON logs (chain_id, block_number);

            CREATE TABLE IF NOT EXISTS transactions (
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                transaction_index INTEGER NOT NULL,
                hash TEXT NOT NULL,
                block_hash TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT,
                input TEXT NOT NULL,
                value TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                r TEXT,
                s TEXT,
                v TEXT,
                type INTEGER NOT NULL,
                gas INTEGER NOT NULL,
                gas_price TEXT,
                max_fee_per_gas TEXT,
                max_priority_fee_per_gas TEXT,
                access_list TEXT,
                PRIMARY KEY (chain_id, hash)
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_number
                ON transactions (chain_id, block_number);

            CREATE TABLE IF NOT EXISTS transaction_receipts (
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                transaction_index INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL,
                block_hash TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT,
                contract_address TEXT,
                logs_bloom TEXT NOT NULL,
                gas_used INTEGER NOT NULL,
                cumulative_gas_used INTEGER NOT NULL,
                effective_gas_price TEXT NOT NULL,
                status INTEGER NOT NULL,
                type INTEGER NOT NULL,
                PRIMARY KEY (chain_id, transaction_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_receipts_number
                ON transaction_receipts (chain_id, block_number);

            CREATE TABLE IF NOT EXISTS traces (
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                transaction_index INTEGER NOT NULL,
                trace_index INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT,
                input TEXT NOT NULL,
                output TEXT,
                value TEXT,
                type TEXT NOT NULL,
                gas INTEGER NOT NULL,
                gas_used INTEGER NOT NULL,
                error TEXT,
                revert_reason TEXT,
                subcalls INTEGER NOT NULL,
                PRIMARY KEY (chain_id, block_number, transaction_index, trace_index)
            );

            CREATE TABLE IF NOT EXISTS intervals (
                fragment_id TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                blocks TEXT NOT NULL,
                PRIMARY KEY (fragment_id, chain_id)
            );

            CREATE TABLE IF NOT EXISTS factories (
                chain_id INTEGER NOT NULL,
                id TEXT NOT NULL,
                factory_spec TEXT NOT NULL,
                PRIMARY KEY (chain_id, id)
            );

            CREATE TABLE IF NOT EXISTS factory_addresses (
                chain_id INTEGER NOT NULL,
                factory_id TEXT NOT NULL,
                address TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                PRIMARY KEY (chain_id, factory_id, address)
            );

            CREATE TABLE IF NOT EXISTS rpc_request_results (
                chain_id INTEGER NOT NULL,
                request_hash TEXT NOT NULL,
                block_number INTEGER,
                result TEXT NOT NULL,
                inserted_at INTEGER NOT NULL,
                PRIMARY KEY (chain_id, request_hash)
            );",
        )?;
        tx.commit()?;
        debug!("sync store schema initialized");
        Ok(())
    }
}

impl SyncStore for SqliteStore {
    fn insert_blocks(&self, blocks: &[BlockRow]) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        for b in blocks {
            tx.execute(
                "INSERT OR REPLACE INTO blocks (
                    chain_id, number, timestamp, hash, parent_hash, logs_bloom, miner,
                    gas_used, gas_limit, base_fee_per_gas, nonce, mix_hash, state_root,
                    receipts_root, transactions_root, sha3_uncles, size, difficulty,
                    total_difficulty, extra_data
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
                params![
                    b.chain_id,
                    b.number,
                    b.timestamp,
                    hex(&b.hash),
                    hex(&b.parent_hash),
                    hex(&b.logs_bloom),
                    hex(&b.miner),
                    b.gas_used,
                    b.gas_limit,
                    b.base_fee_per_gas,
                    b.nonce,
                    opt_hex(&b.mix_hash),
                    hex(&b.state_root),
                    hex(&b.receipts_root),
                    hex(&b.transactions_root),
                    opt_hex(&b.sha3_uncles),
                    b.size,
                    hex(&b.difficulty),
                    opt_hex(&b.total_difficulty),
                    hex(&b.extra_data),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_logs(&self, logs: &[LogRow]) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        for l in logs {
            tx.execute(
                "INSERT OR REPLACE INTO logs (
                    chain_id, block_number, log_index, transaction_index, block_hash,
                    transaction_hash, address, topic0, topic1, topic2, topic3, data
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    l.chain_id,
                    l.block_number,
                    l.log_index,
                    l.transaction_index,
                    hex(&l.block_hash),
                    opt_hex(&l.transaction_hash),
                    hex(&l.address),
                    opt_hex(&l.topic0),
                    opt_hex(&l.topic1),
                    opt_hex(&l.topic2),
                    opt_hex(&l.topic3),
                    hex(&l.data),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_transactions(&self, transactions: &[TransactionRow]) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        for t in transactions {
            tx.execute(
                "INSERT OR REPLACE INTO transactions (
                    chain_id, block_number, transaction_index, hash, block_hash,
                    from_address, to_address, input, value, nonce, r, s, v, type, gas,
                    gas_price, max_fee_per_gas, max_priority_fee_per_gas, access_list
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                params![
                    t.chain_id,
                    t.block_number,
                    t.transaction_index,
                    hex(&t.hash),
                    hex(&t.block_hash),
                    hex(&t.from),
                    opt_hex(&t.to),
                    hex(&t.input),
                    hex(&t.value),
                    t.nonce,
                    opt_hex(&t.r),
                    opt_hex(&t.s),
                    opt_hex(&t.v),
                    t.tx_type,
                    t.gas,
                    t.gas_price.map(|v| v.to_string()),
                    t.max_fee_per_gas.map(|v| v.to_string()),
                    t.max_priority_fee_per_gas.map(|v| v.to_string()),
                    t.access_list,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_receipts(&self, receipts: &[TransactionReceiptRow]) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        for r in receipts {
            tx.execute(
                "INSERT OR REPLACE INTO transaction_receipts (
                    chain_id, block_number, transaction_index, transaction_hash, block_hash,
                    from_address, to_address, contract_address, logs_bloom, gas_used,
                    cumulative_gas_used, effective_gas_price, status, type
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                params![
                    r.chain_id,
                    r.block_number,
                    r.transaction_index,
                    hex(&r.transaction_hash),
                    hex(&r.block_hash),
                    hex(&r.from),
                    opt_hex(&r.to),
                    opt_hex(&r.contract_address),
                    hex(&r.logs_bloom),
                    r.gas_used,
                    r.cumulative_gas_used,
                    r.effective_gas_price.to_string(),
                    r.status,
                    r.tx_type,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_traces(&self, traces: &[TraceRow]) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        for t in traces {
            tx.execute(
                "INSERT OR REPLACE INTO traces (
                    chain_id, block_number, transaction_index, trace_index, from_address,
                    to_address, input, output, value, type, gas, gas_used, error,
                    revert_reason, subcalls
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    t.chain_id,
                    t.block_number,
                    t.transaction_index,
                    t.trace_index,
                    hex(&t.from),
                    opt_hex(&t.to),
                    hex(&t.input),
                    opt_hex(&t.output),
                    opt_hex(&t.value),
                    t.trace_type,
                    t.gas,
                    t.gas_used,
                    t.error,
                    t.revert_reason,
                    t.subcalls,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_interval(
        &self,
        chain_id: u64,
        fragment_id: &str,
        interval: Interval,
    ) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT blocks FROM intervals WHERE fragment_id = ?1 AND chain_id = ?2",
                params![fragment_id, chain_id],
                |row| row.get(0),
            )
            .optional()?;
        let mut set = match existing {
            Some(json) => serde_json::from_str::<IntervalSet>(&json)?,
            None => IntervalSet::new(),
        };
        set.insert(interval);
        tx.execute(
            "INSERT OR REPLACE INTO intervals (fragment_id, chain_id, blocks) VALUES (?1, ?2, ?3)",
            params![fragment_id, chain_id, serde_json::to_string(&set)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_intervals(
        &self,
        chain_id: u64,
        fragment_ids: &[String],
    ) -> Result<IntervalSet, SyncError> {
        if fragment_ids.is_empty() {
            return Ok(IntervalSet::new());
        }
        let conn = self.connection.lock().unwrap();
        let placeholders = fragment_ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT blocks FROM intervals WHERE chain_id = ?1 AND fragment_id IN ({placeholders})"
        ))?;
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(chain_id)];
        for id in fragment_ids {
            params.push(Box::new(id.clone()));
        }
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get::<_, String>(0),
        )?;
        let mut out = IntervalSet::new();
        for row in rows {
            let set: IntervalSet = serde_json::from_str(&row?)?;
            out = out.union(&set);
        }
        Ok(out)
    }

    fn insert_factory(&self, chain_id: u64, factory_id: &str, spec: &str) -> Result<(), SyncError> {
        let conn = self.connection.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO factories (chain_id, id, factory_spec) VALUES (?1, ?2, ?3)",
            params![chain_id, factory_id, spec],
        )?;
        Ok(())
    }

    fn insert_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
        children: &[ChildAddressRow],
    ) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        for child in children {
            tx.execute(
                "INSERT INTO factory_addresses (chain_id, factory_id, address, block_number)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (chain_id, factory_id, address)
                 DO UPDATE SET block_number = MIN(block_number, ?4)",
                params![chain_id, factory_id, hex(&child.address), child.block_number],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
    ) -> Result<Vec<ChildAddressRow>, SyncError> {
        let conn = self.connection.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT address, block_number FROM factory_addresses
             WHERE chain_id = ?1 AND factory_id = ?2",
        )?;
        let rows = stmt.query_map(params![chain_id, factory_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (address, block_number) = row?;
            out.push(ChildAddressRow {
                address: parse(address)?,
                block_number,
            });
        }
        Ok(out)
    }

    fn read_range(&self, chain_id: u64, lo: u64, hi: u64) -> Result<RangeRows, SyncError> {
        let conn = self.connection.lock().unwrap();
        let mut rows = RangeRows::default();

        let mut stmt = conn.prepare(
            "SELECT chain_id, number, timestamp, hash, parent_hash, logs_bloom, miner,
                    gas_used, gas_limit, base_fee_per_gas, nonce, mix_hash, state_root,
                    receipts_root, transactions_root, sha3_uncles, size, difficulty,
                    total_difficulty, extra_data
             FROM blocks WHERE chain_id = ?1 AND number BETWEEN ?2 AND ?3
             ORDER BY number",
        )?;
        let block_rows = stmt.query_map(params![chain_id, lo, hi], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, u64>(7)?,
                row.get::<_, u64>(8)?,
                row.get::<_, Option<u64>>(9)?,
                row.get::<_, Option<u64>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, String>(12)?,
                row.get::<_, String>(13)?,
                row.get::<_, String>(14)?,
                row.get::<_, Option<String>>(15)?,
                (
                    row.get::<_, u64>(16)?,
                    row.get::<_, String>(17)?,
                    row.get::<_, Option<String>>(18)?,
                    row.get::<_, String>(19)?,
                ),
            ))
        })?;
        for row in block_rows {
            let (
                chain_id,
                number,
                timestamp,
                hash,
                parent_hash,
                logs_bloom,
                miner,
                gas_used,
                gas_limit,
                base_fee_per_gas,
                nonce,
                mix_hash,
                state_root,
                receipts_root,
                transactions_root,
                sha3_uncles,
                (size, difficulty, total_difficulty, extra_data),
            ) = row?;
            rows.blocks.push(BlockRow {
                chain_id,
                number,
                timestamp,
                hash: parse::<B256>(hash)?,
                parent_hash: parse::<B256>(parent_hash)?,
                logs_bloom: parse::<Bloom>(logs_bloom)?,
                miner: parse::<Address>(miner)?,
                gas_used,
                gas_limit,
                base_fee_per_gas,
                nonce,
                mix_hash: parse_opt::<B256>(mix_hash)?,
                state_root: parse::<B256>(state_root)?,
                receipts_root: parse::<B256>(receipts_root)?,
                transactions_root: parse::<B256>(transactions_root)?,
                sha3_uncles: parse_opt::<B256>(sha3_uncles)?,
                size,
                difficulty: parse::<U256>(difficulty)?,
                total_difficulty: parse_opt::<U256>(total_difficulty)?,
                extra_data: parse::<Bytes>(extra_data)?,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT chain_id, block_number, transaction_index, hash, block_hash, from_address,
                    to_address, input, value, nonce, r, s, v, type, gas, gas_price,
                    max_fee_per_gas, max_priority_fee_per_gas, access_list
             FROM transactions WHERE chain_id = ?1 AND block_number BETWEEN ?2 AND ?3
             ORDER BY block_number, transaction_index",
        )?;
        let tx_rows = stmt.query_map(params![chain_id, lo, hi], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, u64>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, Option<String>>(12)?,
                row.get::<_, u8>(13)?,
                row.get::<_, u64>(14)?,
                (
                    row.get::<_, Option<String>>(15)?,
                    row.get::<_, Option<String>>(16)?,
                    row.get::<_, Option<String>>(17)?,
                    row.get::<_, Option<String>>(18)?,
                ),
            ))
        })?;
        for row in tx_rows {
            let (
                chain_id,
                block_number,
                transaction_index,
                hash,
                block_hash,
                from,
                to,
                input,
                value,
                nonce,
                r,
                s,
                v,
                tx_type,
                gas,
                (gas_price, max_fee_per_gas, max_priority_fee_per_gas, access_list),
            ) = row?;
            rows.transactions.push(TransactionRow {
                chain_id,
                block_number,
                transaction_index,
                hash: parse::<B256>(hash)?,
                block_hash: parse::<B256>(block_hash)?,
                from: parse::<Address>(from)?,
                to: parse_opt::<Address>(to)?,
                input: parse::<Bytes>(input)?,
                value: parse::<U256>(value)?,
                nonce,
                r: parse_opt::<U256>(r)?,
                s: parse_opt::<U256>(s)?,
                v: parse_opt::<U256>(v)?,
                tx_type,
                gas,
                gas_price: parse_opt::<u128>(gas_price)?,
                max_fee_per_gas: parse_opt::<u128>(max_fee_per_gas)?,
                max_priority_fee_per_gas: parse_opt::<u128>(max_priority_fee_per_gas)?,
                access_list,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT chain_id, block_number, transaction_index, transaction_hash, block_hash,
                    from_address, to_address, contract_address, logs_bloom, gas_used,
                    cumulative_gas_used, effective_gas_price, status, type
             FROM transaction_receipts WHERE chain_id = ?1 AND block_number BETWEEN ?2 AND ?3
             ORDER BY block_number, transaction_index",
        )?;
        let receipt_rows = stmt.query_map(params![chain_id, lo, hi], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, u64>(9)?,
                row.get::<_, u64>(10)?,
                row.get::<_, String>(11)?,
                row.get::<_, bool>(12)?,
                row.get::<_, u8>(13)?,
            ))
        })?;
        for row in receipt_rows {
            let (
                chain_id,
                block_number,
                transaction_index,
                transaction_hash,
                block_hash,
                from,
                to,
                contract_address,
                logs_bloom,
                gas_used,
                cumulative_gas_used,
                effective_gas_price,
                status,
                tx_type,
            ) = row?;
            rows.receipts.push(TransactionReceiptRow {
                chain_id,
                block_number,
                transaction_index,
                transaction_hash: parse::<B256>(transaction_hash)?,
                block_hash: parse::<B256>(block_hash)?,
                from: parse::<Address>(from)?,
                to: parse_opt::<Address>(to)?,
                contract_address: parse_opt::<Address>(contract_address)?,
                logs_bloom: parse::<Bloom>(logs_bloom)?,
                gas_used,
                cumulative_gas_used,
                effective_gas_price: parse::<u128>(effective_gas_price)?,
                status,
                tx_type,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT chain_id, block_number, log_index, transaction_index, block_hash,
                    transaction_hash, address, topic0, topic1, topic2, topic3, data
             FROM logs WHERE chain_id = ?1 AND block_number BETWEEN ?2 AND ?3
             ORDER BY block_number, transaction_index, log_index",
        )?;
        let log_rows = stmt.query_map(params![chain_id, lo, hi], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;
        for row in log_rows {
            let (
                chain_id,
                block_number,
                log_index,
                transaction_index,
                block_hash,
                transaction_hash,
                address,
                topic0,
                topic1,
                topic2,
                topic3,
                data,
            ) = row?;
            rows.logs.push(LogRow {
                chain_id,
                block_number,
                log_index,
                transaction_index,
                block_hash: parse::<B256>(block_hash)?,
                transaction_hash: parse_opt::<B256>(transaction_hash)?,
                address: parse::<Address>(address)?,
                topic0: parse_opt::<B256>(topic0)?,
                topic1: parse_opt::<B256>(topic1)?,
                topic2: parse_opt::<B256>(topic2)?,
                topic3: parse_opt::<B256>(topic3)?,
                data: parse::<Bytes>(data)?,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT chain_id, block_number, transaction_index, trace_index, from_address,
                    to_address, input, output, value, type, gas, gas_used, error,
                    revert_reason, subcalls
             FROM traces WHERE chain_id = ?1 AND block_number BETWEEN ?2 AND ?3
             ORDER BY block_number, transaction_index, trace_index",
        )?;
        let trace_rows = stmt.query_map(params![chain_id, lo, hi], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, u64>(10)?,
                row.get::<_, u64>(11)?,
                row.get::<_, Option<String>>(12)?,
                row.get::<_, Option<String>>(13)?,
                row.get::<_, u64>(14)?,
            ))
        })?;
        for row in trace_rows {
            let (
                chain_id,
                block_number,
                transaction_index,
                trace_index,
                from,
                to,
                input,
                output,
                value,
                trace_type,
                gas,
                gas_used,
                error,
                revert_reason,
                subcalls,
            ) = row?;
            rows.traces.push(TraceRow {
                chain_id,
                block_number,
                transaction_index,
                trace_index,
                from: parse::<Address>(from)?,
                to: parse_opt::<Address>(to)?,
                input: parse::<Bytes>(input)?,
                output: parse_opt::<Bytes>(output)?,
                value: parse_opt::<U256>(value)?,
                trace_type,
                gas,
                gas_used,
                error,
                revert_reason,
                subcalls,
            });
        }

        Ok(rows)
    }

    fn delete_above(&self, chain_id: u64, block_number: u64) -> Result<(), SyncError> {
        let mut conn = self.connection.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM blocks WHERE chain_id = ?1 AND number > ?2",
            params![chain_id, block_number],
        )?;
        for table in ["logs", "transactions", "transaction_receipts", "traces"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE chain_id = ?1 AND block_number > ?2"),
                params![chain_id, block_number],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
    ) -> Result<Option<String>, SyncError> {
        let conn = self.connection.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT result FROM rpc_request_results
                 WHERE chain_id = ?1 AND request_hash = ?2",
                params![chain_id, request_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    fn insert_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
        block_number: Option<u64>,
        result: &str,
    ) -> Result<(), SyncError> {
        let conn = self.connection.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO rpc_request_results
             (chain_id, request_hash, block_number, result, inserted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chain_id,
                request_hash,
                block_number,
                result,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn block(number: u64) -> BlockRow {
        BlockRow {
            chain_id: 1,
            number,
            timestamp: number * 12,
            hash: B256::with_last_byte(number as u8),
            parent_hash: B256::with_last_byte(number.wrapping_sub(1) as u8),
            logs_bloom: Bloom::ZERO,
            miner: address!("00000000000000000000000000000000000000ee"),
            gas_used: 21_000,
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(7),
            nonce: Some(0),
            mix_hash: Some(B256::ZERO),
            state_root: B256::with_last_byte(1),
            receipts_root: B256::with_last_byte(2),
            transactions_root: B256::with_last_byte(3),
            sha3_uncles: None,
            size: 512,
            difficulty: U256::from(2u8),
            total_difficulty: None,
            extra_data: Bytes::from(vec![0xde, 0xad]),
        }
    }

    #[test]
    fn blocks_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let rows = vec![block(1), block(2), block(3)];
        store.insert_blocks(&rows).unwrap();
        let range = store.read_range(1, 1, 2).unwrap();
        assert_eq!(range.blocks, vec![block(1), block(2)]);
    }

    #[test]
    fn interval_union_on_write() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_interval(1, "frag", (0, 10)).unwrap();
        store.insert_interval(1, "frag", (5, 20)).unwrap();
        let set = store.get_intervals(1, &["frag".into()]).unwrap();
        assert_eq!(set.intervals(), &[(0, 20)]);
    }

    #[test]
    fn delete_above_evicts_reorged_rows() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_blocks(&[block(8), block(9), block(10)])
            .unwrap();
        store.delete_above(1, 9).unwrap();
        let range = store.read_range(1, 0, 100).unwrap();
        assert_eq!(
            range.blocks.iter().map(|b| b.number).collect::<Vec<_>>(),
            vec![8, 9]
        );
    }

    #[test]
    fn child_addresses_keep_min_block() {
        let store = SqliteStore::in_memory().unwrap();
        let addr = address!("00000000000000000000000000000000000000cc");
        store
            .insert_child_addresses(
                1,
                "f",
                &[ChildAddressRow {
                    address: addr,
                    block_number: 50,
                }],
            )
            .unwrap();
        store
            .insert_child_addresses(
                1,
                "f",
                &[ChildAddressRow {
                    address: addr,
                    block_number: 40,
                }],
            )
            .unwrap();
        let children = store.get_child_addresses(1, "f").unwrap();
        assert_eq!(children[0].block_number, 40);
    }
}
