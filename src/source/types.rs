use alloy::primitives::{Address, Bytes, B256};
use chrono::{DateTime, Utc};

/// Canonical post-adapter log shape. `(tx_hash, log_index)` is globally
/// unique once a batch has been through `canonicalize`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub tx_index: u32,
    pub log_index: u32,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A bounded, inclusive block-range request against one contract.
/// `topics` lists acceptable topic0 signatures (empty = unfiltered).
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub address: Address,
    pub from_block: u64,
    pub to_block: u64,
    pub topics: Vec<B256>,
}

/// Merge records from any number of chunk fetches: collapse duplicates
/// sharing (tx_hash, log_index) to one record, then order by
/// (block_number, log_index) ascending.
pub fn canonicalize(records: Vec<RawLogRecord>) -> Vec<RawLogRecord> {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<RawLogRecord> = records
        .into_iter()
        .filter(|r| seen.insert((r.tx_hash, r.log_index)))
        .collect();
    out.sort_by_key(|r| (r.block_number, r.log_index));
    out
}

/// Split an inclusive block range into inclusive chunks of at most `size`.
pub fn chunk_ranges(from: u64, to: u64, size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    if to < from || size == 0 {
        return ranges;
    }
    let mut current = from;
    while current <= to {
        let end = current.saturating_add(size - 1).min(to);
        ranges.push((current, end));
        if end == u64::MAX {
            break;
        }
        current = end + 1;
    }
    ranges
}
