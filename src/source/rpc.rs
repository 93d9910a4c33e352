use std::collections::HashMap;
use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::client::{RateLimitedClient, DEFAULT_RETRYABLE_STATUSES};

use super::explorer::{parse_hex_bytes, parse_quantity};
use super::types::{canonicalize, chunk_ranges, LogQuery, RawLogRecord};
use super::LogSource;

/// Raw JSON-RPC log source: `eth_getLogs` per chunk with hex-encoded
/// block numbers. Also exposes the chain tip (`eth_blockNumber`), block
/// timestamps (`eth_getBlockByNumber`, cached) and `eth_call` for the
/// attribution job's on-chain reads.
pub struct RpcLogSource {
    client: RateLimitedClient,
    url: String,
    chunk_size: u64,
    timestamp_cache: Mutex<HashMap<u64, DateTime<Utc>>>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcLogEntry {
    address: String,
    topics: Vec<String>,
    data: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(default, rename = "transactionIndex")]
    transaction_index: Option<String>,
    #[serde(rename = "logIndex")]
    log_index: String,
}

impl RpcLogSource {
    pub fn new(client: RateLimitedClient, url: String, chunk_size: u64) -> Self {
        Self {
            client,
            url,
            chunk_size,
            timestamp_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Issue one JSON-RPC 2.0 call and unwrap the `{result | error}`
    /// envelope.
    async fn rpc_call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> eyre::Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let url = self.url.clone();

        let response = self
            .client
            .execute(
                move |http| http.post(&url).json(&body),
                method,
                DEFAULT_RETRYABLE_STATUSES,
            )
            .await?;

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| eyre::eyre!("{} returned malformed JSON: {}", method, e))?;

        if let Some(error) = envelope.error {
            return Err(eyre::eyre!(
                "{} failed: {} (code {})",
                method,
                error.message,
                error.code
            ));
        }
        envelope
            .result
            .ok_or_else(|| eyre::eyre!("{} response missing result", method))
    }

    pub async fn fetch_latest_block_number(&self) -> eyre::Result<u64> {
        let result = self.rpc_call("eth_blockNumber", serde_json::json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| eyre::eyre!("eth_blockNumber result is not a string"))?;
        parse_quantity(raw)
    }

    /// Block timestamp, cached per instance.
    pub async fn block_timestamp(&self, block_number: u64) -> eyre::Result<DateTime<Utc>> {
        if let Some(ts) = self.timestamp_cache.lock().await.get(&block_number) {
            return Ok(*ts);
        }

        let result = self
            .rpc_call(
                "eth_getBlockByNumber",
                serde_json::json!([to_hex(block_number), false]),
            )
            .await?;
        let raw = result
            .get("timestamp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| eyre::eyre!("Block {} missing timestamp", block_number))?;
        let secs = parse_quantity(raw)?;
        let ts = DateTime::<Utc>::from_timestamp(secs as i64, 0)
            .ok_or_else(|| eyre::eyre!("Block {} timestamp out of range", block_number))?;

        self.timestamp_cache.lock().await.insert(block_number, ts);
        Ok(ts)
    }

    /// `eth_call` against the latest block; used for position/factory
    /// lookups during pool attribution.
    pub async fn call(&self, to: Address, data: Bytes) -> eyre::Result<Bytes> {
        let result = self
            .rpc_call(
                "eth_call",
                serde_json::json!([
                    { "to": to.to_string(), "data": format!("0x{}", hex::encode(&data)) },
                    "latest"
                ]),
            )
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| eyre::eyre!("eth_call result is not a string"))?;
        parse_hex_bytes(raw)
    }

    async fn fetch_chunk(
        &self,
        query: &LogQuery,
        from: u64,
        to: u64,
    ) -> eyre::Result<Vec<RawLogRecord>> {
        let mut filter = serde_json::json!({
            "address": query.address.to_string(),
            "fromBlock": to_hex(from),
            "toBlock": to_hex(to),
        });
        if !query.topics.is_empty() {
            let alternatives: Vec<String> =
                query.topics.iter().map(|t| t.to_string()).collect();
            filter["topics"] = serde_json::json!([alternatives]);
        }

        let result = self
            .rpc_call("eth_getLogs", serde_json::json!([filter]))
            .await?;
        let entries: Vec<RpcLogEntry> = serde_json::from_value(result)
            .map_err(|e| eyre::eyre!("eth_getLogs result malformed: {}", e))?;

        entries.iter().map(normalize_entry).collect()
    }

    /// Resolve timestamps for every distinct block in the batch through
    /// the per-instance cache.
    async fn fill_timestamps(&self, records: &mut [RawLogRecord]) -> eyre::Result<()> {
        for record in records.iter_mut() {
            if record.timestamp.is_none() {
                record.timestamp = Some(self.block_timestamp(record.block_number).await?);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn fetch_logs(&self, query: &LogQuery) -> eyre::Result<Vec<RawLogRecord>> {
        let mut records = Vec::new();
        for (from, to) in chunk_ranges(query.from_block, query.to_block, self.chunk_size) {
            records.extend(self.fetch_chunk(query, from, to).await?);
        }

        let mut records = canonicalize(records);
        self.fill_timestamps(&mut records).await?;
        Ok(records)
    }
}

fn to_hex(value: u64) -> String {
    format!("0x{:x}", value)
}

fn normalize_entry(entry: &RpcLogEntry) -> eyre::Result<RawLogRecord> {
    let topics = entry
        .topics
        .iter()
        .map(|t| B256::from_str(t).map_err(|e| eyre::eyre!("Bad topic '{}': {}", t, e)))
        .collect::<eyre::Result<Vec<_>>>()?;

    Ok(RawLogRecord {
        address: Address::from_str(&entry.address)
            .map_err(|e| eyre::eyre!("Bad address '{}': {}", entry.address, e))?,
        topics,
        data: parse_hex_bytes(&entry.data)?,
        block_number: parse_quantity(&entry.block_number)?,
        tx_hash: B256::from_str(&entry.transaction_hash)
            .map_err(|e| eyre::eyre!("Bad tx hash '{}': {}", entry.transaction_hash, e))?,
        tx_index: entry
            .transaction_index
            .as_deref()
            .map(parse_quantity)
            .transpose()?
            .unwrap_or(0) as u32,
        log_index: parse_quantity(&entry.log_index)? as u32,
        timestamp: None,
    })
}
