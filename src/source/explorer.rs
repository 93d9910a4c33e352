use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::client::{RateLimitedClient, DEFAULT_RETRYABLE_STATUSES};

use super::types::{canonicalize, chunk_ranges, LogQuery, RawLogRecord};
use super::LogSource;

/// Explorer-API log source. Paginates a range into fixed-size block
/// chunks and POSTs each chunk to the explorer's /logs endpoint. Numeric
/// fields arrive as hex or decimal strings depending on the deployment;
/// everything is normalized before a record leaves this module.
pub struct ExplorerLogSource {
    client: RateLimitedClient,
    base_url: String,
    api_key: Option<String>,
    chunk_size: u64,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    items: Vec<ExplorerLogEntry>,
}

#[derive(Debug, Deserialize)]
struct ExplorerLogEntry {
    address: String,
    topics: Vec<String>,
    data: String,
    #[serde(alias = "blockNumber")]
    block_number: String,
    #[serde(alias = "transactionHash")]
    transaction_hash: String,
    #[serde(default, alias = "transactionIndex")]
    transaction_index: Option<String>,
    #[serde(alias = "logIndex")]
    log_index: String,
    #[serde(default, alias = "timeStamp")]
    time_stamp: Option<String>,
}

impl ExplorerLogSource {
    pub fn new(
        client: RateLimitedClient,
        base_url: String,
        api_key: Option<String>,
        chunk_size: u64,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            chunk_size,
        }
    }

    async fn fetch_chunk(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
        topic0: Option<B256>,
    ) -> eyre::Result<Vec<RawLogRecord>> {
        let url = format!("{}/logs", self.base_url);
        let mut topics = serde_json::Map::new();
        if let Some(topic) = topic0 {
            topics.insert("topic0".to_string(), serde_json::json!(topic.to_string()));
        }
        let body = serde_json::json!({
            "address": [address.to_string()],
            "from_block": from_block,
            "to_block": to_block,
            "topics": topics,
        });

        let description = format!("explorer logs {}..{}", from_block, to_block);
        let api_key = self.api_key.clone();
        let response = self
            .client
            .execute(
                move |http| {
                    let mut request = http.post(&url).json(&body);
                    if let Some(key) = &api_key {
                        request = request.header("x-api-key", key);
                    }
                    request
                },
                &description,
                DEFAULT_RETRYABLE_STATUSES,
            )
            .await?;

        let parsed: LogsResponse = response
            .json()
            .await
            .map_err(|e| eyre::eyre!("Explorer returned malformed JSON: {}", e))?;

        parsed.items.iter().map(normalize_entry).collect()
    }
}

#[async_trait]
impl LogSource for ExplorerLogSource {
    fn name(&self) -> &'static str {
        "explorer"
    }

    async fn fetch_logs(&self, query: &LogQuery) -> eyre::Result<Vec<RawLogRecord>> {
        let mut records = Vec::new();

        for (from, to) in chunk_ranges(query.from_block, query.to_block, self.chunk_size) {
            if query.topics.is_empty() {
                records.extend(self.fetch_chunk(query.address, from, to, None).await?);
            } else {
                // The explorer filters one signature per request.
                for topic in &query.topics {
                    records.extend(
                        self.fetch_chunk(query.address, from, to, Some(*topic)).await?,
                    );
                }
            }
        }

        Ok(canonicalize(records))
    }
}

fn normalize_entry(entry: &ExplorerLogEntry) -> eyre::Result<RawLogRecord> {
    let topics = entry
        .topics
        .iter()
        .map(|t| B256::from_str(t).map_err(|e| eyre::eyre!("Bad topic '{}': {}", t, e)))
        .collect::<eyre::Result<Vec<_>>>()?;

    let data = parse_hex_bytes(&entry.data)?;
    let timestamp = match &entry.time_stamp {
        Some(raw) => {
            let secs = parse_quantity(raw)?;
            DateTime::<Utc>::from_timestamp(secs as i64, 0)
        }
        None => None,
    };

    Ok(RawLogRecord {
        address: Address::from_str(&entry.address)
            .map_err(|e| eyre::eyre!("Bad address '{}': {}", entry.address, e))?,
        topics,
        data,
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
        timestamp,
    })
}

/// Parse an explorer numeric field that may be hex ("0x4d2") or decimal
/// ("1234").
pub(crate) fn parse_quantity(raw: &str) -> eyre::Result<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
            .map_err(|e| eyre::eyre!("Bad hex quantity '{}': {}", raw, e))
    } else {
        raw.parse::<u64>()
            .map_err(|e| eyre::eyre!("Bad decimal quantity '{}': {}", raw, e))
    }
}

pub(crate) fn parse_hex_bytes(raw: &str) -> eyre::Result<Bytes> {
    let stripped = raw.trim().trim_start_matches("0x");
    if stripped.is_empty() {
        return Ok(Bytes::new());
    }
    let bytes =
        hex::decode(stripped).map_err(|e| eyre::eyre!("Bad hex data '{}': {}", raw, e))?;
    Ok(Bytes::from(bytes))
}
