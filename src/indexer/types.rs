use alloy::primitives::{Address, B256};
use alloy::sol_types::SolEvent;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

use crate::indexer::decoder;

/// What kind of contract a scan target is; doubles as the checkpoint
/// source-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Factory,
    Pool,
    PositionManager,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Factory => "factory",
            TargetKind::Pool => "pool",
            TargetKind::PositionManager => "position_manager",
        }
    }
}

/// One thing being scanned. Immutable; the checkpoint for it lives under
/// (kind, lowercased address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanTarget {
    pub kind: TargetKind,
    pub address: Address,
    pub deployment_block: u64,
}

impl ScanTarget {
    pub fn new(kind: TargetKind, address: Address, deployment_block: u64) -> Self {
        Self {
            kind,
            address,
            deployment_block,
        }
    }

    pub fn scan_key(&self) -> String {
        self.address.to_string().to_lowercase()
    }

    /// Event signatures this target can emit.
    pub fn topics(&self) -> Vec<B256> {
        match self.kind {
            TargetKind::Factory => vec![decoder::PoolCreated::SIGNATURE_HASH],
            TargetKind::Pool => vec![
                decoder::Mint::SIGNATURE_HASH,
                decoder::Burn::SIGNATURE_HASH,
                decoder::Collect::SIGNATURE_HASH,
                decoder::Swap::SIGNATURE_HASH,
            ],
            TargetKind::PositionManager => vec![decoder::Transfer::SIGNATURE_HASH],
        }
    }
}

/// Flattened event row, ready for insertion. Nullable columns cover the
/// union of the per-variant payloads.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
    pub block_number: i64,
    pub tx_index: i32,
    pub address: Vec<u8>,
    pub pool: Option<Vec<u8>>,
    pub event_type: String,
    pub sender: Option<Vec<u8>>,
    pub owner: Option<Vec<u8>>,
    pub recipient: Option<Vec<u8>>,
    pub token_id: Option<BigDecimal>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
    pub amount: Option<BigDecimal>,
    pub amount0: Option<BigDecimal>,
    pub amount1: Option<BigDecimal>,
    pub sqrt_price_x96: Option<BigDecimal>,
    pub liquidity: Option<BigDecimal>,
    pub tick: Option<i32>,
    pub block_timestamp: Option<DateTime<Utc>>,
}

/// A pool discovered through a PoolCreated event, destined for the
/// registry table.
#[derive(Debug, Clone)]
pub struct PoolRow {
    pub address: Vec<u8>,
    pub factory: Vec<u8>,
    pub token0: Vec<u8>,
    pub token1: Vec<u8>,
    pub fee: i32,
    pub tick_spacing: Option<i32>,
    pub created_block: i64,
    pub created_tx: Vec<u8>,
}

/// Outcome of scanning one target.
#[derive(Debug, Default)]
pub struct TargetScanSummary {
    pub blocks_scanned: u64,
    pub rows_inserted: u64,
    pub duplicates_skipped: u64,
    pub discovered_pools: Vec<PoolRow>,
}

/// Aggregated outcome of a whole scan run, for the run log.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub targets: usize,
    pub targets_failed: usize,
    pub blocks_scanned: u64,
    pub rows_inserted: u64,
    pub duplicates_skipped: u64,
    pub elapsed_secs: f64,
    pub discovered_pools: Vec<PoolRow>,
}

impl RunSummary {
    pub fn absorb(&mut self, target: TargetScanSummary) {
        self.targets += 1;
        self.blocks_scanned += target.blocks_scanned;
        self.rows_inserted += target.rows_inserted;
        self.duplicates_skipped += target.duplicates_skipped;
        self.discovered_pools.extend(target.discovered_pools);
    }
}
