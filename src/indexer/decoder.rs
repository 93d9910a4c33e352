use alloy::primitives::{Address, Log, LogData, B256, I256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::source::RawLogRecord;

use super::types::EventRow;

// ============================================================
// Event signatures
// ============================================================

sol! {
    // Factory
    event PoolCreated(
        address indexed token0,
        address indexed token1,
        uint24 indexed fee,
        int24 tickSpacing,
        address pool
    );

    // Pool
    event Mint(
        address sender,
        address indexed owner,
        int24 indexed tickLower,
        int24 indexed tickUpper,
        uint128 amount,
        uint256 amount0,
        uint256 amount1
    );

    event Burn(
        address indexed owner,
        int24 indexed tickLower,
        int24 indexed tickUpper,
        uint128 amount,
        uint256 amount0,
        uint256 amount1
    );

    event Collect(
        address indexed owner,
        address recipient,
        int24 indexed tickLower,
        int24 indexed tickUpper,
        uint128 amount0,
        uint128 amount1
    );

    event Swap(
        address indexed sender,
        address indexed recipient,
        int256 amount0,
        int256 amount1,
        uint160 sqrtPriceX96,
        uint128 liquidity,
        int24 tick
    );

    // ERC-721 position token
    event Transfer(
        address indexed from,
        address indexed to,
        uint256 indexed tokenId
    );
}

// ============================================================
// Domain events
// ============================================================

/// A typed, decoded log. Every variant carries its own payload; the
/// surrounding `DecodedEvent` holds the storage key and block context.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    PoolCreated {
        token0: Address,
        token1: Address,
        fee: u32,
        tick_spacing: i32,
        pool: Address,
    },
    Mint {
        sender: Address,
        owner: Address,
        tick_lower: i32,
        tick_upper: i32,
        amount: BigDecimal,
        amount0: BigDecimal,
        amount1: BigDecimal,
    },
    Burn {
        owner: Address,
        tick_lower: i32,
        tick_upper: i32,
        amount: BigDecimal,
        amount0: BigDecimal,
        amount1: BigDecimal,
    },
    Collect {
        owner: Address,
        recipient: Address,
        tick_lower: i32,
        tick_upper: i32,
        amount0: BigDecimal,
        amount1: BigDecimal,
    },
    Swap {
        sender: Address,
        recipient: Address,
        amount0: BigDecimal,
        amount1: BigDecimal,
        sqrt_price_x96: BigDecimal,
        liquidity: BigDecimal,
        tick: i32,
    },
    Transfer {
        from: Address,
        to: Address,
        token_id: BigDecimal,
    },
}

impl DomainEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::PoolCreated { .. } => "pool_created",
            DomainEvent::Mint { .. } => "mint",
            DomainEvent::Burn { .. } => "burn",
            DomainEvent::Collect { .. } => "collect",
            DomainEvent::Swap { .. } => "swap",
            DomainEvent::Transfer { .. } => "transfer",
        }
    }
}

/// A decoded event plus its source back-reference: (tx_hash, log_index)
/// is the storage key.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub tx_hash: B256,
    pub log_index: u32,
    pub tx_index: u32,
    pub block_number: u64,
    pub address: Address,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: DomainEvent,
}

// ============================================================
// Decoding
// ============================================================

/// Decode a raw log against the known signature set. Unrecognized
/// signatures and argument parse failures are skipped with a warning
/// carrying the tx hash and contract address; neither aborts a batch.
pub fn decode(record: &RawLogRecord) -> Option<DecodedEvent> {
    let sig = record.topics.first()?;

    let inner = Log {
        address: record.address,
        data: LogData::new_unchecked(record.topics.clone(), record.data.clone()),
    };

    let kind = if *sig == PoolCreated::SIGNATURE_HASH {
        decode_pool_created(&inner)
    } else if *sig == Mint::SIGNATURE_HASH {
        decode_mint(&inner)
    } else if *sig == Burn::SIGNATURE_HASH {
        decode_burn(&inner)
    } else if *sig == Collect::SIGNATURE_HASH {
        decode_collect(&inner)
    } else if *sig == Swap::SIGNATURE_HASH {
        decode_swap(&inner)
    } else if *sig == Transfer::SIGNATURE_HASH {
        decode_transfer(&inner)
    } else {
        tracing::warn!(
            tx_hash = %record.tx_hash,
            address = %record.address,
            log_index = record.log_index,
            "Unrecognized event signature, skipping"
        );
        return None;
    };

    match kind {
        Some(kind) => Some(DecodedEvent {
            tx_hash: record.tx_hash,
            log_index: record.log_index,
            tx_index: record.tx_index,
            block_number: record.block_number,
            address: record.address,
            timestamp: record.timestamp,
            kind,
        }),
        None => {
            tracing::warn!(
                tx_hash = %record.tx_hash,
                address = %record.address,
                log_index = record.log_index,
                "Failed to decode event arguments, skipping"
            );
            None
        }
    }
}

pub fn decode_batch(records: &[RawLogRecord]) -> Vec<DecodedEvent> {
    records.iter().filter_map(decode).collect()
}

fn decode_pool_created(inner: &Log) -> Option<DomainEvent> {
    let decoded = PoolCreated::decode_log(inner).ok()?;
    Some(DomainEvent::PoolCreated {
        token0: decoded.token0,
        token1: decoded.token1,
        fee: parse_int(&decoded.fee)?,
        tick_spacing: parse_int(&decoded.tickSpacing)?,
        pool: decoded.pool,
    })
}

fn decode_mint(inner: &Log) -> Option<DomainEvent> {
    let decoded = Mint::decode_log(inner).ok()?;
    Some(DomainEvent::Mint {
        sender: decoded.sender,
        owner: decoded.owner,
        tick_lower: parse_int(&decoded.tickLower)?,
        tick_upper: parse_int(&decoded.tickUpper)?,
        amount: u128_to_bd(decoded.amount),
        amount0: u256_to_bd(decoded.amount0),
        amount1: u256_to_bd(decoded.amount1),
    })
}

fn decode_burn(inner: &Log) -> Option<DomainEvent> {
    let decoded = Burn::decode_log(inner).ok()?;
    Some(DomainEvent::Burn {
        owner: decoded.owner,
        tick_lower: parse_int(&decoded.tickLower)?,
        tick_upper: parse_int(&decoded.tickUpper)?,
        amount: u128_to_bd(decoded.amount),
        amount0: u256_to_bd(decoded.amount0),
        amount1: u256_to_bd(decoded.amount1),
    })
}

fn decode_collect(inner: &Log) -> Option<DomainEvent> {
    let decoded = Collect::decode_log(inner).ok()?;
    Some(DomainEvent::Collect {
        owner: decoded.owner,
        recipient: decoded.recipient,
        tick_lower: parse_int(&decoded.tickLower)?,
        tick_upper: parse_int(&decoded.tickUpper)?,
        amount0: u128_to_bd(decoded.amount0),
        amount1: u128_to_bd(decoded.amount1),
    })
}

fn decode_swap(inner: &Log) -> Option<DomainEvent> {
    let decoded = Swap::decode_log(inner).ok()?;
    Some(DomainEvent::Swap {
        sender: decoded.sender,
        recipient: decoded.recipient,
        amount0: i256_to_bd(decoded.amount0),
        amount1: i256_to_bd(decoded.amount1),
        sqrt_price_x96: bd_from_display(&decoded.sqrtPriceX96)?,
        liquidity: u128_to_bd(decoded.liquidity),
        tick: parse_int(&decoded.tick)?,
    })
}

fn decode_transfer(inner: &Log) -> Option<DomainEvent> {
    let decoded = Transfer::decode_log(inner).ok()?;
    Some(DomainEvent::Transfer {
        from: decoded.from,
        to: decoded.to,
        token_id: u256_to_bd(decoded.tokenId),
    })
}

// ============================================================
// Conversions
// ============================================================

fn u256_to_bd(value: U256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

fn i256_to_bd(value: I256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

fn u128_to_bd(value: u128) -> BigDecimal {
    BigDecimal::from(value)
}

fn bd_from_display<T: std::fmt::Display>(value: &T) -> Option<BigDecimal> {
    BigDecimal::from_str(&value.to_string()).ok()
}

/// Narrow a sized alloy integer (uint24/int24, rendered in decimal) into
/// a native int.
fn parse_int<T: std::fmt::Display, N: FromStr>(value: &T) -> Option<N> {
    value.to_string().parse().ok()
}

/// Flatten a decoded event into its storage row. Pool-emitted events set
/// `pool` to the emitting contract; PoolCreated rows point at the new
/// pool; position-token transfers stay unresolved until the attribution
/// job fills them in.
pub fn event_row(event: &DecodedEvent) -> EventRow {
    let mut row = EventRow {
        tx_hash: event.tx_hash.as_slice().to_vec(),
        log_index: event.log_index as i32,
        block_number: event.block_number as i64,
        tx_index: event.tx_index as i32,
        address: event.address.as_slice().to_vec(),
        pool: None,
        event_type: event.kind.type_name().to_string(),
        sender: None,
        owner: None,
        recipient: None,
        token_id: None,
        tick_lower: None,
        tick_upper: None,
        amount: None,
        amount0: None,
        amount1: None,
        sqrt_price_x96: None,
        liquidity: None,
        tick: None,
        block_timestamp: event.timestamp,
    };

    match &event.kind {
        DomainEvent::PoolCreated { pool, .. } => {
            row.pool = Some(pool.as_slice().to_vec());
        }
        DomainEvent::Mint {
            sender,
            owner,
            tick_lower,
            tick_upper,
            amount,
            amount0,
            amount1,
        } => {
            row.pool = Some(event.address.as_slice().to_vec());
            row.sender = Some(sender.as_slice().to_vec());
            row.owner = Some(owner.as_slice().to_vec());
            row.tick_lower = Some(*tick_lower);
            row.tick_upper = Some(*tick_upper);
            row.amount = Some(amount.clone());
            row.amount0 = Some(amount0.clone());
            row.amount1 = Some(amount1.clone());
        }
        DomainEvent::Burn {
            owner,
            tick_lower,
            tick_upper,
            amount,
            amount0,
            amount1,
        } => {
            row.pool = Some(event.address.as_slice().to_vec());
            row.owner = Some(owner.as_slice().to_vec());
            row.tick_lower = Some(*tick_lower);
            row.tick_upper = Some(*tick_upper);
            row.amount = Some(amount.clone());
            row.amount0 = Some(amount0.clone());
            row.amount1 = Some(amount1.clone());
        }
        DomainEvent::Collect {
            owner,
            recipient,
            tick_lower,
            tick_upper,
            amount0,
            amount1,
        } => {
            row.pool = Some(event.address.as_slice().to_vec());
            row.owner = Some(owner.as_slice().to_vec());
            row.recipient = Some(recipient.as_slice().to_vec());
            row.tick_lower = Some(*tick_lower);
            row.tick_upper = Some(*tick_upper);
            row.amount0 = Some(amount0.clone());
            row.amount1 = Some(amount1.clone());
        }
        DomainEvent::Swap {
            sender,
            recipient,
            amount0,
            amount1,
            sqrt_price_x96,
            liquidity,
            tick,
        } => {
            row.pool = Some(event.address.as_slice().to_vec());
            row.sender = Some(sender.as_slice().to_vec());
            row.recipient = Some(recipient.as_slice().to_vec());
            row.amount0 = Some(amount0.clone());
            row.amount1 = Some(amount1.clone());
            row.sqrt_price_x96 = Some(sqrt_price_x96.clone());
            row.liquidity = Some(liquidity.clone());
            row.tick = Some(*tick);
        }
        DomainEvent::Transfer { from, to, token_id } => {
            row.sender = Some(from.as_slice().to_vec());
            row.recipient = Some(to.as_slice().to_vec());
            row.token_id = Some(token_id.clone());
        }
    }

    row
}
