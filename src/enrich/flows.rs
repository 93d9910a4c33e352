use std::collections::{HashMap, HashSet};

use alloy::primitives::Address;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use super::prices::PriceService;
use super::{token_amount_usd, JobArgs, JobStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Deposit,
    Withdrawal,
    Fees,
}

/// One priced liquidity movement, ready for aggregation.
#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub wallet: Vec<u8>,
    pub pool: Vec<u8>,
    pub tx_hash: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub kind: FlowKind,
    pub usd_value: f64,
}

/// Aggregated flows for one (wallet, pool, day) window.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowBucket {
    pub wallet: Vec<u8>,
    pub pool: Vec<u8>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub deposits_usd: f64,
    pub withdrawals_usd: f64,
    pub fees_realized_usd: f64,
    pub fees_reinvested_usd: f64,
    pub net_flow_usd: f64,
}

/// UTC day bucket containing the timestamp.
pub fn day_window(ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = ts
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc();
    (start, start + Duration::days(1))
}

/// Sum deposits, withdrawals, realized fees and reinvested fees per
/// (wallet, pool, day). A fee collection sharing its transaction with a
/// deposit by the same wallet into the same pool is classified as
/// reinvested rather than realized: the fees never left the pool.
/// Net flow = deposits − withdrawals + realized + reinvested.
pub fn aggregate_flows(events: &[FlowEvent]) -> Vec<FlowBucket> {
    let reinvest_keys: HashSet<(&[u8], &[u8], &[u8])> = events
        .iter()
        .filter(|e| e.kind == FlowKind::Deposit)
        .map(|e| {
            (
                e.tx_hash.as_slice(),
                e.wallet.as_slice(),
                e.pool.as_slice(),
            )
        })
        .collect();

    let mut buckets: HashMap<(Vec<u8>, Vec<u8>, DateTime<Utc>), FlowBucket> = HashMap::new();

    for event in events {
        let (window_start, window_end) = day_window(event.timestamp);
        let key = (event.wallet.clone(), event.pool.clone(), window_start);
        let bucket = buckets.entry(key).or_insert_with(|| FlowBucket {
            wallet: event.wallet.clone(),
            pool: event.pool.clone(),
            window_start,
            window_end,
            deposits_usd: 0.0,
            withdrawals_usd: 0.0,
            fees_realized_usd: 0.0,
            fees_reinvested_usd: 0.0,
            net_flow_usd: 0.0,
        });

        match event.kind {
            FlowKind::Deposit => bucket.deposits_usd += event.usd_value,
            FlowKind::Withdrawal => bucket.withdrawals_usd += event.usd_value,
            FlowKind::Fees => {
                let reinvested = reinvest_keys.contains(&(
                    event.tx_hash.as_slice(),
                    event.wallet.as_slice(),
                    event.pool.as_slice(),
                ));
                if reinvested {
                    bucket.fees_reinvested_usd += event.usd_value;
                } else {
                    bucket.fees_realized_usd += event.usd_value;
                }
            }
        }
    }

    let mut out: Vec<FlowBucket> = buckets
        .into_values()
        .map(|mut bucket| {
            bucket.net_flow_usd = bucket.deposits_usd - bucket.withdrawals_usd
                + bucket.fees_realized_usd
                + bucket.fees_reinvested_usd;
            bucket
        })
        .collect();

    out.sort_by(|a, b| {
        (&a.wallet, &a.pool, a.window_start).cmp(&(&b.wallet, &b.pool, b.window_start))
    });
    out
}

/// Recompute capital-flow aggregates over a page of ingested events and
/// overwrite the affected wallet_flows windows.
pub async fn run(db: &PgPool, prices: &PriceService, args: &JobArgs) -> eyre::Result<JobStats> {
    let rows: Vec<FlowRow> = sqlx::query_as(
        "SELECT e.tx_hash, e.event_type, e.owner, e.recipient, e.pool, e.amount0, e.amount1, \
                e.block_timestamp, p.token0, p.token1
         FROM pool_events e
         JOIN pools p ON p.address = e.pool
         WHERE e.event_type IN ('mint', 'burn', 'collect')
           AND e.block_timestamp IS NOT NULL
         ORDER BY e.block_number, e.log_index
         LIMIT $1 OFFSET $2",
    )
    .bind(args.limit)
    .bind(args.offset)
    .fetch_all(db)
    .await?;

    tracing::info!(events = rows.len(), "Aggregating capital flows");
    let mut stats = JobStats::default();
    let mut events = Vec::with_capacity(rows.len());

    for row in &rows {
        stats.processed += 1;
        match price_row(db, prices, row).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => stats.skipped += 1,
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(
                    tx_hash = %hex::encode(&row.tx_hash),
                    pool = %hex::encode(&row.pool),
                    error = %e,
                    "Failed to price event, skipping record"
                );
            }
        }
    }

    let buckets = aggregate_flows(&events);
    for bucket in &buckets {
        upsert_bucket(db, bucket).await?;
        stats.updated += 1;
    }

    tracing::info!(
        processed = stats.processed,
        windows = stats.updated,
        skipped = stats.skipped,
        failed = stats.failed,
        "Capital-flow enrichment complete"
    );
    Ok(stats)
}

#[derive(Debug, sqlx::FromRow)]
struct FlowRow {
    tx_hash: Vec<u8>,
    event_type: String,
    owner: Option<Vec<u8>>,
    recipient: Option<Vec<u8>>,
    pool: Vec<u8>,
    amount0: Option<BigDecimal>,
    amount1: Option<BigDecimal>,
    block_timestamp: DateTime<Utc>,
    token0: Vec<u8>,
    token1: Vec<u8>,
}

async fn price_row(
    db: &PgPool,
    prices: &PriceService,
    row: &FlowRow,
) -> eyre::Result<Option<FlowEvent>> {
    let kind = match row.event_type.as_str() {
        "mint" => FlowKind::Deposit,
        "burn" => FlowKind::Withdrawal,
        "collect" => FlowKind::Fees,
        _ => return Ok(None),
    };

    // Deposits and withdrawals belong to the position owner; collected
    // fees follow the recipient when one is set.
    let wallet = match kind {
        FlowKind::Fees => row.recipient.clone().or_else(|| row.owner.clone()),
        _ => row.owner.clone(),
    };
    let Some(wallet) = wallet else {
        return Ok(None);
    };

    let token0 = Address::try_from(row.token0.as_slice())
        .map_err(|e| eyre::eyre!("Malformed token0: {}", e))?;
    let token1 = Address::try_from(row.token1.as_slice())
        .map_err(|e| eyre::eyre!("Malformed token1: {}", e))?;

    let info0 = prices
        .token(&token0)
        .ok_or_else(|| eyre::eyre!("Token {} not in registry", token0))?
        .clone();
    let info1 = prices
        .token(&token1)
        .ok_or_else(|| eyre::eyre!("Token {} not in registry", token1))?
        .clone();

    let price0 = prices.price_usd(db, token0).await?;
    let price1 = prices.price_usd(db, token1).await?;

    let zero = BigDecimal::from(0);
    let usd_value = token_amount_usd(
        row.amount0.as_ref().unwrap_or(&zero),
        info0.decimals,
        price0.price_usd,
    ) + token_amount_usd(
        row.amount1.as_ref().unwrap_or(&zero),
        info1.decimals,
        price1.price_usd,
    );

    Ok(Some(FlowEvent {
        wallet,
        pool: row.pool.clone(),
        tx_hash: row.tx_hash.clone(),
        timestamp: row.block_timestamp,
        kind,
        usd_value,
    }))
}

async fn upsert_bucket(db: &PgPool, bucket: &FlowBucket) -> eyre::Result<()> {
    sqlx::query(
        "INSERT INTO wallet_flows (wallet, pool, window_start, window_end, deposits_usd, \
         withdrawals_usd, fees_realized_usd, fees_reinvested_usd, net_flow_usd, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
         ON CONFLICT (wallet, pool, window_start) DO UPDATE
         SET window_end = EXCLUDED.window_end,
             deposits_usd = EXCLUDED.deposits_usd,
             withdrawals_usd = EXCLUDED.withdrawals_usd,
             fees_realized_usd = EXCLUDED.fees_realized_usd,
             fees_reinvested_usd = EXCLUDED.fees_reinvested_usd,
             net_flow_usd = EXCLUDED.net_flow_usd,
             updated_at = NOW()",
    )
    .bind(&bucket.wallet)
    .bind(&bucket.pool)
    .bind(bucket.window_start)
    .bind(bucket.window_end)
    .bind(bucket.deposits_usd)
    .bind(bucket.withdrawals_usd)
    .bind(bucket.fees_realized_usd)
    .bind(bucket.fees_reinvested_usd)
    .bind(bucket.net_flow_usd)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2026-03-{:02}T{:02}:00:00Z", day, hour))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn event(
        wallet: u8,
        tx: u8,
        timestamp: DateTime<Utc>,
        kind: FlowKind,
        usd: f64,
    ) -> FlowEvent {
        FlowEvent {
            wallet: vec![wallet; 20],
            pool: vec![0xcc; 20],
            tx_hash: vec![tx; 32],
            timestamp,
            kind,
            usd_value: usd,
        }
    }

    #[test]
    fn test_net_flow_formula() {
        let events = vec![
            event(1, 0x01, ts(10, 9), FlowKind::Deposit, 1000.0),
            event(1, 0x02, ts(10, 12), FlowKind::Withdrawal, 400.0),
            event(1, 0x03, ts(10, 15), FlowKind::Fees, 25.0),
        ];

        let buckets = aggregate_flows(&events);
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert!((bucket.deposits_usd - 1000.0).abs() < 1e-9);
        assert!((bucket.withdrawals_usd - 400.0).abs() < 1e-9);
        assert!((bucket.fees_realized_usd - 25.0).abs() < 1e-9);
        assert!((bucket.fees_reinvested_usd).abs() < 1e-12);
        // deposits − withdrawals + realized + reinvested
        assert!((bucket.net_flow_usd - 625.0).abs() < 1e-9);
    }

    #[test]
    fn test_reinvested_fees_share_a_transaction_with_a_deposit() {
        let events = vec![
            // Collect and re-deposit in one transaction: reinvested.
            event(1, 0x01, ts(10, 9), FlowKind::Fees, 30.0),
            event(1, 0x01, ts(10, 9), FlowKind::Deposit, 30.0),
            // Plain collect in its own transaction: realized.
            event(1, 0x02, ts(10, 10), FlowKind::Fees, 10.0),
        ];

        let buckets = aggregate_flows(&events);
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert!((bucket.fees_reinvested_usd - 30.0).abs() < 1e-9);
        assert!((bucket.fees_realized_usd - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_windows_split_by_day_and_wallet() {
        let events = vec![
            event(1, 0x01, ts(10, 23), FlowKind::Deposit, 100.0),
            event(1, 0x02, ts(11, 1), FlowKind::Deposit, 200.0),
            event(2, 0x03, ts(10, 5), FlowKind::Deposit, 300.0),
        ];

        let buckets = aggregate_flows(&events);
        assert_eq!(buckets.len(), 3);

        let day10 = &buckets[0];
        assert_eq!(day10.window_start, ts(10, 0));
        assert_eq!(day10.window_end, ts(11, 0));
    }

    #[test]
    fn test_reinvest_requires_same_wallet_and_pool() {
        let mut other_wallet_mint = event(2, 0x01, ts(10, 9), FlowKind::Deposit, 50.0);
        other_wallet_mint.wallet = vec![0x02; 20];

        let events = vec![
            event(1, 0x01, ts(10, 9), FlowKind::Fees, 30.0),
            other_wallet_mint,
        ];

        let buckets = aggregate_flows(&events);
        let wallet1 = buckets
            .iter()
            .find(|b| b.wallet == vec![1u8; 20])
            .unwrap();
        assert!((wallet1.fees_realized_usd - 30.0).abs() < 1e-9);
        assert!((wallet1.fees_reinvested_usd).abs() < 1e-12);
    }
}
