use std::str::FromStr;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;

use crate::indexer::types::{PoolRow, ScanTarget, TargetKind};

/// Record newly discovered pools (idempotent; a pool is created exactly
/// once on-chain, so conflicts are ignored).
pub async fn upsert_pools(pool: &PgPool, rows: &[PoolRow]) -> eyre::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut inserted = 0u64;
    for chunk in rows.chunks(500) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO pools (address, factory, token0, token1, fee, tick_spacing, \
             created_block, created_tx) ",
        );

        query_builder.push_values(chunk, |mut b, row| {
            b.push_bind(&row.address)
                .push_bind(&row.factory)
                .push_bind(&row.token0)
                .push_bind(&row.token1)
                .push_bind(row.fee)
                .push_bind(row.tick_spacing)
                .push_bind(row.created_block)
                .push_bind(&row.created_tx);
        });

        query_builder.push(" ON CONFLICT (address) DO NOTHING");
        let result = query_builder.build().execute(pool).await?;
        inserted += result.rows_affected();
    }

    Ok(inserted)
}

/// All registered pools as scan targets, deploying at their creation
/// block.
pub async fn pool_scan_targets(pool: &PgPool) -> eyre::Result<Vec<ScanTarget>> {
    let rows: Vec<(Vec<u8>, i64)> =
        sqlx::query_as("SELECT address, created_block FROM pools ORDER BY created_block")
            .fetch_all(pool)
            .await?;

    let mut targets = Vec::with_capacity(rows.len());
    for (address, created_block) in rows {
        let address = Address::try_from(address.as_slice())
            .map_err(|e| eyre::eyre!("Malformed pool address in registry: {}", e))?;
        targets.push(ScanTarget::new(
            TargetKind::Pool,
            address,
            created_block as u64,
        ));
    }
    Ok(targets)
}

#[derive(Debug, Deserialize)]
struct IncentiveRecord {
    pool_address: String,
    reward_token: String,
    reward_usd_per_day: f64,
    starts_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
}

/// Seed the incentive registry from an operator-maintained CSV file.
/// Re-running refreshes the daily USD rate and end date of existing
/// programs.
pub async fn seed_incentives(pool: &PgPool, path: &str) -> eyre::Result<u64> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| eyre::eyre!("Failed to open incentives CSV '{}': {}", path, e))?;

    let mut count = 0u64;
    for record in reader.deserialize::<IncentiveRecord>() {
        let record = record.map_err(|e| eyre::eyre!("Malformed incentive row: {}", e))?;
        let address = Address::from_str(&record.pool_address).map_err(|e| {
            eyre::eyre!("Bad pool address '{}' in incentives CSV: {}", record.pool_address, e)
        })?;

        sqlx::query(
            "INSERT INTO pool_incentives (pool_address, reward_token, reward_usd_per_day, starts_at, ends_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (pool_address, reward_token, starts_at) DO UPDATE
             SET reward_usd_per_day = EXCLUDED.reward_usd_per_day,
                 ends_at = EXCLUDED.ends_at",
        )
        .bind(address.as_slice())
        .bind(&record.reward_token)
        .bind(record.reward_usd_per_day)
        .bind(record.starts_at)
        .bind(record.ends_at)
        .execute(pool)
        .await?;

        count += 1;
    }

    Ok(count)
}
