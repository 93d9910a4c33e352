use alloy::primitives::Address;
use bigdecimal::BigDecimal;
use sqlx::PgPool;

use super::prices::PriceService;
use super::{token_amount_usd, JobArgs, JobStats};

/// Fee APR from trailing-24h fees against TVL, annualized.
pub fn apr_fees(fees_24h_usd: f64, tvl_usd: f64) -> f64 {
    (fees_24h_usd / tvl_usd) * 365.0 * 100.0
}

/// Total APR additionally counts incentive programs and the
/// vesting-adjusted reward flow in the numerator.
pub fn apr_total(
    fees_24h_usd: f64,
    incentives_24h_usd: f64,
    vesting_24h_usd: f64,
    tvl_usd: f64,
) -> f64 {
    ((fees_24h_usd + incentives_24h_usd + vesting_24h_usd) / tvl_usd) * 365.0 * 100.0
}

/// Recompute per-pool APR metrics over the ingested history and
/// overwrite the pool_metrics rows. Pools below the TVL floor are
/// skipped (the ratio is undefined); a price miss skips that pool only.
pub async fn run(
    db: &PgPool,
    prices: &PriceService,
    args: &JobArgs,
    min_tvl_usd: f64,
) -> eyre::Result<JobStats> {
    let pools: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = sqlx::query_as(
        "SELECT address, token0, token1 FROM pools ORDER BY address LIMIT $1 OFFSET $2",
    )
    .bind(args.limit)
    .bind(args.offset)
    .fetch_all(db)
    .await?;

    tracing::info!(pools = pools.len(), "Recomputing pool APR metrics");
    let mut stats = JobStats::default();

    for (address, token0, token1) in pools {
        stats.processed += 1;
        match enrich_pool(db, prices, &address, &token0, &token1, min_tvl_usd).await {
            Ok(true) => stats.updated += 1,
            Ok(false) => stats.skipped += 1,
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(
                    pool = %hex::encode(&address),
                    error = %e,
                    "Failed to compute APR, skipping pool"
                );
            }
        }
    }

    tracing::info!(
        processed = stats.processed,
        updated = stats.updated,
        skipped = stats.skipped,
        failed = stats.failed,
        "APR enrichment complete"
    );
    Ok(stats)
}

async fn enrich_pool(
    db: &PgPool,
    prices: &PriceService,
    address: &[u8],
    token0: &[u8],
    token1: &[u8],
    min_tvl_usd: f64,
) -> eyre::Result<bool> {
    let token0 = Address::try_from(token0)
        .map_err(|e| eyre::eyre!("Malformed token0 in registry: {}", e))?;
    let token1 = Address::try_from(token1)
        .map_err(|e| eyre::eyre!("Malformed token1 in registry: {}", e))?;

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

    // Net liquidity flow over the whole history approximates TVL.
    let (mint0, mint1, burn0, burn1): (BigDecimal, BigDecimal, BigDecimal, BigDecimal) =
        sqlx::query_as(
            "SELECT
                COALESCE(SUM(CASE WHEN event_type = 'mint' THEN amount0 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN event_type = 'mint' THEN amount1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN event_type = 'burn' THEN amount0 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN event_type = 'burn' THEN amount1 ELSE 0 END), 0)
             FROM pool_events
             WHERE pool = $1 AND event_type IN ('mint', 'burn')",
        )
        .bind(address)
        .fetch_one(db)
        .await?;

    let (fees0, fees1): (BigDecimal, BigDecimal) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount0), 0), COALESCE(SUM(amount1), 0)
         FROM pool_events
         WHERE pool = $1
           AND event_type = 'collect'
           AND block_timestamp >= NOW() - INTERVAL '24 hours'",
    )
    .bind(address)
    .fetch_one(db)
    .await?;

    let (incentives_24h_usd,): (f64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(reward_usd_per_day), 0)::DOUBLE PRECISION
         FROM pool_incentives
         WHERE pool_address = $1
           AND starts_at <= NOW()
           AND (ends_at IS NULL OR ends_at >= NOW())",
    )
    .bind(address)
    .fetch_one(db)
    .await?;

    // Daily vested-reward rate across the pool's positions.
    let (vesting_24h_usd,): (f64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(
             vested_usd / GREATEST(EXTRACT(EPOCH FROM (NOW() - vesting_started_at)) / 86400.0, 1.0)
         ), 0)::DOUBLE PRECISION
         FROM position_vesting
         WHERE pool = $1",
    )
    .bind(address)
    .fetch_one(db)
    .await?;

    let tvl_usd = (token_amount_usd(&(mint0 - burn0), info0.decimals, price0.price_usd)
        + token_amount_usd(&(mint1 - burn1), info1.decimals, price1.price_usd))
    .max(0.0);

    if tvl_usd < min_tvl_usd {
        tracing::debug!(
            pool = %hex::encode(address),
            tvl_usd,
            min_tvl_usd,
            "TVL below floor, APR undefined"
        );
        return Ok(false);
    }

    let fees_24h_usd = token_amount_usd(&fees0, info0.decimals, price0.price_usd)
        + token_amount_usd(&fees1, info1.decimals, price1.price_usd);

    let fees_apr = apr_fees(fees_24h_usd, tvl_usd);
    let total_apr = apr_total(fees_24h_usd, incentives_24h_usd, vesting_24h_usd, tvl_usd);

    sqlx::query(
        "INSERT INTO pool_metrics (pool_address, tvl_usd, fees_24h_usd, incentives_24h_usd, \
         vesting_24h_usd, apr_fees, apr_total, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
         ON CONFLICT (pool_address) DO UPDATE
         SET tvl_usd = EXCLUDED.tvl_usd,
             fees_24h_usd = EXCLUDED.fees_24h_usd,
             incentives_24h_usd = EXCLUDED.incentives_24h_usd,
             vesting_24h_usd = EXCLUDED.vesting_24h_usd,
             apr_fees = EXCLUDED.apr_fees,
             apr_total = EXCLUDED.apr_total,
             updated_at = NOW()",
    )
    .bind(address)
    .bind(tvl_usd)
    .bind(fees_24h_usd)
    .bind(incentives_24h_usd)
    .bind(vesting_24h_usd)
    .bind(fees_apr)
    .bind(total_apr)
    .execute(db)
    .await?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apr_fees_formula() {
        // (10 / 3650) * 365 * 100 = 100% APR.
        assert!((apr_fees(10.0, 3650.0) - 100.0).abs() < 1e-9);
        assert!((apr_fees(0.0, 1000.0)).abs() < 1e-12);
    }

    #[test]
    fn test_apr_total_includes_incentives_and_vesting() {
        let fees_only = apr_total(10.0, 0.0, 0.0, 3650.0);
        assert!((fees_only - apr_fees(10.0, 3650.0)).abs() < 1e-9);

        // 10 + 5 + 5 daily against the same TVL doubles the APR.
        let total = apr_total(10.0, 5.0, 5.0, 3650.0);
        assert!((total - 200.0).abs() < 1e-9);
    }
}
