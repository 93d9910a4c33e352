use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::PgPool;

use crate::client::{RateLimitedClient, DEFAULT_RETRYABLE_STATUSES};
use crate::config::EnrichmentConfig;

use super::prices::PriceService;
use super::{JobArgs, JobStats};

const MONTH_SECS: f64 = 30.0 * 86_400.0;

/// Elapsed months since vesting started, on a fixed 30-day month.
pub fn months_elapsed(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - start).num_seconds().max(0);
    secs as f64 / MONTH_SECS
}

/// Linear vesting: `vested = R * min(M / P, 1)`.
pub fn vested_amount(total: f64, months_elapsed: f64, period_months: f64) -> f64 {
    if period_months <= 0.0 {
        return total;
    }
    total * (months_elapsed / period_months).min(1.0)
}

/// Claiming early releases the vested part in full plus the unvested
/// remainder docked by the penalty.
pub fn claimable_early(total: f64, vested: f64, penalty: f64) -> f64 {
    vested + (total - vested) * (1.0 - penalty)
}

/// Recompute vesting state for every position with ingested history.
/// The total reward comes from the reward API per position token; a
/// failed lookup skips that position, never the batch.
pub async fn run(
    db: &PgPool,
    prices: &PriceService,
    config: &EnrichmentConfig,
    args: &JobArgs,
) -> eyre::Result<JobStats> {
    let reward_api_url = config
        .reward_api_url
        .as_deref()
        .ok_or_else(|| eyre::eyre!("enrichment.reward_api_url is not configured"))?
        .trim_end_matches('/')
        .to_string();
    let reward_symbol = config
        .reward_token
        .as_deref()
        .ok_or_else(|| eyre::eyre!("enrichment.reward_token is not configured"))?;
    let reward_token = prices
        .token_by_symbol(reward_symbol)
        .ok_or_else(|| eyre::eyre!("Reward token '{}' is not in the registry", reward_symbol))?
        .clone();

    // One price for the whole batch.
    let reward_price = prices.price_usd(db, reward_token.address).await?;

    // bytea has no max aggregate; round-trip the pool through hex.
    let rows: Vec<(BigDecimal, DateTime<Utc>, Option<String>)> = sqlx::query_as(
        "SELECT token_id, MIN(block_timestamp) AS started_at, MAX(encode(pool, 'hex')) AS pool
         FROM pool_events
         WHERE token_id IS NOT NULL AND block_timestamp IS NOT NULL
         GROUP BY token_id
         ORDER BY token_id
         LIMIT $1 OFFSET $2",
    )
    .bind(args.limit)
    .bind(args.offset)
    .fetch_all(db)
    .await?;

    let positions: Vec<(BigDecimal, DateTime<Utc>, Option<Vec<u8>>)> = rows
        .into_iter()
        .map(|(token_id, started_at, pool)| {
            let pool = pool.and_then(|p| hex::decode(p).ok());
            (token_id, started_at, pool)
        })
        .collect();

    tracing::info!(
        positions = positions.len(),
        period_months = config.vesting_period_months,
        penalty = config.early_claim_penalty,
        "Recomputing reward vesting"
    );

    let client = RateLimitedClient::new(
        Duration::from_millis(200),
        3,
        Duration::from_secs(30),
    )?;
    let now = Utc::now();

    let outcomes = futures::stream::iter(positions.iter().map(
        |(token_id, started_at, pool)| {
            let client = &client;
            let reward_api_url = &reward_api_url;
            async move {
                let result = enrich_position(
                    db,
                    client,
                    reward_api_url,
                    token_id,
                    *started_at,
                    pool.as_deref(),
                    config,
                    reward_price.price_usd,
                    now,
                )
                .await;
                (token_id, result)
            }
        },
    ))
    .buffer_unordered(args.concurrency)
    .collect::<Vec<_>>()
    .await;

    let mut stats = JobStats::default();
    for (token_id, result) in outcomes {
        stats.processed += 1;
        match result {
            Ok(true) => stats.updated += 1,
            Ok(false) => stats.skipped += 1,
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(
                    token_id = %token_id,
                    error = %e,
                    "Failed to compute vesting, skipping position"
                );
            }
        }
    }

    tracing::info!(
        processed = stats.processed,
        updated = stats.updated,
        skipped = stats.skipped,
        failed = stats.failed,
        "Vesting enrichment complete"
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
async fn enrich_position(
    db: &PgPool,
    client: &RateLimitedClient,
    reward_api_url: &str,
    token_id: &BigDecimal,
    started_at: DateTime<Utc>,
    pool: Option<&[u8]>,
    config: &EnrichmentConfig,
    reward_price_usd: f64,
    now: DateTime<Utc>,
) -> eyre::Result<bool> {
    let Some(total) = fetch_reward(client, reward_api_url, token_id).await? else {
        return Ok(false);
    };

    let elapsed = months_elapsed(started_at, now);
    let vested = vested_amount(total, elapsed, config.vesting_period_months);
    let claimable = claimable_early(total, vested, config.early_claim_penalty);
    let progress_pct = if total > 0.0 { vested / total * 100.0 } else { 0.0 };

    sqlx::query(
        "INSERT INTO position_vesting (token_id, pool, total_reward, vested, claimable_early, \
         total_reward_usd, vested_usd, claimable_usd, progress_pct, vesting_started_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
         ON CONFLICT (token_id) DO UPDATE
         SET pool = EXCLUDED.pool,
             total_reward = EXCLUDED.total_reward,
             vested = EXCLUDED.vested,
             claimable_early = EXCLUDED.claimable_early,
             total_reward_usd = EXCLUDED.total_reward_usd,
             vested_usd = EXCLUDED.vested_usd,
             claimable_usd = EXCLUDED.claimable_usd,
             progress_pct = EXCLUDED.progress_pct,
             vesting_started_at = EXCLUDED.vesting_started_at,
             updated_at = NOW()",
    )
    .bind(token_id)
    .bind(pool)
    .bind(total)
    .bind(vested)
    .bind(claimable)
    .bind(total * reward_price_usd)
    .bind(vested * reward_price_usd)
    .bind(claimable * reward_price_usd)
    .bind(progress_pct)
    .bind(started_at)
    .execute(db)
    .await?;

    Ok(true)
}

/// Fetch a position's total reward. The API answers with a bare JSON
/// number (or numeric string); missing and zero rewards are both "no
/// vesting to record".
async fn fetch_reward(
    client: &RateLimitedClient,
    base_url: &str,
    token_id: &BigDecimal,
) -> eyre::Result<Option<f64>> {
    let url = format!("{}/{}", base_url, token_id.normalized());
    let description = format!("reward lookup {}", token_id);

    let response = client
        .execute(
            move |http| http.get(&url).header("Accept", "application/json"),
            &description,
            DEFAULT_RETRYABLE_STATUSES,
        )
        .await?;

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| eyre::eyre!("Reward API returned malformed JSON: {}", e))?;

    let reward = match &body {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };

    Ok(reward.filter(|r| r.is_finite() && *r > 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_vesting_midway() {
        // R=1200 over P=12 months, M=6 elapsed, penalty 50%:
        // vested = 600, claimable-early = 600 + 600 * 0.5 = 900.
        let start = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let now = start + chrono::Duration::days(180);

        let elapsed = months_elapsed(start, now);
        assert!((elapsed - 6.0).abs() < 1e-9);

        let vested = vested_amount(1200.0, elapsed, 12.0);
        assert!((vested - 600.0).abs() < 1e-9);

        let claimable = claimable_early(1200.0, vested, 0.5);
        assert!((claimable - 900.0).abs() < 1e-9);
    }

    #[test]
    fn test_vesting_caps_at_total() {
        let vested = vested_amount(1200.0, 36.0, 12.0);
        assert!((vested - 1200.0).abs() < 1e-9);

        // Fully vested: no penalty surface left.
        let claimable = claimable_early(1200.0, vested, 0.5);
        assert!((claimable - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_penalty_releases_everything() {
        let claimable = claimable_early(1200.0, 300.0, 0.0);
        assert!((claimable - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_months_elapsed_clamps_future_starts() {
        let start = Utc::now() + chrono::Duration::days(10);
        assert_eq!(months_elapsed(start, Utc::now()), 0.0);
    }
}
