use std::str::FromStr;

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use bigdecimal::BigDecimal;
use futures::StreamExt;
use sqlx::PgPool;

use crate::source::rpc::RpcLogSource;

use super::{JobArgs, JobStats};

sol! {
    function positions(uint256 tokenId) external view returns (
        uint96 nonce,
        address operator,
        address token0,
        address token1,
        uint24 fee,
        int24 tickLower,
        int24 tickUpper,
        uint128 liquidity,
        uint256 feeGrowthInside0LastX128,
        uint256 feeGrowthInside1LastX128,
        uint128 tokensOwed0,
        uint128 tokensOwed1
    );

    function getPool(address tokenA, address tokenB, uint24 fee)
        external view returns (address pool);
}

/// A position manager and the factory its positions' pools live under.
#[derive(Debug, Clone, Copy)]
pub struct ManagerPair {
    pub position_manager: Address,
    pub factory: Address,
}

/// Fill in the canonical pool address for events that only carry a
/// position token id: `positions(tokenId)` on each configured manager,
/// then `getPool(token0, token1, fee)` on the matching factory. A
/// position no manager recognizes is skipped and logged for later
/// reconciliation.
pub async fn run(
    db: &PgPool,
    rpc: &RpcLogSource,
    managers: &[ManagerPair],
    args: &JobArgs,
) -> eyre::Result<JobStats> {
    if managers.is_empty() {
        return Err(eyre::eyre!("No position managers configured"));
    }

    let unresolved: Vec<(BigDecimal,)> = sqlx::query_as(
        "SELECT DISTINCT token_id
         FROM pool_events
         WHERE pool IS NULL AND token_id IS NOT NULL
         ORDER BY token_id
         LIMIT $1 OFFSET $2",
    )
    .bind(args.limit)
    .bind(args.offset)
    .fetch_all(db)
    .await?;

    tracing::info!(
        positions = unresolved.len(),
        managers = managers.len(),
        "Resolving pool attribution"
    );

    let outcomes = futures::stream::iter(unresolved.iter().map(|(token_id,)| async move {
        (token_id, resolve_pool(rpc, managers, token_id).await)
    }))
    .buffer_unordered(args.concurrency)
    .collect::<Vec<_>>()
    .await;

    let mut stats = JobStats::default();
    for (token_id, resolved) in outcomes {
        stats.processed += 1;
        match resolved {
            Ok(Some(pool)) => {
                let result = sqlx::query(
                    "UPDATE pool_events SET pool = $1 WHERE token_id = $2 AND pool IS NULL",
                )
                .bind(pool.as_slice())
                .bind(token_id)
                .execute(db)
                .await?;
                tracing::debug!(
                    token_id = %token_id,
                    pool = %pool,
                    rows = result.rows_affected(),
                    "Pool attribution resolved"
                );
                stats.updated += 1;
            }
            Ok(None) => {
                stats.skipped += 1;
                tracing::warn!(
                    token_id = %token_id,
                    "No manager recognizes this position, leaving unresolved"
                );
            }
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(
                    token_id = %token_id,
                    error = %e,
                    "Attribution lookup failed, skipping position"
                );
            }
        }
    }

    tracing::info!(
        processed = stats.processed,
        updated = stats.updated,
        skipped = stats.skipped,
        failed = stats.failed,
        "Pool attribution complete"
    );
    Ok(stats)
}

async fn resolve_pool(
    rpc: &RpcLogSource,
    managers: &[ManagerPair],
    token_id: &BigDecimal,
) -> eyre::Result<Option<Address>> {
    let token_id = U256::from_str(&token_id.normalized().to_string())
        .map_err(|e| eyre::eyre!("Token id {} does not fit uint256: {}", token_id, e))?;

    for manager in managers {
        let call = positionsCall { tokenId: token_id };
        let position = match rpc
            .call(manager.position_manager, Bytes::from(call.abi_encode()))
            .await
        {
            Ok(bytes) => match positionsCall::abi_decode_returns(&bytes) {
                Ok(position) => position,
                // Typically a revert payload: this manager does not know
                // the token.
                Err(_) => continue,
            },
            Err(e) => {
                tracing::debug!(
                    manager = %manager.position_manager,
                    error = %e,
                    "positions() call failed, trying next manager"
                );
                continue;
            }
        };

        if position.token0 == Address::ZERO && position.token1 == Address::ZERO {
            continue;
        }

        let lookup = getPoolCall {
            tokenA: position.token0,
            tokenB: position.token1,
            fee: position.fee,
        };
        let pool_bytes = rpc
            .call(manager.factory, Bytes::from(lookup.abi_encode()))
            .await?;
        let pool = getPoolCall::abi_decode_returns(&pool_bytes)
            .map_err(|e| eyre::eyre!("getPool returned malformed data: {}", e))?;

        if pool != Address::ZERO {
            return Ok(Some(pool));
        }
    }

    Ok(None)
}
