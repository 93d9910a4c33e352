use async_trait::async_trait;
use sqlx::PgPool;

use crate::indexer::types::EventRow;

use super::EventStore;

/// Idempotent event writer: multi-row INSERT ... ON CONFLICT DO NOTHING,
/// chunked to bound transaction size.
pub struct PgEventStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgEventStore {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn write_events(&self, rows: &[EventRow]) -> eyre::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0u64;

        for chunk in rows.chunks(self.batch_size) {
            let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
                "INSERT INTO pool_events (tx_hash, log_index, block_number, tx_index, address, \
                 pool, event_type, sender, owner, recipient, token_id, tick_lower, tick_upper, \
                 amount, amount0, amount1, sqrt_price_x96, liquidity, tick, block_timestamp) ",
            );

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.tx_hash)
                    .push_bind(row.log_index)
                    .push_bind(row.block_number)
                    .push_bind(row.tx_index)
                    .push_bind(&row.address)
                    .push_bind(&row.pool)
                    .push_bind(&row.event_type)
                    .push_bind(&row.sender)
                    .push_bind(&row.owner)
                    .push_bind(&row.recipient)
                    .push_bind(&row.token_id)
                    .push_bind(row.tick_lower)
                    .push_bind(row.tick_upper)
                    .push_bind(&row.amount)
                    .push_bind(&row.amount0)
                    .push_bind(&row.amount1)
                    .push_bind(&row.sqrt_price_x96)
                    .push_bind(&row.liquidity)
                    .push_bind(row.tick)
                    .push_bind(row.block_timestamp);
            });

            query_builder.push(" ON CONFLICT (tx_hash, log_index) DO NOTHING");
            let result = query_builder.build().execute(&self.pool).await?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }
}
