use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{Checkpoint, CheckpointStore};

/// Postgres-backed checkpoint store over the sync_checkpoints table.
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(
        &self,
        source_kind: &str,
        scan_key: &str,
    ) -> eyre::Result<Option<Checkpoint>> {
        let row: Option<(i64, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT last_block, events_count, updated_at
             FROM sync_checkpoints
             WHERE source_kind = $1 AND scan_key = $2",
        )
        .bind(source_kind)
        .bind(scan_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_block, events_count, updated_at)| Checkpoint {
            last_block: last_block as u64,
            events_count: events_count as u64,
            updated_at,
        }))
    }

    async fn upsert(
        &self,
        source_kind: &str,
        scan_key: &str,
        last_block: u64,
        event_delta: u64,
    ) -> eyre::Result<()> {
        // GREATEST keeps last_block monotone even if a caller replays an
        // old window; events_count accumulates deltas.
        sqlx::query(
            "INSERT INTO sync_checkpoints (source_kind, scan_key, last_block, events_count, updated_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (source_kind, scan_key) DO UPDATE
             SET last_block = GREATEST(sync_checkpoints.last_block, EXCLUDED.last_block),
                 events_count = sync_checkpoints.events_count + EXCLUDED.events_count,
                 updated_at = NOW()",
        )
        .bind(source_kind)
        .bind(scan_key)
        .bind(last_block as i64)
        .bind(event_delta as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
