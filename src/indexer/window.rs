use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use crate::db::{CheckpointStore, EventStore};
use crate::source::{LogQuery, LogSource};

use super::decoder::{self, DomainEvent};
use super::types::{PoolRow, RunSummary, ScanTarget, TargetScanSummary};

/// The single ingestion engine: drives a log source across bounded block
/// windows for one target, decoding and persisting as it goes and
/// advancing the target's checkpoint. Which adapter backs it is the
/// caller's choice (normally the explorer→RPC fallback chain).
pub struct WindowedScanner {
    source: Arc<dyn LogSource>,
    events: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    window_size: u64,
    checkpoint_interval: u64,
}

impl WindowedScanner {
    pub fn new(
        source: Arc<dyn LogSource>,
        events: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        window_size: u64,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            source,
            events,
            checkpoints,
            window_size,
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    /// Scan one target from its resume point up to `end_block`
    /// (inclusive; the caller has already subtracted the confirmation
    /// depth from the chain tip).
    pub async fn scan_target(
        &self,
        target: &ScanTarget,
        end_block: u64,
    ) -> eyre::Result<TargetScanSummary> {
        let source_kind = target.kind.as_str();
        let scan_key = target.scan_key();

        let stored = self.checkpoints.get(source_kind, &scan_key).await?;
        let from_block = stored
            .map(|cp| cp.last_block + 1)
            .unwrap_or(target.deployment_block)
            .max(target.deployment_block);

        let mut summary = TargetScanSummary::default();

        if from_block > end_block {
            tracing::debug!(
                target = %scan_key,
                kind = source_kind,
                from_block,
                end_block,
                "Nothing to scan"
            );
            return Ok(summary);
        }

        tracing::info!(
            target = %scan_key,
            kind = source_kind,
            from_block,
            end_block,
            window_size = self.window_size,
            "Starting windowed scan"
        );

        let topics = target.topics();
        let mut current = from_block;
        let mut windows_since_checkpoint = 0u64;
        let mut pending_delta = 0u64;

        while current <= end_block {
            let window_end = current
                .saturating_add(self.window_size - 1)
                .min(end_block);

            let query = LogQuery {
                address: target.address,
                from_block: current,
                to_block: window_end,
                topics: topics.clone(),
            };
            let records = self.source.fetch_logs(&query).await?;

            let decoded = decoder::decode_batch(&records);
            let rows: Vec<_> = decoded.iter().map(decoder::event_row).collect();

            let inserted = if rows.is_empty() {
                0
            } else {
                self.events.write_events(&rows).await?
            };

            for event in &decoded {
                if let DomainEvent::PoolCreated {
                    token0,
                    token1,
                    fee,
                    tick_spacing,
                    pool,
                } = &event.kind
                {
                    summary.discovered_pools.push(PoolRow {
                        address: pool.as_slice().to_vec(),
                        factory: event.address.as_slice().to_vec(),
                        token0: token0.as_slice().to_vec(),
                        token1: token1.as_slice().to_vec(),
                        fee: *fee as i32,
                        tick_spacing: Some(*tick_spacing),
                        created_block: event.block_number as i64,
                        created_tx: event.tx_hash.as_slice().to_vec(),
                    });
                }
            }

            summary.blocks_scanned += window_end - current + 1;
            summary.rows_inserted += inserted;
            summary.duplicates_skipped += rows.len() as u64 - inserted;
            pending_delta += inserted;
            windows_since_checkpoint += 1;

            if !rows.is_empty() {
                tracing::debug!(
                    target = %scan_key,
                    from = current,
                    to = window_end,
                    logs = records.len(),
                    inserted,
                    "Window complete"
                );
            }

            // Checkpoint writes are batched; a crash replays at most the
            // uncommitted windows, which the idempotent writer absorbs.
            if windows_since_checkpoint >= self.checkpoint_interval {
                self.checkpoints
                    .upsert(source_kind, &scan_key, window_end, pending_delta)
                    .await?;
                windows_since_checkpoint = 0;
                pending_delta = 0;
            }

            if window_end == u64::MAX {
                break;
            }
            current = window_end + 1;
        }

        if windows_since_checkpoint > 0 {
            self.checkpoints
                .upsert(source_kind, &scan_key, end_block, pending_delta)
                .await?;
        }

        tracing::info!(
            target = %scan_key,
            kind = source_kind,
            blocks = summary.blocks_scanned,
            inserted = summary.rows_inserted,
            duplicates = summary.duplicates_skipped,
            "Target scan complete"
        );

        Ok(summary)
    }

    /// Scan a batch of targets with bounded concurrency. A failing
    /// target is logged and counted; the rest of the run proceeds.
    pub async fn scan_targets(
        &self,
        targets: &[ScanTarget],
        end_block: u64,
        max_concurrent: usize,
    ) -> RunSummary {
        let started = Instant::now();
        let mut run = RunSummary::default();

        let mut results = futures::stream::iter(targets.iter().map(|target| async move {
            (target, self.scan_target(target, end_block).await)
        }))
        .buffer_unordered(max_concurrent.max(1));

        while let Some((target, result)) = results.next().await {
            match result {
                Ok(summary) => run.absorb(summary),
                Err(e) => {
                    run.targets += 1;
                    run.targets_failed += 1;
                    tracing::error!(
                        target = %target.scan_key(),
                        kind = target.kind.as_str(),
                        error = %e,
                        "Target scan failed, continuing with remaining targets"
                    );
                }
            }
        }

        run.elapsed_secs = started.elapsed().as_secs_f64();
        run
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{Checkpoint, MemoryCheckpointStore, MemoryEventStore};
    use crate::indexer::decoder::Transfer;
    use crate::indexer::types::TargetKind;
    use crate::source::RawLogRecord;
    use alloy::primitives::{Address, Bytes, B256, U256};
    use alloy::sol_types::SolEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;

    pub(crate) fn transfer_log(block: u64, log_index: u32, token_id: u64) -> RawLogRecord {
        RawLogRecord {
            address: Address::repeat_byte(0xee),
            topics: vec![
                Transfer::SIGNATURE_HASH,
                Address::ZERO.into_word(),
                Address::repeat_byte(0x01).into_word(),
                B256::from(U256::from(token_id)),
            ],
            data: Bytes::new(),
            block_number: block,
            tx_hash: B256::from(U256::from(block) << 32 | U256::from(log_index)),
            tx_index: 0,
            log_index,
            timestamp: None,
        }
    }

    /// Replays a fixed set of logs, serving whichever fall inside the
    /// queried window, and records every window it was asked for.
    pub(crate) struct FixtureSource {
        pub logs: Vec<RawLogRecord>,
        pub queries: Mutex<Vec<(u64, u64)>>,
        pub fail_for: Option<Address>,
    }

    impl FixtureSource {
        pub fn new(logs: Vec<RawLogRecord>) -> Arc<Self> {
            Arc::new(Self {
                logs,
                queries: Mutex::new(Vec::new()),
                fail_for: None,
            })
        }
    }

    #[async_trait]
    impl LogSource for FixtureSource {
        fn name(&self) -> &'static str {
            "fixture"
        }

        async fn fetch_logs(&self, query: &LogQuery) -> eyre::Result<Vec<RawLogRecord>> {
            if self.fail_for == Some(query.address) {
                return Err(eyre::eyre!("injected failure"));
            }
            self.queries
                .lock()
                .unwrap()
                .push((query.from_block, query.to_block));
            Ok(self
                .logs
                .iter()
                .filter(|l| l.block_number >= query.from_block && l.block_number <= query.to_block)
                .cloned()
                .collect())
        }
    }

    fn target() -> ScanTarget {
        ScanTarget::new(
            TargetKind::PositionManager,
            Address::repeat_byte(0xee),
            1000,
        )
    }

    fn scanner(
        source: Arc<dyn LogSource>,
        events: Arc<MemoryEventStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
    ) -> WindowedScanner {
        WindowedScanner::new(source, events, checkpoints, 500, 10)
    }

    #[tokio::test]
    async fn test_end_to_end_scan_two_events_and_checkpoint() {
        let source = FixtureSource::new(vec![transfer_log(1200, 0, 1), transfer_log(1800, 1, 2)]);
        let events = Arc::new(MemoryEventStore::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::default());
        let scanner = scanner(source.clone(), events.clone(), checkpoints.clone());

        let summary = scanner.scan_target(&target(), 1999).await.unwrap();

        assert_eq!(summary.blocks_scanned, 1000);
        assert_eq!(summary.rows_inserted, 2);
        assert_eq!(summary.duplicates_skipped, 0);
        assert_eq!(events.len(), 2);

        let cp = checkpoints
            .get("position_manager", &target().scan_key())
            .await
            .unwrap()
            .expect("checkpoint created");
        assert_eq!(cp.last_block, 1999);
        assert_eq!(cp.events_count, 2);

        // windowSize=500 over [1000,1999] → exactly two windows.
        assert_eq!(
            *source.queries.lock().unwrap(),
            vec![(1000, 1499), (1500, 1999)]
        );
    }

    #[tokio::test]
    async fn test_rescanning_same_window_is_idempotent() {
        let source = FixtureSource::new(vec![transfer_log(1200, 0, 1), transfer_log(1800, 1, 2)]);
        let events = Arc::new(MemoryEventStore::default());

        // Two scanners with independent checkpoints but one event store:
        // the second pass replays the same windows.
        let first = scanner(
            source.clone(),
            events.clone(),
            Arc::new(MemoryCheckpointStore::default()),
        );
        let second = scanner(
            source.clone(),
            events.clone(),
            Arc::new(MemoryCheckpointStore::default()),
        );

        let s1 = first.scan_target(&target(), 1999).await.unwrap();
        let snapshot = events.snapshot();
        let s2 = second.scan_target(&target(), 1999).await.unwrap();

        assert_eq!(s1.rows_inserted, 2);
        assert_eq!(s2.rows_inserted, 0);
        assert_eq!(s2.duplicates_skipped, 2);
        assert_eq!(events.len(), 2);
        assert_eq!(events.snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_checkpoint_resume_and_monotonicity() {
        let source = FixtureSource::new(vec![transfer_log(1200, 0, 1)]);
        let events = Arc::new(MemoryEventStore::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::default());
        let scanner = scanner(source.clone(), events.clone(), checkpoints.clone());
        let t = target();

        scanner.scan_target(&t, 1999).await.unwrap();
        source.queries.lock().unwrap().clear();

        // Tip moved forward: resume from 2000, not from genesis.
        scanner.scan_target(&t, 2999).await.unwrap();
        assert_eq!(
            *source.queries.lock().unwrap(),
            vec![(2000, 2499), (2500, 2999)]
        );

        // Tip behind the checkpoint: nothing scanned, last_block keeps
        // its maximum.
        source.queries.lock().unwrap().clear();
        scanner.scan_target(&t, 1500).await.unwrap();
        assert!(source.queries.lock().unwrap().is_empty());

        let cp = checkpoints
            .get("position_manager", &t.scan_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.last_block, 2999);
    }

    #[tokio::test]
    async fn test_failed_target_does_not_abort_run() {
        let failing = Address::repeat_byte(0xbb);
        let source = Arc::new(FixtureSource {
            logs: vec![transfer_log(1200, 0, 1)],
            queries: Mutex::new(Vec::new()),
            fail_for: Some(failing),
        });

        let events = Arc::new(MemoryEventStore::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::default());
        let scanner = scanner(source.clone(), events.clone(), checkpoints.clone());

        let targets = vec![
            ScanTarget::new(TargetKind::PositionManager, failing, 1000),
            target(),
        ];
        let run = scanner.scan_targets(&targets, 1999, 4).await;

        assert_eq!(run.targets, 2);
        assert_eq!(run.targets_failed, 1);
        assert_eq!(run.rows_inserted, 1);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_batching_still_lands_on_end_block() {
        // 25 windows of 100 blocks with checkpoint_interval 10: two
        // batched checkpoint writes plus the final one.
        let source = FixtureSource::new(vec![]);
        let events = Arc::new(MemoryEventStore::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::default());
        let scanner = WindowedScanner::new(
            source.clone(),
            events.clone(),
            checkpoints.clone(),
            100,
            10,
        );
        let t = target();

        scanner.scan_target(&t, 3499).await.unwrap();

        let cp = checkpoints
            .get("position_manager", &t.scan_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.last_block, 3499);
        assert_eq!(checkpoints.upsert_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_checkpoint_never_decreases() {
        let checkpoints = MemoryCheckpointStore::default();
        checkpoints.upsert("pool", "0xabc", 100, 5).await.unwrap();
        checkpoints.upsert("pool", "0xabc", 90, 1).await.unwrap();

        let cp: Checkpoint = checkpoints.get("pool", "0xabc").await.unwrap().unwrap();
        assert_eq!(cp.last_block, 100);
        assert_eq!(cp.events_count, 6);
    }
}
