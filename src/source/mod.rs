pub mod explorer;
pub mod rpc;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use types::{canonicalize, chunk_ranges, LogQuery, RawLogRecord};

/// A provider of ordered, deduplicated raw logs for a block range.
#[async_trait]
pub trait LogSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_logs(&self, query: &LogQuery) -> eyre::Result<Vec<RawLogRecord>>;
}

/// Ordered chain of log sources tried in sequence: the first source that
/// succeeds with rows wins; an error or an empty result moves on to the
/// next. All-empty is an empty success, all-error propagates the last
/// error.
pub struct FallbackLogSource {
    sources: Vec<Arc<dyn LogSource>>,
}

impl FallbackLogSource {
    pub fn new(sources: Vec<Arc<dyn LogSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl LogSource for FallbackLogSource {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn fetch_logs(&self, query: &LogQuery) -> eyre::Result<Vec<RawLogRecord>> {
        let mut last_error: Option<eyre::Report> = None;
        let mut saw_success = false;

        for source in &self.sources {
            match source.fetch_logs(query).await {
                Ok(records) if !records.is_empty() => return Ok(records),
                Ok(_) => {
                    tracing::debug!(
                        source = source.name(),
                        address = %query.address,
                        from = query.from_block,
                        to = query.to_block,
                        "Source returned no rows, trying next"
                    );
                    saw_success = true;
                }
                Err(e) => {
                    tracing::warn!(
                        source = source.name(),
                        address = %query.address,
                        from = query.from_block,
                        to = query.to_block,
                        error = %e,
                        "Source failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        if saw_success {
            return Ok(Vec::new());
        }
        Err(last_error.unwrap_or_else(|| eyre::eyre!("No log sources configured")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes, B256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(block: u64, tx: u8, log_index: u32) -> RawLogRecord {
        RawLogRecord {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::new(),
            block_number: block,
            tx_hash: B256::repeat_byte(tx),
            tx_index: 0,
            log_index,
            timestamp: None,
        }
    }

    fn query() -> LogQuery {
        LogQuery {
            address: Address::ZERO,
            from_block: 0,
            to_block: 100,
            topics: vec![],
        }
    }

    enum Behavior {
        Rows(Vec<RawLogRecord>),
        Fail,
    }

    struct MockSource {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogSource for MockSource {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn fetch_logs(&self, _query: &LogQuery) -> eyre::Result<Vec<RawLogRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Rows(rows) => Ok(rows.clone()),
                Behavior::Fail => Err(eyre::eyre!("boom")),
            }
        }
    }

    #[test]
    fn test_canonicalize_orders_by_block_then_log_index() {
        let records = vec![
            record(1800, 2, 5),
            record(1200, 1, 7),
            record(1200, 1, 3),
            record(1500, 3, 0),
        ];
        let out = canonicalize(records);
        let keys: Vec<(u64, u32)> = out.iter().map(|r| (r.block_number, r.log_index)).collect();
        assert_eq!(keys, vec![(1200, 3), (1200, 7), (1500, 0), (1800, 5)]);
    }

    #[test]
    fn test_canonicalize_collapses_duplicates() {
        // Same (tx_hash, log_index) seen from two overlapping chunks.
        let records = vec![record(1200, 1, 3), record(1200, 1, 3), record(1200, 2, 4)];
        let out = canonicalize(records);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_chunk_ranges() {
        assert_eq!(
            chunk_ranges(1000, 1999, 500),
            vec![(1000, 1499), (1500, 1999)]
        );
        assert_eq!(chunk_ranges(10, 10, 500), vec![(10, 10)]);
        assert_eq!(chunk_ranges(10, 12, 2), vec![(10, 11), (12, 12)]);
        assert!(chunk_ranges(20, 10, 500).is_empty());
    }

    #[tokio::test]
    async fn test_fallback_on_error_invokes_secondary_once() {
        let primary = MockSource::new(Behavior::Fail);
        let secondary = MockSource::new(Behavior::Rows(vec![record(5, 1, 0)]));
        let chain = FallbackLogSource::new(vec![primary.clone(), secondary.clone()]);

        let rows = chain.fetch_logs(&query()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_on_empty_invokes_secondary_once() {
        let primary = MockSource::new(Behavior::Rows(vec![]));
        let secondary = MockSource::new(Behavior::Rows(vec![record(5, 1, 0)]));
        let chain = FallbackLogSource::new(vec![primary.clone(), secondary.clone()]);

        let rows = chain.fetch_logs(&query()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_fallback_when_primary_has_rows() {
        let primary = MockSource::new(Behavior::Rows(vec![record(5, 1, 0)]));
        let secondary = MockSource::new(Behavior::Rows(vec![record(6, 2, 0)]));
        let chain = FallbackLogSource::new(vec![primary.clone(), secondary.clone()]);

        let rows = chain.fetch_logs(&query()).await.unwrap();
        assert_eq!(rows[0].block_number, 5);
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_empty_is_empty_success() {
        let primary = MockSource::new(Behavior::Rows(vec![]));
        let secondary = MockSource::new(Behavior::Rows(vec![]));
        let chain = FallbackLogSource::new(vec![primary, secondary]);

        let rows = chain.fetch_logs(&query()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_all_failed_propagates_error() {
        let primary = MockSource::new(Behavior::Fail);
        let secondary = MockSource::new(Behavior::Fail);
        let chain = FallbackLogSource::new(vec![primary, secondary]);

        assert!(chain.fetch_logs(&query()).await.is_err());
    }
}
