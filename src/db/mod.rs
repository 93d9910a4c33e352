pub mod checkpoint;
pub mod registry;
pub mod writer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::indexer::types::EventRow;

pub use checkpoint::PgCheckpointStore;
pub use writer::PgEventStore;

/// Durable scan progress for one (source kind, scan key).
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub last_block: u64,
    pub events_count: u64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, source_kind: &str, scan_key: &str)
        -> eyre::Result<Option<Checkpoint>>;

    /// Advance a checkpoint: `last_block` never decreases, the event
    /// count is incremented by `event_delta` rather than overwritten.
    async fn upsert(
        &self,
        source_kind: &str,
        scan_key: &str,
        last_block: u64,
        event_delta: u64,
    ) -> eyre::Result<()>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert-or-ignore a batch keyed by (tx_hash, log_index); returns
    /// how many rows were actually inserted. Re-submitting stored events
    /// is a no-op.
    async fn write_events(&self, rows: &[EventRow]) -> eyre::Result<u64>;
}

// ============================================================
// In-memory stores (test doubles for the scanner properties)
// ============================================================

#[cfg(test)]
#[derive(Default)]
pub struct MemoryEventStore {
    rows: std::sync::Mutex<std::collections::BTreeMap<(Vec<u8>, i32), String>>,
}

#[cfg(test)]
impl MemoryEventStore {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<((Vec<u8>, i32), String)> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventStore for MemoryEventStore {
    async fn write_events(&self, rows: &[EventRow]) -> eyre::Result<u64> {
        let mut stored = self.rows.lock().unwrap();
        let mut inserted = 0u64;
        for row in rows {
            let key = (row.tx_hash.clone(), row.log_index);
            if let std::collections::btree_map::Entry::Vacant(entry) = stored.entry(key) {
                entry.insert(row.event_type.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: std::sync::Mutex<std::collections::HashMap<(String, String), Checkpoint>>,
    upserts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryCheckpointStore {
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(
        &self,
        source_kind: &str,
        scan_key: &str,
    ) -> eyre::Result<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .get(&(source_kind.to_string(), scan_key.to_string()))
            .cloned())
    }

    async fn upsert(
        &self,
        source_kind: &str,
        scan_key: &str,
        last_block: u64,
        event_delta: u64,
    ) -> eyre::Result<()> {
        self.upserts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut stored = self.checkpoints.lock().unwrap();
        let entry = stored
            .entry((source_kind.to_string(), scan_key.to_string()))
            .or_insert(Checkpoint {
                last_block: 0,
                events_count: 0,
                updated_at: Utc::now(),
            });
        entry.last_block = entry.last_block.max(last_block);
        entry.events_count += event_delta;
        entry.updated_at = Utc::now();
        Ok(())
    }
}
