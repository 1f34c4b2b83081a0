use std::collections::HashMap;

use owl_core::{DetailEntry, EmptyAggregateError, ItemSummary};
use parking_lot::Mutex;

type RecordMap = HashMap<String, DetailEntry>;
type SnapshotMap = HashMap<String, RecordMap>;

/// Deduplicating store of listing records: item name -> snapshot time -> record id.
///
/// Every write goes through one short critical section, so concurrent writers
/// never lose updates to distinct keys. Identical keys are last-write-wins.
#[derive(Debug, Default)]
pub struct AggregationCache {
    items: Mutex<HashMap<String, SnapshotMap>>,
}

impl AggregationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        item_name: impl Into<String>,
        snapshot_time: impl Into<String>,
        record_id: impl Into<String>,
        entry: DetailEntry,
    ) {
        let (item_name, snapshot_time, record_id) =
            (item_name.into(), snapshot_time.into(), record_id.into());
        let mut items = self.items.lock();
        items
            .entry(item_name)
            .or_default()
            .entry(snapshot_time)
            .or_default()
            .insert(record_id, entry);
    }

    /// Store an entry under the key triple it carries.
    pub fn put_entry(&self, entry: DetailEntry) {
        let item_name = entry.item_name.clone();
        let snapshot_time = entry.snapshot_time.clone();
        let record_id = entry.record_id.clone();
        self.put(item_name, snapshot_time, record_id, entry);
    }

    pub fn get(&self, item_name: &str, snapshot_time: &str, record_id: &str) -> Option<DetailEntry> {
        self.items
            .lock()
            .get(item_name)
            .and_then(|snapshots| snapshots.get(snapshot_time))
            .and_then(|records| records.get(record_id))
            .cloned()
    }

    pub fn item_names(&self) -> Vec<String> {
        self.items.lock().keys().cloned().collect()
    }

    pub fn item_count(&self) -> usize {
        self.items.lock().len()
    }

    pub fn record_count(&self) -> usize {
        self.items
            .lock()
            .values()
            .flat_map(|snapshots| snapshots.values())
            .map(|records| records.len())
            .sum()
    }

    /// Summarize every record stored for `item_name`, pooled across snapshots.
    pub fn summarize(&self, item_name: &str) -> Result<ItemSummary, EmptyAggregateError> {
        let (snapshot_time, records) = {
            let items = self.items.lock();
            let Some(snapshots) = items.get(item_name) else {
                return Err(EmptyAggregateError {
                    item_name: item_name.to_string(),
                });
            };
            let snapshot_time = snapshots.keys().next().cloned().unwrap_or_default();
            let records = snapshots
                .values()
                .flat_map(|records| records.values().cloned())
                .collect::<Vec<_>>();
            (snapshot_time, records)
        };

        ItemSummary::from_records(item_name, snapshot_time, records)
    }
}
