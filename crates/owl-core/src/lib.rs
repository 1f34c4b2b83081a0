//! Core catalog model, wire decoding and price statistics for the owl ingestor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Precomputed percentile metadata published alongside an index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredStats {
    pub p0: i64,
    pub p25: i64,
    pub p50: i64,
    pub p75: i64,
    pub p100: i64,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub n_owled: Option<i64>,
}

/// One catalog entry from the remote index; points at a detail document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "IndexRecord")]
pub struct ItemDescriptor {
    pub reference_id: String,
    pub declared_item_name: Option<String>,
    pub declared_at: Option<String>,
    pub declared_results: Option<i64>,
    pub declared_percentiles: Option<DeclaredStats>,
}

impl ItemDescriptor {
    pub fn new(reference_id: impl Into<String>) -> Self {
        Self {
            reference_id: reference_id.into(),
            declared_item_name: None,
            declared_at: None,
            declared_results: None,
            declared_percentiles: None,
        }
    }
}

/// Raw index row as published by the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexRecord {
    pub task_id: String,
    #[serde(default)]
    pub search_item: Option<String>,
    #[serde(default)]
    pub search_item_timestamp: Option<String>,
    #[serde(default)]
    pub search_results: Option<i64>,
    #[serde(default)]
    pub p0: Option<i64>,
    #[serde(default)]
    pub p25: Option<i64>,
    #[serde(default)]
    pub p50: Option<i64>,
    #[serde(default)]
    pub p75: Option<i64>,
    #[serde(default)]
    pub p100: Option<i64>,
    #[serde(default)]
    pub mean: Option<f64>,
    #[serde(default)]
    pub std: Option<f64>,
    #[serde(default)]
    pub n_owled: Option<i64>,
}

impl From<IndexRecord> for ItemDescriptor {
    fn from(record: IndexRecord) -> Self {
        let declared_percentiles = match (record.p0, record.p25, record.p50, record.p75, record.p100) {
            (Some(p0), Some(p25), Some(p50), Some(p75), Some(p100)) => Some(DeclaredStats {
                p0,
                p25,
                p50,
                p75,
                p100,
                mean: record.mean,
                std: record.std,
                n_owled: record.n_owled,
            }),
            _ => None,
        };
        Self {
            reference_id: record.task_id,
            declared_item_name: record.search_item.filter(|name| !name.trim().is_empty()),
            declared_at: record.search_item_timestamp,
            declared_results: record.search_results,
            declared_percentiles,
        }
    }
}

/// A single store listing observed in a snapshot. The unit of aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailEntry {
    pub item_name: String,
    pub snapshot_time: String,
    pub record_id: String,
    pub seller_name: String,
    pub bundle_size: i64,
    pub price: i64,
    pub quantity: i64,
}

/// Flattened listing records from one detail fetch.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(from = "DetailResponse")]
pub struct DetailDocument {
    pub entries: Vec<DetailEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailResponse {
    #[serde(default)]
    pub payload: Vec<DetailPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailPayload {
    pub screenshot: Screenshot,
    pub search: SearchMeta,
    #[serde(default)]
    pub body: DetailBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Screenshot {
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchMeta {
    pub item: String,
    #[serde(default)]
    pub results: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailBody {
    #[serde(default)]
    pub entries: Vec<ListingRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingRecord {
    pub id: String,
    #[serde(default)]
    pub store_name: String,
    #[serde(default)]
    pub bundle: i64,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub quantity: i64,
}

impl From<DetailResponse> for DetailDocument {
    fn from(response: DetailResponse) -> Self {
        let entries = response
            .payload
            .into_iter()
            .flat_map(|payload| {
                let item_name = payload.search.item;
                let snapshot_time = payload.screenshot.timestamp;
                payload
                    .body
                    .entries
                    .into_iter()
                    .map(move |record| DetailEntry {
                        item_name: item_name.clone(),
                        snapshot_time: snapshot_time.clone(),
                        record_id: record.id,
                        seller_name: record.store_name,
                        bundle_size: record.bundle,
                        price: record.price,
                        quantity: record.quantity,
                    })
            })
            .collect();
        Self { entries }
    }
}

/// Per-item price statistics handed to persistence.
///
/// `snapshot_time` is one of the item's snapshots, not necessarily the latest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub item_name: String,
    pub snapshot_time: String,
    pub min_price: i64,
    pub p25: i64,
    pub p50: i64,
    pub p75: i64,
    pub max_price: i64,
    pub records: Vec<DetailEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no records aggregated for item {item_name}")]
pub struct EmptyAggregateError {
    pub item_name: String,
}

impl ItemSummary {
    /// Reduce an item's pooled records (across every snapshot) to a summary.
    pub fn from_records(
        item_name: impl Into<String>,
        snapshot_time: impl Into<String>,
        records: Vec<DetailEntry>,
    ) -> Result<Self, EmptyAggregateError> {
        let item_name = item_name.into();
        let mut prices: Vec<i64> = records.iter().map(|r| r.price).collect();
        prices.sort_unstable();

        let (Some(&min_price), Some(&max_price)) = (prices.first(), prices.last()) else {
            return Err(EmptyAggregateError { item_name });
        };
        let rank = |percentile| nearest_rank(&prices, percentile).unwrap_or(min_price);

        Ok(Self {
            item_name,
            snapshot_time: snapshot_time.into(),
            min_price,
            p25: rank(25),
            p50: rank(50),
            p75: rank(75),
            max_price,
            records,
        })
    }
}

/// Nearest-rank percentile over ascending `sorted` values.
///
/// Picks the value at 1-based rank `ceil(percentile / 100 * n)`, clamped to `[1, n]`.
pub fn nearest_rank(sorted: &[i64], percentile: u32) -> Option<i64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let scaled = (percentile.min(100) as usize) * n;
    let rank = scaled.div_ceil(100).clamp(1, n);
    Some(sorted[rank - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(item: &str, snapshot: &str, id: &str, price: i64) -> DetailEntry {
        DetailEntry {
            item_name: item.to_string(),
            snapshot_time: snapshot.to_string(),
            record_id: id.to_string(),
            seller_name: format!("store-{id}"),
            bundle_size: 1,
            price,
            quantity: 1,
        }
    }

    #[test]
    fn nearest_rank_does_not_interpolate() {
        let prices = [10, 20, 30, 40];
        assert_eq!(nearest_rank(&prices, 25), Some(10));
        assert_eq!(nearest_rank(&prices, 50), Some(20));
        assert_eq!(nearest_rank(&prices, 75), Some(30));
        assert_eq!(nearest_rank(&prices, 100), Some(40));
    }

    #[test]
    fn nearest_rank_clamps_low_percentiles_and_rejects_empty() {
        assert_eq!(nearest_rank(&[7, 9], 0), Some(7));
        assert_eq!(nearest_rank(&[42], 75), Some(42));
        assert_eq!(nearest_rank(&[], 50), None);
    }

    #[test]
    fn summary_pools_every_snapshot() {
        let records = vec![
            entry("Widget", "t1", "a", 15),
            entry("Widget", "t1", "b", 5),
            entry("Widget", "t2", "c", 25),
        ];
        let summary = ItemSummary::from_records("Widget", "t2", records).expect("summary");
        assert_eq!(summary.min_price, 5);
        assert_eq!(summary.p25, 5);
        assert_eq!(summary.p50, 15);
        assert_eq!(summary.p75, 25);
        assert_eq!(summary.max_price, 25);
        assert_eq!(summary.records.len(), 3);
    }

    #[test]
    fn empty_records_are_an_error_not_sentinels() {
        let err = ItemSummary::from_records("Ghost", "t1", Vec::new()).unwrap_err();
        assert_eq!(err.item_name, "Ghost");
    }

    #[test]
    fn index_rows_decode_into_descriptors() {
        let rows: Vec<ItemDescriptor> = serde_json::from_str(
            r#"[
                {"task_id": "abc", "search_item": "Widget", "search_item_timestamp": "2024-01-02T03:04:05Z",
                 "search_results": 12, "p0": 1, "p25": 2, "p50": 3, "p75": 4, "p100": 5,
                 "mean": 3.2, "std": 1.1, "n_owled": 40},
                {"task_id": "def", "search_item": "", "p0": 1}
            ]"#,
        )
        .expect("decode index");

        assert_eq!(rows[0].reference_id, "abc");
        assert_eq!(rows[0].declared_item_name.as_deref(), Some("Widget"));
        let stats = rows[0].declared_percentiles.as_ref().expect("stats");
        assert_eq!((stats.p0, stats.p50, stats.p100), (1, 3, 5));
        assert_eq!(stats.n_owled, Some(40));

        assert_eq!(rows[1], ItemDescriptor::new("def"));
    }

    #[test]
    fn detail_payloads_flatten_into_stamped_entries() {
        let doc: DetailDocument = serde_json::from_str(
            r#"{"payload": [
                {"screenshot": {"timestamp": "t1"}, "search": {"item": "Widget", "results": 2},
                 "body": {"entries": [
                    {"id": "a", "store_name": "Alpha", "bundle": 1, "price": 5, "quantity": 3},
                    {"id": "b", "store_name": "Beta", "bundle": 10, "price": 15, "quantity": 1}
                 ]}},
                {"screenshot": {"timestamp": "t2"}, "search": {"item": "Gadget"}}
            ]}"#,
        )
        .expect("decode detail");

        assert_eq!(doc.entries.len(), 2);
        assert_eq!(doc.entries[1].item_name, "Widget");
        assert_eq!(doc.entries[1].snapshot_time, "t1");
        assert_eq!(doc.entries[1].seller_name, "Beta");
        assert_eq!(doc.entries[1].bundle_size, 10);
    }

    #[test]
    fn listings_missing_numeric_fields_default_to_zero() {
        let doc: DetailDocument = serde_json::from_str(
            r#"{"payload": [
                {"screenshot": {"timestamp": "t1"}, "search": {"item": "Widget"},
                 "body": {"entries": [
                    {"id": "a", "store_name": "Alpha", "price": 5},
                    {"id": "b", "store_name": "Beta", "bundle": 2, "price": 9, "quantity": 4}
                 ]}}
            ]}"#,
        )
        .expect("listing with missing fields still decodes");

        assert_eq!(doc.entries.len(), 2);
        assert_eq!(doc.entries[0].bundle_size, 0);
        assert_eq!(doc.entries[0].quantity, 0);
        assert_eq!(doc.entries[0].price, 5);
        assert_eq!(doc.entries[1].quantity, 4);
    }

    proptest! {
        #[test]
        fn summary_percentiles_are_ordered(prices in proptest::collection::vec(-1_000_000i64..1_000_000, 1..200)) {
            let records = prices
                .iter()
                .enumerate()
                .map(|(i, p)| entry("Item", "t", &i.to_string(), *p))
                .collect();
            let s = ItemSummary::from_records("Item", "t", records).unwrap();
            prop_assert!(s.min_price <= s.p25);
            prop_assert!(s.p25 <= s.p50);
            prop_assert!(s.p50 <= s.p75);
            prop_assert!(s.p75 <= s.max_price);
            prop_assert_eq!(s.min_price, *prices.iter().min().unwrap());
            prop_assert_eq!(s.max_price, *prices.iter().max().unwrap());
        }
    }
}
