//! Process-local repository backed by DashMap
//!
//! Used by tests and by the `memory` backend. Applies the same merge rules as
//! the SQL repository through [`crate::storage::merge`].

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::HashMap;

use crate::analytics::models::{
    Aggregation, DeviceAggregation, RollupEntry, SourceAggregation, DATE_FORMAT,
};
use crate::analytics::sketch::CardinalitySketch;
use crate::analytics::storage::{DateRange, DeviceTotal, PathStat, PathTotal, SourceTotal};
use crate::storage::merge::{merge_count_row, merge_path_row, CountRow, PathRow};
use crate::storage::trait_def::{effective_limit, RollupRepository, StorageResult};

#[derive(Debug, Clone)]
struct StoredPath {
    date: String,
    path: String,
    row: PathRow,
}

#[derive(Debug, Clone)]
struct StoredCount {
    date: String,
    /// Source domain, or browser for device rows
    primary: String,
    /// OS for device rows, empty for source rows
    secondary: String,
    row: CountRow,
}

/// In-memory [`RollupRepository`]
#[derive(Default)]
pub struct MemoryRepository {
    paths: DashMap<String, StoredPath>,
    sources: DashMap<String, StoredCount>,
    devices: DashMap<String, StoredCount>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows across all rollup kinds
    pub fn row_count(&self) -> usize {
        self.paths.len() + self.sources.len() + self.devices.len()
    }

    /// Stored path row for a rollup key, if any
    pub fn path_row(&self, key: &str) -> Option<PathStat> {
        self.paths.get(key).map(|stored| path_stat(&stored))
    }

    /// Stored visitor count of a source row, if any
    pub fn source_visitors(&self, key: &str) -> Option<i64> {
        self.sources.get(key).map(|stored| stored.row.visitors)
    }

    /// Stored visitor count of a device row, if any
    pub fn device_visitors(&self, key: &str) -> Option<i64> {
        self.devices.get(key).map(|stored| stored.row.visitors)
    }

    fn upsert_count(
        map: &DashMap<String, StoredCount>,
        key: String,
        date: &str,
        primary: &str,
        secondary: &str,
        visitors: u64,
        sketch: &CardinalitySketch,
    ) {
        let mut entry = map.entry(key.clone()).or_insert_with(|| StoredCount {
            date: date.to_string(),
            primary: primary.to_string(),
            secondary: secondary.to_string(),
            row: CountRow::default(),
        });
        let current = std::mem::take(&mut entry.row);
        entry.row = merge_count_row(Some(current), visitors, sketch, &key);
    }
}

fn path_stat(stored: &StoredPath) -> PathStat {
    PathStat {
        date: stored.date.clone(),
        path: stored.path.clone(),
        pageviews: stored.row.pageviews,
        visitors: stored.row.visitors,
        duration_sum_ms: stored.row.duration_sum_ms,
        duration_samples: stored.row.duration_samples,
    }
}

/// Group visitor counts by dimension, most visitors first, ties by name
fn top_counts(
    map: &DashMap<String, StoredCount>,
    range: &DateRange,
) -> Vec<((String, String), i64)> {
    let mut grouped: HashMap<(String, String), i64> = HashMap::new();
    for entry in map.iter().filter(|entry| range.contains(&entry.date)) {
        let total = grouped
            .entry((entry.primary.clone(), entry.secondary.clone()))
            .or_default();
        *total = total.saturating_add(entry.row.visitors);
    }

    let mut totals: Vec<_> = grouped.into_iter().collect();
    totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    totals
}

#[async_trait]
impl RollupRepository for MemoryRepository {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn upsert_path_rollup(&self, entry: &Aggregation) -> StorageResult<()> {
        let key = entry.key();
        let mut stored = self.paths.entry(key.clone()).or_insert_with(|| StoredPath {
            date: entry.date.clone(),
            path: entry.path.clone(),
            row: PathRow::default(),
        });
        let current = std::mem::take(&mut stored.row);
        stored.row = merge_path_row(Some(current), entry, &key);
        Ok(())
    }

    async fn upsert_source_rollup(&self, entry: &SourceAggregation) -> StorageResult<()> {
        Self::upsert_count(
            &self.sources,
            entry.key(),
            &entry.date,
            &entry.source,
            "",
            entry.visitors,
            &entry.sketch,
        );
        Ok(())
    }

    async fn upsert_device_rollup(&self, entry: &DeviceAggregation) -> StorageResult<()> {
        Self::upsert_count(
            &self.devices,
            entry.key(),
            &entry.date,
            &entry.browser,
            &entry.os,
            entry.visitors,
            &entry.sketch,
        );
        Ok(())
    }

    async fn query_path_rollups(&self, range: DateRange) -> StorageResult<Vec<PathStat>> {
        let mut stats: Vec<PathStat> = self
            .paths
            .iter()
            .filter(|entry| range.contains(&entry.date))
            .map(|entry| path_stat(&entry))
            .collect();
        stats.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));
        Ok(stats)
    }

    async fn query_top_paths(&self, range: DateRange, limit: i64) -> StorageResult<Vec<PathTotal>> {
        let mut grouped: HashMap<String, (i64, i64)> = HashMap::new();
        for entry in self.paths.iter().filter(|entry| range.contains(&entry.date)) {
            let totals = grouped.entry(entry.path.clone()).or_default();
            totals.0 = totals.0.saturating_add(entry.row.pageviews);
            totals.1 = totals.1.saturating_add(entry.row.visitors);
        }

        let mut totals: Vec<PathTotal> = grouped
            .into_iter()
            .map(|(path, (pageviews, visitors))| PathTotal {
                path,
                pageviews,
                visitors,
            })
            .collect();
        totals.sort_by(|a, b| {
            Reverse(a.pageviews)
                .cmp(&Reverse(b.pageviews))
                .then_with(|| a.path.cmp(&b.path))
        });
        totals.truncate(effective_limit(limit) as usize);
        Ok(totals)
    }

    async fn query_top_sources(
        &self,
        range: DateRange,
        limit: i64,
    ) -> StorageResult<Vec<SourceTotal>> {
        Ok(top_counts(&self.sources, &range)
            .into_iter()
            .take(effective_limit(limit) as usize)
            .map(|((source, _), visitors)| SourceTotal { source, visitors })
            .collect())
    }

    async fn query_device_breakdown(&self, range: DateRange) -> StorageResult<Vec<DeviceTotal>> {
        Ok(top_counts(&self.devices, &range)
            .into_iter()
            .map(|((browser, os), visitors)| DeviceTotal {
                browser,
                os,
                visitors,
            })
            .collect())
    }

    async fn query_cardinality_sketches(&self, range: DateRange) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self
            .paths
            .iter()
            .filter(|entry| range.contains(&entry.date))
            .filter_map(|entry| entry.row.sketch.clone())
            .filter(|sketch| !sketch.is_empty())
            .collect())
    }

    async fn delete_older_than(&self, cutoff: NaiveDate) -> StorageResult<u64> {
        let cutoff = cutoff.format(DATE_FORMAT).to_string();
        let before = self.row_count();

        self.paths.retain(|_, stored| stored.date >= cutoff);
        self.sources.retain(|_, stored| stored.date >= cutoff);
        self.devices.retain(|_, stored| stored.date >= cutoff);

        Ok(before.saturating_sub(self.row_count()) as u64)
    }
}
