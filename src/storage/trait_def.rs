use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::analytics::models::{Aggregation, DeviceAggregation, SourceAggregation};
use crate::analytics::storage::{DateRange, DeviceTotal, PathStat, PathTotal, SourceTotal};

/// Limit used when a query is given a non-positive one
pub const DEFAULT_QUERY_LIMIT: i64 = 10;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable store for rollups
///
/// Upserts are additive: counters of an incoming entry are added to whatever
/// is stored under the same key, and sketches are unioned. Writing the same
/// entry twice therefore doubles its counters, which is what a retried flush
/// relies on when only the uncommitted entries are re-sent.
#[async_trait]
pub trait RollupRepository: Send + Sync {
    /// Initialize the storage (create tables, indexes, etc.)
    async fn init(&self) -> StorageResult<()>;

    /// Add a path rollup into the stored row for the same date and path
    async fn upsert_path_rollup(&self, entry: &Aggregation) -> StorageResult<()>;

    /// Add a source rollup into the stored row for the same date and domain
    async fn upsert_source_rollup(&self, entry: &SourceAggregation) -> StorageResult<()>;

    /// Add a device rollup into the stored row for the same date, browser and OS
    async fn upsert_device_rollup(&self, entry: &DeviceAggregation) -> StorageResult<()>;

    /// All path rows in range, ordered by date then path
    async fn query_path_rollups(&self, range: DateRange) -> StorageResult<Vec<PathStat>>;

    /// Paths with the most pageviews in range
    async fn query_top_paths(&self, range: DateRange, limit: i64)
        -> StorageResult<Vec<PathTotal>>;

    /// Referrer domains with the most visitors in range
    async fn query_top_sources(
        &self,
        range: DateRange,
        limit: i64,
    ) -> StorageResult<Vec<SourceTotal>>;

    /// Visitors per browser/OS pair in range, most visitors first
    async fn query_device_breakdown(&self, range: DateRange) -> StorageResult<Vec<DeviceTotal>>;

    /// Serialized path sketches in range, for cross-day unique visitor estimates
    async fn query_cardinality_sketches(&self, range: DateRange) -> StorageResult<Vec<Vec<u8>>>;

    /// Delete rows dated strictly before `cutoff` from every rollup table
    ///
    /// Returns the number of rows removed.
    async fn delete_older_than(&self, cutoff: NaiveDate) -> StorageResult<u64>;
}

/// Clamp a caller-provided limit to something usable
pub fn effective_limit(limit: i64) -> i64 {
    if limit > 0 {
        limit
    } else {
        DEFAULT_QUERY_LIMIT
    }
}
