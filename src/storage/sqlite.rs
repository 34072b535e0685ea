use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use crate::analytics::models::{
    Aggregation, DeviceAggregation, RollupEntry, SourceAggregation, DATE_FORMAT,
};
use crate::analytics::sketch::CardinalitySketch;
use crate::analytics::storage::{DateRange, DeviceTotal, PathStat, PathTotal, SourceTotal};
use crate::storage::merge::{merge_count_row, merge_path_row, CountRow, PathRow};
use crate::storage::trait_def::{effective_limit, RollupRepository, StorageResult};

pub struct SqliteRepository {
    pool: Arc<SqlitePool>,
}

impl SqliteRepository {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut options = SqlitePoolOptions::new().max_connections(max_connections.max(1));

        // Every connection to an in-memory database opens a fresh database,
        // so keep exactly one connection alive for the lifetime of the pool.
        if is_in_memory(database_url) {
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = options.connect(database_url).await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn upsert_count_row(
        &self,
        table: CountTable,
        key: &str,
        date: &str,
        dimensions: (&str, Option<&str>),
        visitors: u64,
        sketch: &CardinalitySketch,
    ) -> StorageResult<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let stored: Option<(i64, Option<Vec<u8>>)> =
            sqlx::query_as(&format!("SELECT visitors, sketch FROM {} WHERE id = ?", table.name()))
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        let stored = stored.map(|(visitors, sketch)| CountRow { visitors, sketch });
        let row = merge_count_row(stored, visitors, sketch, key);

        match table {
            CountTable::Sources => {
                sqlx::query(
                    r#"
                    INSERT INTO rollup_sources (id, date, source, visitors, sketch, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        visitors = excluded.visitors,
                        sketch = excluded.sketch,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(key)
                .bind(date)
                .bind(dimensions.0)
                .bind(row.visitors)
                .bind(row.sketch)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            CountTable::Devices => {
                sqlx::query(
                    r#"
                    INSERT INTO rollup_devices (id, date, browser, os, visitors, sketch, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        visitors = excluded.visitors,
                        sketch = excluded.sketch,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(key)
                .bind(date)
                .bind(dimensions.0)
                .bind(dimensions.1.unwrap_or_default())
                .bind(row.visitors)
                .bind(row.sketch)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum CountTable {
    Sources,
    Devices,
}

impl CountTable {
    fn name(self) -> &'static str {
        match self {
            CountTable::Sources => "rollup_sources",
            CountTable::Devices => "rollup_devices",
        }
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

#[async_trait]
impl RollupRepository for SqliteRepository {
    async fn init(&self) -> StorageResult<()> {
        // Path rollups: one row per date + path
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rollup_paths (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                path TEXT NOT NULL,
                pageviews INTEGER NOT NULL DEFAULT 0,
                visitors INTEGER NOT NULL DEFAULT 0,
                duration_sum_ms INTEGER NOT NULL DEFAULT 0,
                duration_samples INTEGER NOT NULL DEFAULT 0,
                sketch BLOB,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rollup_paths_date ON rollup_paths(date)")
            .execute(self.pool.as_ref())
            .await?;

        // Source rollups: one row per date + referrer domain
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rollup_sources (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                source TEXT NOT NULL,
                visitors INTEGER NOT NULL DEFAULT 0,
                sketch BLOB,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rollup_sources_date ON rollup_sources(date)")
            .execute(self.pool.as_ref())
            .await?;

        // Device rollups: one row per date + browser + OS
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rollup_devices (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                browser TEXT NOT NULL,
                os TEXT NOT NULL,
                visitors INTEGER NOT NULL DEFAULT 0,
                sketch BLOB,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rollup_devices_date ON rollup_devices(date)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn upsert_path_rollup(&self, entry: &Aggregation) -> StorageResult<()> {
        let key = entry.key();
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query_as::<_, (i64, i64, i64, i64, Option<Vec<u8>>)>(
            r#"
            SELECT pageviews, visitors, duration_sum_ms, duration_samples, sketch
            FROM rollup_paths
            WHERE id = ?
            "#,
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?
        .map(
            |(pageviews, visitors, duration_sum_ms, duration_samples, sketch)| PathRow {
                pageviews,
                visitors,
                duration_sum_ms,
                duration_samples,
                sketch,
            },
        );

        let row = merge_path_row(stored, entry, &key);

        sqlx::query(
            r#"
            INSERT INTO rollup_paths
                (id, date, path, pageviews, visitors, duration_sum_ms, duration_samples, sketch, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                pageviews = excluded.pageviews,
                visitors = excluded.visitors,
                duration_sum_ms = excluded.duration_sum_ms,
                duration_samples = excluded.duration_samples,
                sketch = excluded.sketch,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key)
        .bind(&entry.date)
        .bind(&entry.path)
        .bind(row.pageviews)
        .bind(row.visitors)
        .bind(row.duration_sum_ms)
        .bind(row.duration_samples)
        .bind(row.sketch)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(key = %key, pageviews = row.pageviews, "Upserted path rollup");
        Ok(())
    }

    async fn upsert_source_rollup(&self, entry: &SourceAggregation) -> StorageResult<()> {
        self.upsert_count_row(
            CountTable::Sources,
            &entry.key(),
            &entry.date,
            (&entry.source, None),
            entry.visitors,
            &entry.sketch,
        )
        .await
    }

    async fn upsert_device_rollup(&self, entry: &DeviceAggregation) -> StorageResult<()> {
        self.upsert_count_row(
            CountTable::Devices,
            &entry.key(),
            &entry.date,
            (&entry.browser, Some(&entry.os)),
            entry.visitors,
            &entry.sketch,
        )
        .await
    }

    async fn query_path_rollups(&self, range: DateRange) -> StorageResult<Vec<PathStat>> {
        let rows = sqlx::query_as::<_, PathStat>(
            r#"
            SELECT date, path, pageviews, visitors, duration_sum_ms, duration_samples
            FROM rollup_paths
            WHERE date >= ? AND date <= ?
            ORDER BY date ASC, path ASC
            "#,
        )
        .bind(range.start_key())
        .bind(range.end_key())
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows)
    }

    async fn query_top_paths(&self, range: DateRange, limit: i64) -> StorageResult<Vec<PathTotal>> {
        let rows = sqlx::query_as::<_, PathTotal>(
            r#"
            SELECT path,
                   CAST(SUM(pageviews) AS INTEGER) AS pageviews,
                   CAST(SUM(visitors) AS INTEGER) AS visitors
            FROM rollup_paths
            WHERE date >= ? AND date <= ?
            GROUP BY path
            ORDER BY pageviews DESC, path ASC
            LIMIT ?
            "#,
        )
        .bind(range.start_key())
        .bind(range.end_key())
        .bind(effective_limit(limit))
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows)
    }

    async fn query_top_sources(
        &self,
        range: DateRange,
        limit: i64,
    ) -> StorageResult<Vec<SourceTotal>> {
        let rows = sqlx::query_as::<_, SourceTotal>(
            r#"
            SELECT source, CAST(SUM(visitors) AS INTEGER) AS visitors
            FROM rollup_sources
            WHERE date >= ? AND date <= ?
            GROUP BY source
            ORDER BY visitors DESC, source ASC
            LIMIT ?
            "#,
        )
        .bind(range.start_key())
        .bind(range.end_key())
        .bind(effective_limit(limit))
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows)
    }

    async fn query_device_breakdown(&self, range: DateRange) -> StorageResult<Vec<DeviceTotal>> {
        let rows = sqlx::query_as::<_, DeviceTotal>(
            r#"
            SELECT browser, os, CAST(SUM(visitors) AS INTEGER) AS visitors
            FROM rollup_devices
            WHERE date >= ? AND date <= ?
            GROUP BY browser, os
            ORDER BY visitors DESC, browser ASC, os ASC
            "#,
        )
        .bind(range.start_key())
        .bind(range.end_key())
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows)
    }

    async fn query_cardinality_sketches(&self, range: DateRange) -> StorageResult<Vec<Vec<u8>>> {
        let sketches = sqlx::query_scalar::<_, Vec<u8>>(
            r#"
            SELECT sketch
            FROM rollup_paths
            WHERE date >= ? AND date <= ? AND sketch IS NOT NULL AND length(sketch) > 0
            ORDER BY date ASC, path ASC
            "#,
        )
        .bind(range.start_key())
        .bind(range.end_key())
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(sketches)
    }

    async fn delete_older_than(&self, cutoff: NaiveDate) -> StorageResult<u64> {
        let cutoff = cutoff.format(DATE_FORMAT).to_string();
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for table in ["rollup_paths", "rollup_sources", "rollup_devices"] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE date < ?"))
                .bind(&cutoff)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }
}
