//! Integration tests for the rollup repositories
//!
//! Every scenario runs against both repository implementations so they keep
//! identical merge semantics.
//!
//! Tests can be filtered by backend using the TALLY_TEST_BACKEND environment variable:
//! - `TALLY_TEST_BACKEND=sqlite cargo test` - Run only SQLite tests
//! - `TALLY_TEST_BACKEND=memory cargo test` - Run only in-memory tests
//! - By default, both backends are tested

use chrono::NaiveDate;
use std::sync::Arc;
use tally::analytics::models::{Aggregation, DeviceAggregation, SourceAggregation};
use tally::analytics::{summarize, CardinalitySketch, DateRange};
use tally::storage::{MemoryRepository, RollupRepository, SqliteRepository};

/// Get the backends to test from environment variable
fn should_test_backend(backend: &str) -> bool {
    match std::env::var("TALLY_TEST_BACKEND") {
        Ok(val) => val.to_lowercase() == backend.to_lowercase(),
        Err(_) => true, // Test all backends if not specified
    }
}

/// Helper to create SQLite test repository
async fn create_sqlite_repository() -> Arc<dyn RollupRepository> {
    let repo = SqliteRepository::new("sqlite::memory:", 5).await.unwrap();
    repo.init().await.unwrap();
    Arc::new(repo)
}

/// Helper to create in-memory test repository
async fn create_memory_repository() -> Arc<dyn RollupRepository> {
    let repo = MemoryRepository::new();
    repo.init().await.unwrap();
    Arc::new(repo)
}

async fn repositories() -> Vec<(&'static str, Arc<dyn RollupRepository>)> {
    let mut repos = Vec::new();
    if should_test_backend("sqlite") {
        repos.push(("sqlite", create_sqlite_repository().await));
    }
    if should_test_backend("memory") {
        repos.push(("memory", create_memory_repository().await));
    }
    repos
}

fn as_refs(ids: &[String]) -> Vec<&str> {
    ids.iter().map(String::as_str).collect()
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn path_agg(day: &str, path: &str, pageviews: u64, sessions: &[&str]) -> Aggregation {
    let mut agg = Aggregation::new(day, path);
    agg.pageviews = pageviews;
    for session in sessions {
        agg.sketch.add(session);
    }
    agg
}

fn source_agg(day: &str, source: &str, visitors: u64, sessions: &[&str]) -> SourceAggregation {
    let mut agg = SourceAggregation::new(day, source);
    agg.visitors = visitors;
    for session in sessions {
        agg.sketch.add(session);
    }
    agg
}

fn device_agg(day: &str, browser: &str, os: &str, visitors: u64) -> DeviceAggregation {
    let mut agg = DeviceAggregation::new(day, browser, os);
    agg.visitors = visitors;
    agg
}

#[tokio::test]
async fn test_upserts_are_additive() {
    for (backend, repo) in repositories().await {
        let entry = path_agg("2026-01-09", "/home", 3, &["a", "b"]);
        repo.upsert_path_rollup(&entry).await.unwrap();
        repo.upsert_path_rollup(&entry).await.unwrap();

        let range = DateRange::new(date("2026-01-09"), date("2026-01-09"));
        let rows = repo.query_path_rollups(range).await.unwrap();
        assert_eq!(rows.len(), 1, "{backend}");
        assert_eq!(rows[0].pageviews, 6, "{backend}: counters must add");
        assert_eq!(rows[0].visitors, 2, "{backend}: same sessions must not double visitors");
    }
}

#[tokio::test]
async fn test_sketch_union_across_upserts() {
    for (backend, repo) in repositories().await {
        let sessions: Vec<String> = (0..200).map(|i| format!("session-{i}")).collect();

        // Sessions 100..120 appear in both batches
        repo.upsert_path_rollup(&path_agg("2026-01-09", "/", 120, &as_refs(&sessions[..120])))
            .await
            .unwrap();
        repo.upsert_path_rollup(&path_agg("2026-01-09", "/", 100, &as_refs(&sessions[100..])))
            .await
            .unwrap();

        let range = DateRange::new(date("2026-01-09"), date("2026-01-09"));
        let rows = repo.query_path_rollups(range).await.unwrap();
        assert_eq!(rows[0].pageviews, 220, "{backend}");
        let visitors = rows[0].visitors as f64;
        assert!((visitors - 200.0).abs() <= 10.0, "{backend}: visitors {visitors}");

        let sketches = repo.query_cardinality_sketches(range).await.unwrap();
        assert_eq!(sketches.len(), 1, "{backend}");
        let stored = CardinalitySketch::from_bytes(&sketches[0]).unwrap();
        assert_eq!(stored.estimate() as i64, rows[0].visitors, "{backend}");
    }
}

#[tokio::test]
async fn test_sources_and_devices_breakdown() {
    for (backend, repo) in repositories().await {
        repo.upsert_source_rollup(&source_agg("2026-01-08", "google.com", 4, &["a"]))
            .await
            .unwrap();
        repo.upsert_source_rollup(&source_agg("2026-01-09", "google.com", 2, &["b"]))
            .await
            .unwrap();
        repo.upsert_source_rollup(&source_agg("2026-01-09", "news.ycombinator.com", 5, &[]))
            .await
            .unwrap();
        repo.upsert_source_rollup(&source_agg("2026-01-09", "direct", 1, &[]))
            .await
            .unwrap();

        repo.upsert_device_rollup(&device_agg("2026-01-09", "Chrome", "Windows", 3))
            .await
            .unwrap();
        repo.upsert_device_rollup(&device_agg("2026-01-09", "Safari", "iOS", 8))
            .await
            .unwrap();
        repo.upsert_device_rollup(&device_agg("2026-01-08", "Chrome", "Windows", 2))
            .await
            .unwrap();

        let range = DateRange::new(date("2026-01-08"), date("2026-01-09"));
        let sources = repo.query_top_sources(range, 2).await.unwrap();
        let names: Vec<_> = sources.iter().map(|s| (s.source.as_str(), s.visitors)).collect();
        assert_eq!(
            names,
            vec![("google.com", 6), ("news.ycombinator.com", 5)],
            "{backend}"
        );

        let devices = repo.query_device_breakdown(range).await.unwrap();
        let devices: Vec<_> = devices
            .iter()
            .map(|d| (d.browser.as_str(), d.os.as_str(), d.visitors))
            .collect();
        assert_eq!(
            devices,
            vec![("Safari", "iOS", 8), ("Chrome", "Windows", 5)],
            "{backend}"
        );

        // Only the second day
        let one_day = DateRange::new(date("2026-01-09"), date("2026-01-09"));
        let sources = repo.query_top_sources(one_day, 10).await.unwrap();
        assert_eq!(sources.len(), 3, "{backend}");
        assert_eq!(sources[0].source, "news.ycombinator.com", "{backend}");
    }
}

#[tokio::test]
async fn test_top_paths_ordering_and_limit() {
    for (backend, repo) in repositories().await {
        for (day, path, pv) in [
            ("2026-01-07", "/blog", 2),
            ("2026-01-08", "/blog", 9),
            ("2026-01-08", "/home", 10),
            ("2026-01-09", "/pricing", 4),
            ("2026-01-09", "/about", 4),
        ] {
            repo.upsert_path_rollup(&path_agg(day, path, pv, &[]))
                .await
                .unwrap();
        }

        let range = DateRange::new(date("2026-01-07"), date("2026-01-09"));
        let top = repo.query_top_paths(range, 3).await.unwrap();
        let order: Vec<_> = top.iter().map(|t| (t.path.as_str(), t.pageviews)).collect();
        assert_eq!(order, vec![("/blog", 11), ("/home", 10), ("/about", 4)], "{backend}");

        let fallback = repo.query_top_paths(range, 0).await.unwrap();
        assert_eq!(fallback.len(), 4, "{backend}");
    }
}

#[tokio::test]
async fn test_delete_older_than_removes_only_old_rows() {
    for (backend, repo) in repositories().await {
        for day in ["2026-01-01", "2026-01-05", "2026-01-09"] {
            repo.upsert_path_rollup(&path_agg(day, "/", 1, &["a"]))
                .await
                .unwrap();
            repo.upsert_source_rollup(&source_agg(day, "google.com", 1, &[]))
                .await
                .unwrap();
            repo.upsert_device_rollup(&device_agg(day, "Firefox", "Linux", 1))
                .await
                .unwrap();
        }

        let removed = repo.delete_older_than(date("2026-01-05")).await.unwrap();
        assert_eq!(removed, 3, "{backend}");

        let range = DateRange::new(date("2026-01-01"), date("2026-01-31"));
        let rows = repo.query_path_rollups(range).await.unwrap();
        let days: Vec<_> = rows.iter().map(|r| r.date.as_str()).collect();
        assert_eq!(days, vec!["2026-01-05", "2026-01-09"], "{backend}");

        let devices = repo.query_device_breakdown(range).await.unwrap();
        assert_eq!(devices[0].visitors, 2, "{backend}");

        assert_eq!(repo.delete_older_than(date("2026-01-05")).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_summary_over_repository() {
    for (backend, repo) in repositories().await {
        repo.upsert_path_rollup(&path_agg("2026-01-08", "/", 2, &["alice", "bob"]))
            .await
            .unwrap();
        repo.upsert_path_rollup(&path_agg("2026-01-09", "/", 2, &["alice", "bob"]))
            .await
            .unwrap();
        repo.upsert_path_rollup(&path_agg("2026-01-09", "/docs", 1, &["dave"]))
            .await
            .unwrap();

        let range = DateRange::new(date("2026-01-08"), date("2026-01-09"));
        let summary = summarize(repo.as_ref(), range).await.unwrap();
        assert_eq!(summary.total_pageviews, 5, "{backend}");
        assert_eq!(summary.total_visitors, 3, "{backend}");
        assert_eq!(summary.daily.len(), 2, "{backend}");
        assert_eq!(summary.daily[1].visitors, 3, "{backend}");
    }
}
