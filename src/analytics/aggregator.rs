//! Periodic rollup flusher
//!
//! A background task drains the [`RollupBuffer`] on a fixed interval and writes
//! every rollup entry through the [`RollupRepository`]. Entries are removed from
//! the drained snapshot as they are committed, so whatever is left after a
//! failure is exactly what still needs writing; that remainder is restored into
//! the live buffer and picked up by the next cycle.
//!
//! The raw list is exported independently once it crosses its size threshold.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::buffer::{RollupBuffer, RollupSnapshot};
use crate::analytics::export::RawExporter;
use crate::storage::{RollupRepository, StorageError, StorageResult};

/// Interval used when the aggregator is created with a zero interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound of the retry backoff
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("rollup commit failed: {0}")]
    Repository(#[from] StorageError),
    #[error("rollup commit failed after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: StorageError },
    #[error("rollup flush cancelled")]
    Cancelled,
}

/// Delay before retry number `attempt + 1`: `min(base * 2^attempt, MAX_RETRY_DELAY)`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}

struct FlushTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drains the buffer into the repository on a timer
pub struct RollupAggregator {
    buffer: Arc<RollupBuffer>,
    repository: Arc<dyn RollupRepository>,
    exporter: Arc<dyn RawExporter>,
    flush_interval: Duration,
    task: Mutex<Option<FlushTask>>,
}

impl RollupAggregator {
    pub fn new(
        buffer: Arc<RollupBuffer>,
        repository: Arc<dyn RollupRepository>,
        exporter: Arc<dyn RawExporter>,
        flush_interval: Duration,
    ) -> Self {
        let flush_interval = if flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            flush_interval
        };

        Self {
            buffer,
            repository,
            exporter,
            flush_interval,
            task: Mutex::new(None),
        }
    }

    pub fn buffer(&self) -> &Arc<RollupBuffer> {
        &self.buffer
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Whether the background flush task is alive
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Spawn the background flush task; no-op while it is already running
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.run(token).await });

        *task = Some(FlushTask { cancel, handle });
        info!(
            interval_ms = self.flush_interval.as_millis() as u64,
            "Rollup aggregator started"
        );
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);

        // Skip the first tick which fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Periodic rollup flush failed, will retry next cycle");
                    }
                }
            }
        }

        debug!("Rollup flush task exited");
    }

    /// Stop the background task, wait for it to exit, then flush once more
    ///
    /// Returns the result of that final flush. Calling `stop` on an aggregator
    /// that is not running does nothing.
    pub async fn stop(&self) -> Result<(), FlushError> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Rollup flush task ended abnormally");
        }

        info!("Rollup aggregator stopped, running final flush");
        self.flush().await
    }

    /// Drain and commit all rollups once, then export raw events if needed
    ///
    /// The first failing upsert aborts the commit. Entries written before it
    /// stay written, everything else is restored into the buffer.
    pub async fn flush(&self) -> Result<(), FlushError> {
        let mut snapshot = self.buffer.drain_snapshot();

        let result = if snapshot.is_empty() {
            Ok(())
        } else {
            let total = snapshot.len();
            match self.commit(&mut snapshot).await {
                Ok(()) => {
                    debug!(entries = total, "Flushed rollups");
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        committed = total - snapshot.len(),
                        restored = snapshot.len(),
                        error = %e,
                        "Rollup flush failed, restoring uncommitted entries"
                    );
                    self.buffer.restore_snapshot(snapshot);
                    Err(FlushError::Repository(e))
                }
            }
        };

        self.export_raw_if_needed().await;
        result
    }

    /// Drain once and commit with bounded retries
    ///
    /// Makes up to `max_retries + 1` attempts, waiting
    /// [`backoff_delay`]`(retry_delay, n)` between them. Each attempt only
    /// writes entries that are not committed yet. Cancellation is checked
    /// before every attempt and interrupts any wait; in that case, and when
    /// attempts run out, uncommitted entries are restored into the buffer.
    pub async fn flush_with_retry(
        &self,
        max_retries: u32,
        retry_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FlushError> {
        let mut snapshot = self.buffer.drain_snapshot();
        if snapshot.is_empty() {
            self.export_raw_if_needed().await;
            return Ok(());
        }

        let max_attempts = max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancel_flush(snapshot));
            }

            let err = match self.commit(&mut snapshot).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Rollup flush succeeded after retry");
                    }
                    self.export_raw_if_needed().await;
                    return Ok(());
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= max_attempts {
                error!(
                    attempts = attempt,
                    restored = snapshot.len(),
                    error = %err,
                    "Rollup flush failed after all retries, restoring uncommitted entries"
                );
                self.buffer.restore_snapshot(snapshot);
                return Err(FlushError::RetriesExhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = backoff_delay(retry_delay, attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Rollup flush failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancel_flush(snapshot)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancel_flush(&self, snapshot: RollupSnapshot) -> FlushError {
        info!(
            restored = snapshot.len(),
            "Rollup flush cancelled, restoring uncommitted entries"
        );
        self.buffer.restore_snapshot(snapshot);
        FlushError::Cancelled
    }

    /// Write every entry of the snapshot, removing each one once it is stored
    async fn commit(&self, snapshot: &mut RollupSnapshot) -> StorageResult<()> {
        while let Some(key) = first_key(&snapshot.paths) {
            if let Some(entry) = snapshot.paths.get(&key) {
                self.repository.upsert_path_rollup(entry).await?;
            }
            snapshot.paths.remove(&key);
        }

        while let Some(key) = first_key(&snapshot.sources) {
            if let Some(entry) = snapshot.sources.get(&key) {
                self.repository.upsert_source_rollup(entry).await?;
            }
            snapshot.sources.remove(&key);
        }

        while let Some(key) = first_key(&snapshot.devices) {
            if let Some(entry) = snapshot.devices.get(&key) {
                self.repository.upsert_device_rollup(entry).await?;
            }
            snapshot.devices.remove(&key);
        }

        Ok(())
    }

    async fn export_raw_if_needed(&self) {
        if !self.buffer.should_flush_raw() {
            return;
        }
        if let Err(e) = self.export_raw().await {
            error!(error = %e, "Raw event export failed");
        }
    }

    /// Drain the raw list and hand it to the exporter
    ///
    /// Returns the number of exported events. On failure the batch is dropped.
    pub async fn export_raw(&self) -> anyhow::Result<usize> {
        let events = self.buffer.drain_raw();
        let count = events.len();
        if count == 0 {
            return Ok(0);
        }

        self.exporter
            .export(events)
            .await
            .map_err(|e| e.context(format!("dropped {count} raw events")))?;

        debug!(events = count, "Exported raw events");
        Ok(count)
    }
}

fn first_key<T>(map: &HashMap<String, T>) -> Option<String> {
    map.keys().next().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::export::DiscardExporter;
    use crate::analytics::models::{Aggregation, DeviceAggregation, Event, SourceAggregation};
    use crate::analytics::storage::{DateRange, DeviceTotal, PathStat, PathTotal, SourceTotal};
    use crate::storage::MemoryRepository;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Memory repository that fails a configurable number of path upserts
    /// and optionally every source upsert
    struct FailingRepository {
        inner: MemoryRepository,
        path_failures: AtomicU32,
        fail_sources: bool,
        path_calls: AtomicU32,
    }

    impl FailingRepository {
        fn new(path_failures: u32, fail_sources: bool) -> Self {
            Self {
                inner: MemoryRepository::new(),
                path_failures: AtomicU32::new(path_failures),
                fail_sources,
                path_calls: AtomicU32::new(0),
            }
        }

        fn always() -> Self {
            Self::new(u32::MAX, false)
        }
    }

    #[async_trait]
    impl RollupRepository for FailingRepository {
        async fn init(&self) -> StorageResult<()> {
            Ok(())
        }

        async fn upsert_path_rollup(&self, entry: &Aggregation) -> StorageResult<()> {
            self.path_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.path_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != u32::MAX {
                    self.path_failures.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(StorageError::Unavailable("database is down".into()));
            }
            self.inner.upsert_path_rollup(entry).await
        }

        async fn upsert_source_rollup(&self, entry: &SourceAggregation) -> StorageResult<()> {
            if self.fail_sources {
                return Err(StorageError::Unavailable("sources table locked".into()));
            }
            self.inner.upsert_source_rollup(entry).await
        }

        async fn upsert_device_rollup(&self, entry: &DeviceAggregation) -> StorageResult<()> {
            self.inner.upsert_device_rollup(entry).await
        }

        async fn query_path_rollups(&self, range: DateRange) -> StorageResult<Vec<PathStat>> {
            self.inner.query_path_rollups(range).await
        }

        async fn query_top_paths(
            &self,
            range: DateRange,
            limit: i64,
        ) -> StorageResult<Vec<PathTotal>> {
            self.inner.query_top_paths(range, limit).await
        }

        async fn query_top_sources(
            &self,
            range: DateRange,
            limit: i64,
        ) -> StorageResult<Vec<SourceTotal>> {
            self.inner.query_top_sources(range, limit).await
        }

        async fn query_device_breakdown(
            &self,
            range: DateRange,
        ) -> StorageResult<Vec<DeviceTotal>> {
            self.inner.query_device_breakdown(range).await
        }

        async fn query_cardinality_sketches(
            &self,
            range: DateRange,
        ) -> StorageResult<Vec<Vec<u8>>> {
            self.inner.query_cardinality_sketches(range).await
        }

        async fn delete_older_than(&self, cutoff: NaiveDate) -> StorageResult<u64> {
            self.inner.delete_older_than(cutoff).await
        }
    }

    /// Records batch sizes, optionally failing every export
    #[derive(Default)]
    struct RecordingExporter {
        batches: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl RawExporter for RecordingExporter {
        async fn export(&self, events: Vec<Event>) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.batches.lock().push(events.len());
            Ok(())
        }
    }

    fn page_view(path: &str, session: &str) -> Event {
        let ts = Utc.with_ymd_and_hms(2026, 1, 9, 12, 0, 0).unwrap();
        Event::new(format!("{path}-{session}"), "page_view", path, ts)
            .with_session(session)
            .with_referrer("https://google.com/search?q=x")
            .with_client("Chrome", "Windows")
    }

    fn aggregator_with(
        repository: Arc<dyn RollupRepository>,
        max_raw_bytes: usize,
        exporter: Arc<dyn RawExporter>,
    ) -> Arc<RollupAggregator> {
        Arc::new(RollupAggregator::new(
            Arc::new(RollupBuffer::new(max_raw_bytes)),
            repository,
            exporter,
            Duration::from_secs(3600),
        ))
    }

    fn aggregator(repository: Arc<dyn RollupRepository>) -> Arc<RollupAggregator> {
        aggregator_with(repository, 0, Arc::new(DiscardExporter))
    }

    fn pageviews(buffer: &RollupBuffer, key: &str) -> u64 {
        buffer
            .drain_aggregations()
            .get(key)
            .map_or(0, |agg| agg.pageviews)
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, 40), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(Duration::ZERO, 3), Duration::ZERO);
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let agg = RollupAggregator::new(
            Arc::new(RollupBuffer::default()),
            Arc::new(MemoryRepository::new()),
            Arc::new(DiscardExporter),
            Duration::ZERO,
        );
        assert_eq!(agg.flush_interval(), DEFAULT_FLUSH_INTERVAL);
    }

    #[tokio::test]
    async fn test_flush_commits_all_kinds() {
        let repo = Arc::new(MemoryRepository::new());
        let agg = aggregator(repo.clone());
        for _ in 0..3 {
            agg.buffer().push(page_view("/home", "s1"));
        }
        agg.buffer().push(page_view("/pricing", "s2"));

        agg.flush().await.unwrap();

        assert_eq!(repo.path_row("2026-01-09|/home").unwrap().pageviews, 3);
        assert_eq!(repo.path_row("2026-01-09|/pricing").unwrap().pageviews, 1);
        assert_eq!(repo.source_visitors("2026-01-09|google.com"), Some(4));
        assert_eq!(repo.device_visitors("2026-01-09|Chrome|Windows"), Some(4));
        assert_eq!(agg.buffer().aggregation_count(), 0);

        // An empty flush is a no-op
        agg.flush().await.unwrap();
        assert_eq!(repo.path_row("2026-01-09|/home").unwrap().pageviews, 3);
    }

    #[tokio::test]
    async fn test_flush_failure_restores() {
        let agg = aggregator(Arc::new(FailingRepository::always()));
        agg.buffer().push(page_view("/home", "s1"));
        agg.buffer().push(page_view("/home", "s2"));

        let err = agg.flush().await.unwrap_err();
        assert!(matches!(err, FlushError::Repository(_)));
        assert_eq!(agg.buffer().source_aggregation_count(), 1);
        assert_eq!(pageviews(agg.buffer(), "2026-01-09|/home"), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_restores_only_uncommitted() {
        let repo = Arc::new(FailingRepository::new(0, true));
        let agg = aggregator(repo.clone());
        agg.buffer().push(page_view("/home", "s1"));
        agg.buffer().push(page_view("/docs", "s1"));

        assert!(agg.flush().await.is_err());

        // Paths were committed before the source upsert failed
        assert_eq!(repo.inner.path_row("2026-01-09|/home").unwrap().pageviews, 1);
        assert_eq!(agg.buffer().aggregation_count(), 0);
        assert_eq!(agg.buffer().source_aggregation_count(), 1);
        assert_eq!(agg.buffer().device_aggregation_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_preserves_counts() {
        let repo = Arc::new(FailingRepository::always());
        let agg = aggregator(repo.clone());
        agg.buffer().push(page_view("/home", "s1"));
        agg.buffer().push(page_view("/home", "s2"));

        let cancel = CancellationToken::new();
        let err = agg
            .flush_with_retry(2, Duration::from_millis(1), &cancel)
            .await
            .unwrap_err();

        match err {
            FlushError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(repo.path_calls.load(Ordering::SeqCst), 3);
        assert_eq!(pageviews(agg.buffer(), "2026-01-09|/home"), 2);
    }

    #[tokio::test]
    async fn test_retry_recovers_without_double_counting() {
        let repo = Arc::new(FailingRepository::new(2, false));
        let agg = aggregator(repo.clone());
        for _ in 0..5 {
            agg.buffer().push(page_view("/home", "s1"));
        }

        let cancel = CancellationToken::new();
        agg.flush_with_retry(3, Duration::from_millis(1), &cancel)
            .await
            .unwrap();

        assert_eq!(repo.inner.path_row("2026-01-09|/home").unwrap().pageviews, 5);
        assert_eq!(repo.inner.source_visitors("2026-01-09|google.com"), Some(5));
        assert_eq!(agg.buffer().aggregation_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let agg = aggregator(Arc::new(FailingRepository::always()));
        agg.buffer().push(page_view("/home", "s1"));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = agg
            .flush_with_retry(5, Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FlushError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pageviews(agg.buffer(), "2026-01-09|/home"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let repo = Arc::new(FailingRepository::new(0, false));
        let agg = aggregator(repo.clone());
        agg.buffer().push(page_view("/home", "s1"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agg
            .flush_with_retry(3, Duration::from_millis(1), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FlushError::Cancelled));
        assert_eq!(repo.path_calls.load(Ordering::SeqCst), 0);
        assert_eq!(agg.buffer().aggregation_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_with_retry_nothing_to_do() {
        let agg = aggregator(Arc::new(FailingRepository::always()));
        let cancel = CancellationToken::new();
        agg.flush_with_retry(3, Duration::from_millis(1), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let repo = Arc::new(MemoryRepository::new());
        let agg = aggregator(repo.clone());

        // Stop before start is a no-op
        agg.stop().await.unwrap();
        assert!(!agg.is_running());

        agg.start();
        agg.start();
        assert!(agg.is_running());

        agg.buffer().push(page_view("/home", "s1"));
        agg.stop().await.unwrap();
        assert!(!agg.is_running());

        // The final flush happened even though the interval never elapsed
        assert_eq!(repo.path_row("2026-01-09|/home").unwrap().pageviews, 1);

        agg.stop().await.unwrap();
        agg.start();
        assert!(agg.is_running());
        agg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_reports_final_flush_failure() {
        let agg = aggregator(Arc::new(FailingRepository::always()));
        agg.start();
        agg.buffer().push(page_view("/home", "s1"));

        assert!(agg.stop().await.is_err());
        assert_eq!(agg.buffer().aggregation_count(), 1);
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let repo = Arc::new(MemoryRepository::new());
        let agg = Arc::new(RollupAggregator::new(
            Arc::new(RollupBuffer::default()),
            repo.clone(),
            Arc::new(DiscardExporter),
            Duration::from_millis(20),
        ));
        agg.start();
        agg.buffer().push(page_view("/home", "s1"));

        let mut flushed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if repo.path_row("2026-01-09|/home").is_some() {
                flushed = true;
                break;
            }
        }
        assert!(flushed);
        assert!(agg.is_running());
        agg.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_export_at_threshold() {
        let exporter = Arc::new(RecordingExporter::default());
        let agg = aggregator_with(Arc::new(MemoryRepository::new()), 1, exporter.clone());
        agg.buffer().push(page_view("/a", "s1"));
        agg.buffer().push(page_view("/b", "s1"));

        agg.flush().await.unwrap();
        assert_eq!(*exporter.batches.lock(), vec![2]);
        assert_eq!(agg.buffer().len(), 0);
    }

    #[tokio::test]
    async fn test_raw_below_threshold_is_kept() {
        let exporter = Arc::new(RecordingExporter::default());
        let agg = aggregator_with(Arc::new(MemoryRepository::new()), 0, exporter.clone());
        agg.buffer().push(page_view("/a", "s1"));

        agg.flush().await.unwrap();
        assert!(exporter.batches.lock().is_empty());
        assert_eq!(agg.buffer().len(), 1);

        assert_eq!(agg.export_raw().await.unwrap(), 1);
        assert_eq!(agg.export_raw().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_raw_export_failure_does_not_fail_flush() {
        let exporter = Arc::new(RecordingExporter {
            batches: Mutex::new(Vec::new()),
            fail: true,
        });
        let repo = Arc::new(MemoryRepository::new());
        let agg = aggregator_with(repo.clone(), 1, exporter);
        agg.buffer().push(page_view("/a", "s1"));

        agg.flush().await.unwrap();
        assert_eq!(repo.path_row("2026-01-09|/a").unwrap().pageviews, 1);
        assert!(agg.buffer().is_empty());
    }
}
