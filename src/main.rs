use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tally::analytics::{
    DiscardExporter, Event, JsonLinesExporter, RawExporter, RollupAggregator, RollupBuffer,
};
use tally::config::Config;
use tally::storage::open_repository;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    // Initialize storage
    let repository = open_repository(&config.database).await?;
    info!("Repository initialized successfully");

    let exporter: Arc<dyn RawExporter> = match &config.raw_export.dir {
        Some(dir) => Arc::new(JsonLinesExporter::new(dir).await?),
        None => {
            info!("No TALLY_RAW_EXPORT_DIR set, raw events will be discarded after each export cycle");
            Arc::new(DiscardExporter)
        }
    };

    let buffer = Arc::new(RollupBuffer::new(config.flush.max_raw_bytes));
    let aggregator = Arc::new(RollupAggregator::new(
        Arc::clone(&buffer),
        repository,
        exporter,
        config.flush.interval(),
    ));
    aggregator.start();

    let (accepted, rejected) = ingest(&buffer).await?;
    info!(accepted, rejected, "Ingest finished, flushing rollups");

    // Final flush; fall back to the retry path if it fails
    let flushed = match aggregator.stop().await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(error = %e, "Final flush failed, retrying with backoff (Ctrl-C to give up)");
            let cancel = CancellationToken::new();
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                })
            };

            let result = aggregator
                .flush_with_retry(config.flush.max_retries, config.flush.retry_delay(), &cancel)
                .await;
            watcher.abort();
            result
        }
    };

    match aggregator.export_raw().await {
        Ok(0) => {}
        Ok(count) => info!(events = count, "Exported remaining raw events"),
        Err(e) => error!(error = %e, "Raw event export failed"),
    }

    if flushed.is_err() {
        error!(
            paths = buffer.aggregation_count(),
            sources = buffer.source_aggregation_count(),
            devices = buffer.device_aggregation_count(),
            "Rollups left unwritten at exit"
        );
    }
    flushed.context("failed to write rollups before exit")?;

    info!("Shutdown complete");
    Ok(())
}

/// Read JSON-lines events from stdin until EOF or Ctrl-C
///
/// Malformed lines are logged and skipped. Returns (accepted, rejected).
async fn ingest(buffer: &RollupBuffer) -> Result<(u64, u64)> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut accepted = 0u64;
    let mut rejected = 0u64;
    let mut line_no = 0u64;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl-C, stopping ingest");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read from stdin")? else {
                    break;
                };
                line_no += 1;

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<Event>(line) {
                    Ok(event) => {
                        buffer.push(event);
                        accepted += 1;
                    }
                    Err(e) => {
                        warn!(line = line_no, error = %e, "Skipping malformed event");
                        rejected += 1;
                    }
                }
            }
        }
    }

    Ok((accepted, rejected))
}
