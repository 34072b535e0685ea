//! Raw event export
//!
//! The raw half of the fork: batches of drained events are handed to a
//! [`RawExporter`]. Export is best effort and never affects rollup flushing.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::analytics::models::Event;

/// Sink for drained raw events
#[async_trait]
pub trait RawExporter: Send + Sync {
    async fn export(&self, events: Vec<Event>) -> anyhow::Result<()>;
}

/// Exporter that drops every batch
#[derive(Debug, Default)]
pub struct DiscardExporter;

#[async_trait]
impl RawExporter for DiscardExporter {
    async fn export(&self, events: Vec<Event>) -> anyhow::Result<()> {
        debug!(events = events.len(), "Discarding raw events, no export directory configured");
        Ok(())
    }
}

/// Writes each batch as one JSON-lines file under a directory
///
/// Files are named `events-<unix-millis>-<seq>.jsonl` and appear atomically:
/// a batch is written to a temporary name first and renamed when complete.
pub struct JsonLinesExporter {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl JsonLinesExporter {
    /// Create the exporter, creating `dir` if it does not exist
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create raw export directory {}", dir.display()))?;

        info!("Raw events will be exported to {}", dir.display());
        Ok(Self {
            dir,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_file_name(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("events-{}-{seq:06}.jsonl", Utc::now().timestamp_millis())
    }
}

#[async_trait]
impl RawExporter for JsonLinesExporter {
    async fn export(&self, events: Vec<Event>) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut body = Vec::with_capacity(events.len() * 256);
        for event in &events {
            serde_json::to_writer(&mut body, event)
                .with_context(|| format!("failed to serialize event {}", event.id))?;
            body.push(b'\n');
        }

        let name = self.next_file_name();
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.tmp"));

        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move batch into place at {}", path.display()))?;

        debug!(events = events.len(), file = %path.display(), "Exported raw events");
        Ok(())
    }
}
