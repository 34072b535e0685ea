//! In-memory rollup buffer
//!
//! Every pushed event is forked into two structures guarded by the same lock:
//! - a raw append-only list, exported in batches once it grows large enough
//! - three rollup maps (date+path, date+source, date+browser/OS) flushed to
//!   the repository on every tick
//!
//! Drains swap the current container for a fresh one, so a drained snapshot is
//! owned by the caller and never aliases live state.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

use crate::analytics::models::{
    rollup_key, Aggregation, DeviceAggregation, Event, RollupEntry, SourceAggregation,
};

/// Default raw buffer threshold (16 MiB)
pub const DEFAULT_MAX_RAW_BYTES: usize = 16 * 1024 * 1024;

/// Value used when an event carries no browser or OS
pub const UNKNOWN_DIMENSION: &str = "Unknown";

/// Source used when a referrer is present but has no host
pub const DIRECT_SOURCE: &str = "direct";

// Rough per-event overhead: timestamp, pointers, map headers.
const EVENT_OVERHEAD_BYTES: usize = 200;
const PROPS_ESTIMATE_BYTES: usize = 100;

/// Drained rollup maps, owned by whoever drained them
#[derive(Debug, Default)]
pub struct RollupSnapshot {
    pub paths: HashMap<String, Aggregation>,
    pub sources: HashMap<String, SourceAggregation>,
    pub devices: HashMap<String, DeviceAggregation>,
}

impl RollupSnapshot {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.sources.is_empty() && self.devices.is_empty()
    }

    /// Total number of entries across the three maps
    pub fn len(&self) -> usize {
        self.paths.len() + self.sources.len() + self.devices.len()
    }
}

#[derive(Default)]
struct BufferState {
    raw: Vec<Event>,
    raw_size: usize,
    paths: HashMap<String, Aggregation>,
    sources: HashMap<String, SourceAggregation>,
    devices: HashMap<String, DeviceAggregation>,
}

impl BufferState {
    fn update_path(&mut self, date: &str, event: &Event) {
        let agg = self
            .paths
            .entry(rollup_key(date, &event.path))
            .or_insert_with(|| Aggregation::new(date, &event.path));

        agg.pageviews = agg.pageviews.saturating_add(1);
        if !event.session_id.is_empty() {
            agg.sketch.add(&event.session_id);
        }
        if let Some(duration) = event.duration_ms {
            agg.duration_sum_ms = agg.duration_sum_ms.saturating_add(duration);
            agg.duration_samples = agg.duration_samples.saturating_add(1);
        }
    }

    fn update_source(&mut self, date: &str, source: &str, session_id: &str) {
        let agg = self
            .sources
            .entry(rollup_key(date, source))
            .or_insert_with(|| SourceAggregation::new(date, source));

        agg.visitors = agg.visitors.saturating_add(1);
        if !session_id.is_empty() {
            agg.sketch.add(session_id);
        }
    }

    fn update_device(&mut self, date: &str, event: &Event) {
        let browser = non_empty_or_unknown(event.browser.as_deref());
        let os = non_empty_or_unknown(event.os.as_deref());
        let agg = self
            .devices
            .entry(rollup_key(date, &format!("{browser}|{os}")))
            .or_insert_with(|| DeviceAggregation::new(date, browser, os));

        agg.visitors = agg.visitors.saturating_add(1);
        if !event.session_id.is_empty() {
            agg.sketch.add(&event.session_id);
        }
    }
}

/// Shared in-memory buffer for raw events and rollups
pub struct RollupBuffer {
    max_raw_bytes: usize,
    state: RwLock<BufferState>,
}

impl RollupBuffer {
    /// Create a buffer; a zero threshold falls back to [`DEFAULT_MAX_RAW_BYTES`]
    pub fn new(max_raw_bytes: usize) -> Self {
        let max_raw_bytes = if max_raw_bytes == 0 {
            DEFAULT_MAX_RAW_BYTES
        } else {
            max_raw_bytes
        };

        Self {
            max_raw_bytes,
            state: RwLock::new(BufferState::default()),
        }
    }

    /// Push an event into the raw list and all matching rollups
    ///
    /// This is the hot path called for every ingested event.
    pub fn push(&self, event: Event) {
        // Everything that doesn't touch shared state happens before locking.
        let date = event.date();
        let size = estimate_event_size(&event);
        let source = event
            .referrer
            .as_deref()
            .filter(|referrer| !referrer.is_empty())
            .map(source_domain);

        let mut state = self.state.write();
        state.update_path(&date, &event);
        if let Some(source) = &source {
            state.update_source(&date, source, &event.session_id);
        }
        state.update_device(&date, &event);

        state.raw_size = state.raw_size.saturating_add(size);
        state.raw.push(event);
    }

    /// Number of events in the raw list
    pub fn len(&self) -> usize {
        self.state.read().raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().raw.is_empty()
    }

    /// Estimated size of the raw list in bytes
    pub fn raw_size(&self) -> usize {
        self.state.read().raw_size
    }

    pub fn max_raw_bytes(&self) -> usize {
        self.max_raw_bytes
    }

    /// Whether the raw list has reached its export threshold
    pub fn should_flush_raw(&self) -> bool {
        self.state.read().raw_size >= self.max_raw_bytes
    }

    /// Number of live path rollups
    pub fn aggregation_count(&self) -> usize {
        self.state.read().paths.len()
    }

    pub fn source_aggregation_count(&self) -> usize {
        self.state.read().sources.len()
    }

    pub fn device_aggregation_count(&self) -> usize {
        self.state.read().devices.len()
    }

    /// Take the raw list, resetting it and its size estimate
    pub fn drain_raw(&self) -> Vec<Event> {
        let mut state = self.state.write();
        state.raw_size = 0;
        std::mem::take(&mut state.raw)
    }

    /// Take the path rollups
    pub fn drain_aggregations(&self) -> HashMap<String, Aggregation> {
        std::mem::take(&mut self.state.write().paths)
    }

    /// Take the source rollups
    pub fn drain_source_aggregations(&self) -> HashMap<String, SourceAggregation> {
        std::mem::take(&mut self.state.write().sources)
    }

    /// Take the device rollups
    pub fn drain_device_aggregations(&self) -> HashMap<String, DeviceAggregation> {
        std::mem::take(&mut self.state.write().devices)
    }

    /// Take all three rollup maps under a single lock acquisition
    pub fn drain_snapshot(&self) -> RollupSnapshot {
        let mut state = self.state.write();
        let snapshot = RollupSnapshot {
            paths: std::mem::take(&mut state.paths),
            sources: std::mem::take(&mut state.sources),
            devices: std::mem::take(&mut state.devices),
        };
        drop(state);

        if !snapshot.is_empty() {
            debug!(
                paths = snapshot.paths.len(),
                sources = snapshot.sources.len(),
                devices = snapshot.devices.len(),
                "Drained rollup snapshot"
            );
        }
        snapshot
    }

    /// Merge previously drained path rollups back into the live map
    pub fn restore_aggregations(&self, aggregations: HashMap<String, Aggregation>) {
        if aggregations.is_empty() {
            return;
        }
        restore_into(&mut self.state.write().paths, aggregations);
    }

    /// Merge previously drained source rollups back into the live map
    pub fn restore_source_aggregations(&self, aggregations: HashMap<String, SourceAggregation>) {
        if aggregations.is_empty() {
            return;
        }
        restore_into(&mut self.state.write().sources, aggregations);
    }

    /// Merge previously drained device rollups back into the live map
    pub fn restore_device_aggregations(&self, aggregations: HashMap<String, DeviceAggregation>) {
        if aggregations.is_empty() {
            return;
        }
        restore_into(&mut self.state.write().devices, aggregations);
    }

    /// Merge a whole snapshot back under a single lock acquisition
    pub fn restore_snapshot(&self, snapshot: RollupSnapshot) {
        if snapshot.is_empty() {
            return;
        }

        let restored = snapshot.len();
        let mut state = self.state.write();
        restore_into(&mut state.paths, snapshot.paths);
        restore_into(&mut state.sources, snapshot.sources);
        restore_into(&mut state.devices, snapshot.devices);
        drop(state);

        debug!(entries = restored, "Restored rollup snapshot into live buffer");
    }
}

impl Default for RollupBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RAW_BYTES)
    }
}

/// Re-insert drained entries, adding to anything accumulated since the drain.
///
/// Counters are always added. Sketches: an empty live sketch is replaced by
/// the restored one, otherwise the two are unioned; if the union is refused
/// the live sketch is kept as is.
fn restore_into<T: RollupEntry>(live: &mut HashMap<String, T>, drained: HashMap<String, T>) {
    for (key, restored) in drained {
        match live.get_mut(&key) {
            Some(current) => {
                current.add_counters(&restored);
                if current.sketch().is_empty() {
                    *current.sketch_mut() = restored.sketch().clone();
                } else if let Err(e) = current.sketch_mut().merge(restored.sketch()) {
                    warn!(key = %key, error = %e, "Keeping live sketch, restored sketch could not be merged");
                }
            }
            None => {
                live.insert(key, restored);
            }
        }
    }
}

/// Extract the host of a referrer, falling back to [`DIRECT_SOURCE`]
///
/// Referrers without a scheme (`google.com/search`, `localhost:8080/x`) are
/// read as `http` URLs. Relative paths have no host and count as direct.
pub fn source_domain(referrer: &str) -> String {
    let referrer = referrer.trim();
    let parsed = if referrer.contains("://") {
        Url::parse(referrer)
    } else if referrer.starts_with('/') {
        return DIRECT_SOURCE.to_string();
    } else {
        Url::parse(&format!("http://{referrer}"))
    };

    parsed
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| DIRECT_SOURCE.to_string())
}

fn non_empty_or_unknown(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => UNKNOWN_DIMENSION,
    }
}

/// Approximate memory footprint of an event: fixed overhead plus the byte
/// length of its variable-length fields.
fn estimate_event_size(event: &Event) -> usize {
    let optional = [
        &event.user_id,
        &event.query,
        &event.referrer,
        &event.title,
        &event.ip,
        &event.user_agent,
        &event.browser,
        &event.os,
        &event.device,
        &event.language,
    ];

    let mut size = EVENT_OVERHEAD_BYTES
        + event.id.len()
        + event.event.len()
        + event.session_id.len()
        + event.path.len();
    size += optional
        .iter()
        .map(|field| field.as_deref().map_or(0, str::len))
        .sum::<usize>();
    if !event.props.is_empty() {
        size += PROPS_ESTIMATE_BYTES;
    }
    size
}
