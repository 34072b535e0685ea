//! Merge rules shared by every repository implementation
//!
//! Counters are added. Sketches are unioned; a stored sketch that cannot be
//! read (or has a different precision) is replaced by the incoming one so a
//! bad blob never blocks counter updates.

use tracing::warn;

use crate::analytics::models::Aggregation;
use crate::analytics::sketch::CardinalitySketch;

/// Outcome of combining a stored sketch with an incoming one
#[derive(Debug, Clone, PartialEq)]
pub enum SketchMerge {
    /// Incoming sketch was empty; whatever is stored stays as is
    Unchanged,
    /// Incoming sketch was stored or unioned into the stored one
    Merged(CardinalitySketch),
    /// Stored sketch was unusable and has been replaced by the incoming one
    Replaced(CardinalitySketch),
}

/// Combine a stored serialized sketch with an incoming sketch
pub fn merge_sketch(stored: Option<&[u8]>, incoming: &CardinalitySketch, key: &str) -> SketchMerge {
    if incoming.is_empty() {
        return SketchMerge::Unchanged;
    }

    let Some(stored) = stored.filter(|bytes| !bytes.is_empty()) else {
        return SketchMerge::Merged(incoming.clone());
    };

    let merged = CardinalitySketch::from_bytes(stored).and_then(|mut sketch| {
        sketch.merge(incoming)?;
        Ok(sketch)
    });

    match merged {
        Ok(sketch) => SketchMerge::Merged(sketch),
        Err(e) => {
            warn!(key = %key, error = %e, "Stored sketch unusable, replacing with incoming sketch");
            SketchMerge::Replaced(incoming.clone())
        }
    }
}

/// Stored state of a path rollup row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathRow {
    pub pageviews: i64,
    pub visitors: i64,
    pub duration_sum_ms: i64,
    pub duration_samples: i64,
    pub sketch: Option<Vec<u8>>,
}

/// Stored state of a source or device rollup row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountRow {
    pub visitors: i64,
    pub sketch: Option<Vec<u8>>,
}

/// Apply an incoming path aggregation to the stored row (if any)
///
/// `visitors` follows the merged sketch estimate. When the stored sketch had to
/// be replaced, the stored visitor count is kept and the incoming estimate is
/// added to it.
pub fn merge_path_row(stored: Option<PathRow>, incoming: &Aggregation, key: &str) -> PathRow {
    let stored = stored.unwrap_or_default();
    let outcome = merge_sketch(stored.sketch.as_deref(), &incoming.sketch, key);

    let (visitors, sketch) = match outcome {
        SketchMerge::Unchanged => (stored.visitors, stored.sketch),
        SketchMerge::Merged(sketch) => (to_i64(sketch.estimate()), Some(sketch.to_bytes())),
        SketchMerge::Replaced(sketch) => (
            stored.visitors.saturating_add(to_i64(sketch.estimate())),
            Some(sketch.to_bytes()),
        ),
    };

    PathRow {
        pageviews: stored.pageviews.saturating_add(to_i64(incoming.pageviews)),
        visitors,
        duration_sum_ms: stored
            .duration_sum_ms
            .saturating_add(to_i64(incoming.duration_sum_ms)),
        duration_samples: stored
            .duration_samples
            .saturating_add(to_i64(incoming.duration_samples)),
        sketch,
    }
}

/// Apply an incoming source or device rollup to the stored row (if any)
///
/// `visitors` here is an event count and is always added.
pub fn merge_count_row(
    stored: Option<CountRow>,
    visitors: u64,
    sketch: &CardinalitySketch,
    key: &str,
) -> CountRow {
    let stored = stored.unwrap_or_default();
    let sketch = match merge_sketch(stored.sketch.as_deref(), sketch, key) {
        SketchMerge::Unchanged => stored.sketch,
        SketchMerge::Merged(sketch) | SketchMerge::Replaced(sketch) => Some(sketch.to_bytes()),
    };

    CountRow {
        visitors: stored.visitors.saturating_add(to_i64(visitors)),
        sketch,
    }
}

/// Convert an in-memory counter to a stored integer, saturating at `i64::MAX`
pub fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
