//! Event rollup engine
//!
//! Each ingested event is pushed into a [`RollupBuffer`], which forks it into a
//! raw append-only list and three daily rollups (path, referrer domain,
//! browser/OS). A [`RollupAggregator`] flushes the rollups to a repository on a
//! timer and exports the raw list in batches once it grows large enough.
//! Unique visitors are estimated with a [`CardinalitySketch`] per rollup.

pub mod aggregator;
pub mod buffer;
pub mod export;
pub mod models;
pub mod report;
pub mod sketch;
pub mod storage;

pub use aggregator::{backoff_delay, FlushError, RollupAggregator, MAX_RETRY_DELAY};
pub use buffer::{RollupBuffer, RollupSnapshot};
pub use export::{DiscardExporter, JsonLinesExporter, RawExporter};
pub use models::{Aggregation, DeviceAggregation, Event, SourceAggregation};
pub use report::{summarize, Summary};
pub use sketch::{CardinalitySketch, SketchError};
pub use storage::DateRange;
