//! Data models for analytics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::analytics::sketch::CardinalitySketch;

/// A single analytics event as received from the ingestion layer
///
/// Validation, URL normalization and user-agent classification happen before
/// an event reaches the rollup buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: String,

    /// When the event happened
    pub timestamp: DateTime<Utc>,

    /// Event name (e.g. "page_view")
    pub event: String,

    /// Session identifier, used for unique-visitor estimation
    #[serde(default)]
    pub session_id: String,

    /// Normalized path
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Browser family, derived from the user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,

    /// Operating system, derived from the user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    /// Device class, derived from the user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Time spent on the page in milliseconds, when the client reported it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Free-form properties
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub props: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Create an event with only the required fields set
    pub fn new(
        id: impl Into<String>,
        event: impl Into<String>,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            event: event.into(),
            session_id: String::new(),
            path: path.into(),
            user_id: None,
            query: None,
            referrer: None,
            title: None,
            ip: None,
            user_agent: None,
            browser: None,
            os: None,
            device: None,
            language: None,
            duration_ms: None,
            props: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_client(mut self, browser: impl Into<String>, os: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self.os = Some(os.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Calendar date (UTC) used for rollup keys, formatted `YYYY-MM-DD`
    pub fn date(&self) -> String {
        self.timestamp.format(DATE_FORMAT).to_string()
    }
}

/// Date format used in rollup keys and stored rows
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Build the composite rollup key for a date and a dimension value
pub fn rollup_key(date: &str, dimension: &str) -> String {
    format!("{date}|{dimension}")
}

/// Common behaviour of the three rollup kinds, used by restore and flush
pub trait RollupEntry {
    /// Composite key, identical to the stored row id
    fn key(&self) -> String;

    /// Add the counters of `other` into `self`
    fn add_counters(&mut self, other: &Self);

    fn sketch(&self) -> &CardinalitySketch;

    fn sketch_mut(&mut self) -> &mut CardinalitySketch;
}

/// Per date+path rollup
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub date: String,
    pub path: String,
    pub pageviews: u64,
    /// Session ids seen for this path
    pub sketch: CardinalitySketch,
    pub duration_sum_ms: u64,
    /// Number of events that carried a duration
    pub duration_samples: u64,
}

impl Aggregation {
    pub fn new(date: &str, path: &str) -> Self {
        Self {
            date: date.to_string(),
            path: path.to_string(),
            pageviews: 0,
            sketch: CardinalitySketch::new(),
            duration_sum_ms: 0,
            duration_samples: 0,
        }
    }

    /// Estimated unique visitors
    pub fn visitors(&self) -> u64 {
        self.sketch.estimate()
    }
}

impl RollupEntry for Aggregation {
    fn key(&self) -> String {
        rollup_key(&self.date, &self.path)
    }

    fn add_counters(&mut self, other: &Self) {
        self.pageviews = self.pageviews.saturating_add(other.pageviews);
        self.duration_sum_ms = self.duration_sum_ms.saturating_add(other.duration_sum_ms);
        self.duration_samples = self.duration_samples.saturating_add(other.duration_samples);
    }

    fn sketch(&self) -> &CardinalitySketch {
        &self.sketch
    }

    fn sketch_mut(&mut self) -> &mut CardinalitySketch {
        &mut self.sketch
    }
}

/// Per date+referrer-domain rollup
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAggregation {
    pub date: String,
    pub source: String,
    /// Number of events attributed to this source
    pub visitors: u64,
    pub sketch: CardinalitySketch,
}

impl SourceAggregation {
    pub fn new(date: &str, source: &str) -> Self {
        Self {
            date: date.to_string(),
            source: source.to_string(),
            visitors: 0,
            sketch: CardinalitySketch::new(),
        }
    }
}

impl RollupEntry for SourceAggregation {
    fn key(&self) -> String {
        rollup_key(&self.date, &self.source)
    }

    fn add_counters(&mut self, other: &Self) {
        self.visitors = self.visitors.saturating_add(other.visitors);
    }

    fn sketch(&self) -> &CardinalitySketch {
        &self.sketch
    }

    fn sketch_mut(&mut self) -> &mut CardinalitySketch {
        &mut self.sketch
    }
}

/// Per date+browser+OS rollup
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAggregation {
    pub date: String,
    pub browser: String,
    pub os: String,
    /// Number of events from this browser/OS pair
    pub visitors: u64,
    pub sketch: CardinalitySketch,
}

impl DeviceAggregation {
    pub fn new(date: &str, browser: &str, os: &str) -> Self {
        Self {
            date: date.to_string(),
            browser: browser.to_string(),
            os: os.to_string(),
            visitors: 0,
            sketch: CardinalitySketch::new(),
        }
    }

    /// The `browser|os` dimension value
    pub fn dimension(&self) -> String {
        format!("{}|{}", self.browser, self.os)
    }
}

impl RollupEntry for DeviceAggregation {
    fn key(&self) -> String {
        rollup_key(&self.date, &self.dimension())
    }

    fn add_counters(&mut self, other: &Self) {
        self.visitors = self.visitors.saturating_add(other.visitors);
    }

    fn sketch(&self) -> &CardinalitySketch {
        &self.sketch
    }

    fn sketch_mut(&mut self) -> &mut CardinalitySketch {
        &mut self.sketch
    }
}
