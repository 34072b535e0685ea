//! Range summaries built on top of the repository queries

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::analytics::sketch::union_serialized;
use crate::analytics::storage::DateRange;
use crate::storage::{RollupRepository, StorageResult};

/// Totals for a single day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTotal {
    pub date: String,
    pub pageviews: i64,
    pub visitors: i64,
}

/// Totals for a date range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub start: String,
    pub end: String,
    pub total_pageviews: i64,
    /// Unique visitors across the whole range (sketch union), not a sum of days
    pub total_visitors: i64,
    pub daily: Vec<DailyTotal>,
    /// Stored sketches that could not be read and were left out of the union
    pub unreadable_sketches: usize,
}

/// Summarize pageviews and unique visitors over `range`
///
/// Daily visitors are summed per path. The range-wide visitor count comes from
/// the union of every stored path sketch, so a visitor seen on several days or
/// paths counts once. If no sketch can be read the summed daily count is used.
pub async fn summarize(repo: &dyn RollupRepository, range: DateRange) -> StorageResult<Summary> {
    let rows = repo.query_path_rollups(range).await?;

    let mut days: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for row in &rows {
        let day = days.entry(row.date.clone()).or_default();
        day.0 = day.0.saturating_add(row.pageviews);
        day.1 = day.1.saturating_add(row.visitors);
    }

    let daily: Vec<DailyTotal> = days
        .into_iter()
        .map(|(date, (pageviews, visitors))| DailyTotal {
            date,
            pageviews,
            visitors,
        })
        .collect();
    let total_pageviews = daily.iter().map(|d| d.pageviews).sum();
    let summed_visitors: i64 = daily.iter().map(|d| d.visitors).sum();

    let sketches = repo.query_cardinality_sketches(range).await?;
    let (union, unreadable) = union_serialized(sketches.iter().map(Vec::as_slice));
    if unreadable > 0 {
        warn!(
            unreadable,
            total = sketches.len(),
            "Skipped unreadable sketches while summarizing"
        );
    }

    let total_visitors = if sketches.len() > unreadable {
        i64::try_from(union.estimate()).unwrap_or(i64::MAX)
    } else {
        summed_visitors
    };

    Ok(Summary {
        start: range.start_key(),
        end: range.end_key(),
        total_pageviews,
        total_visitors,
        daily,
        unreadable_sketches: unreadable,
    })
}
