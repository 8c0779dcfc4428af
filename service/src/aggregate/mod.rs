//! Aggregation units: one per metric kind.
//!
//! A unit computes the aggregate of one metric for one cache set over one
//! window and persists it as a [`WindowResult`]. Units report `false` when
//! their upstream feed has not reached the window end yet; the scheduler
//! records that as a failed checkpoint and retries later.

mod errors;
mod grouping;
mod latency;
mod location;
mod node_count;
mod rewards;
pub mod source;

use crate::cache_set::{CacheSetId, CacheSetRegistry};
use crate::storage::results::{ResultStore, WindowResult};
use crate::window::Window;
use async_trait::async_trait;
use clap::ValueEnum;
use eyre::Result;
use serde::{Deserialize, Serialize};
use source::{SourceData, SourceFeed};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub use errors::{ErrorsRow, ErrorsUnit};
pub use latency::{LatencyRow, LatencyUnit};
pub use location::{LocationRow, LocationUnit};
pub use node_count::{NodeCountRow, NodeCountUnit};
pub use rewards::{RewardsRow, RewardsUnit};

/// Upstream amounts are denominated in millionths of a token.
pub const TOKEN_DENOMINATION: f64 = 1_000_000.0;

#[derive(
    ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum MetricKind {
    Rewards,
    Latency,
    Errors,
    NodeCount,
    Location,
}

impl MetricKind {
    pub const ALL: [Self; 5] = [
        Self::Rewards,
        Self::Latency,
        Self::Errors,
        Self::NodeCount,
        Self::Location,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rewards => "rewards",
            Self::Latency => "latency",
            Self::Errors => "errors",
            Self::NodeCount => "node_count",
            Self::Location => "location",
        }
    }

    /// Node count and location are only computed going forward.
    pub fn supports_backfill(self) -> bool {
        matches!(self, Self::Rewards | Self::Latency | Self::Errors)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate payload of one window, shaped by metric kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum MetricPayload {
    Rewards(Vec<RewardsRow>),
    Latency(Vec<LatencyRow>),
    Errors(Vec<ErrorsRow>),
    NodeCount(Vec<NodeCountRow>),
    Location(Vec<LocationRow>),
}

impl MetricPayload {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Rewards(_) => MetricKind::Rewards,
            Self::Latency(_) => MetricKind::Latency,
            Self::Errors(_) => MetricKind::Errors,
            Self::NodeCount(_) => MetricKind::NodeCount,
            Self::Location(_) => MetricKind::Location,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Self::Rewards(rows) => rows.len(),
            Self::Latency(rows) => rows.len(),
            Self::Errors(rows) => rows.len(),
            Self::NodeCount(rows) => rows.len(),
            Self::Location(rows) => rows.len(),
        }
    }
}

/// Computes and persists one metric for one window.
#[async_trait]
pub trait AggregationUnit: Send + Sync {
    fn kind(&self) -> MetricKind;

    /// Returns `false` without side effects when source data for
    /// `window.end` is not available yet. Safe to repeat for a window.
    async fn compute_and_persist(&self, cache_set: CacheSetId, window: Window) -> Result<bool>;
}

/// Collaborators shared by all units.
#[derive(Clone)]
pub struct UnitContext {
    pub source: Arc<dyn SourceData>,
    pub registry: Arc<CacheSetRegistry>,
    pub results: Arc<ResultStore>,
    pub interval: u64,
}

impl UnitContext {
    /// Check the feed watermark, logging a skip when it lags the window.
    async fn feed_ready(
        &self,
        kind: MetricKind,
        feed: SourceFeed,
        cache_set: CacheSetId,
        window: Window,
    ) -> Result<bool> {
        let ready = self.source.is_synced(feed, window.end).await?;
        if !ready {
            tracing::info!(
                cache_set,
                metric = %kind,
                start = window.start,
                end = window.end,
                "skipping window, source not synced yet"
            );
        }
        Ok(ready)
    }

    fn members(&self, cache_set: CacheSetId, window: Window) -> Result<Vec<String>> {
        self.registry.members_for_window(cache_set, window)
    }

    /// Persist the payload; a storage failure counts as an unsuccessful window.
    async fn persist(
        &self,
        cache_set: CacheSetId,
        window: Window,
        payload: MetricPayload,
        started: Instant,
    ) -> bool {
        let kind = payload.kind();
        let rows = payload.rows();
        let result = WindowResult {
            metric: kind,
            cache_set,
            interval: self.interval,
            window,
            payload,
        };
        let results = Arc::clone(&self.results);
        let stored = tokio::task::spawn_blocking(move || results.put(result))
            .await
            .map_err(eyre::Report::from)
            .and_then(|stored| stored);
        match stored {
            Ok(()) => {
                tracing::debug!(
                    target: "perf",
                    cache_set,
                    metric = %kind,
                    start = window.start,
                    end = window.end,
                    rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "window cached"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    cache_set,
                    metric = %kind,
                    start = window.start,
                    end = window.end,
                    error = %err,
                    "failed persisting window result"
                );
                false
            }
        }
    }
}

/// Build the units for `kinds`, in the order given.
pub fn build_units(ctx: &UnitContext, kinds: &[MetricKind]) -> Vec<Arc<dyn AggregationUnit>> {
    kinds
        .iter()
        .map(|kind| -> Arc<dyn AggregationUnit> {
            match kind {
                MetricKind::Rewards => Arc::new(RewardsUnit::new(ctx.clone())),
                MetricKind::Latency => Arc::new(LatencyUnit::new(ctx.clone())),
                MetricKind::Errors => Arc::new(ErrorsUnit::new(ctx.clone())),
                MetricKind::NodeCount => Arc::new(NodeCountUnit::new(ctx.clone())),
                MetricKind::Location => Arc::new(LocationUnit::new(ctx.clone())),
            }
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_support_matches_metric() {
        let backfilled: Vec<MetricKind> = MetricKind::ALL
            .into_iter()
            .filter(|kind| kind.supports_backfill())
            .collect();
        assert_eq!(
            backfilled,
            vec![MetricKind::Rewards, MetricKind::Latency, MetricKind::Errors]
        );
    }

    #[test]
    fn metric_names_are_snake_case() {
        assert_eq!(MetricKind::NodeCount.to_string(), "node_count");
        assert_eq!(
            serde_json::to_string(&MetricKind::NodeCount).unwrap(),
            "\"node_count\""
        );
        assert_eq!(
            MetricKind::from_str("node_count", true).unwrap(),
            MetricKind::NodeCount
        );
    }

    #[test]
    fn payload_reports_its_kind() {
        let payload = MetricPayload::NodeCount(vec![NodeCountRow {
            chain: None,
            node_count: 3,
        }]);
        assert_eq!(payload.kind(), MetricKind::NodeCount);
        assert_eq!(payload.rows(), 1);
    }
}
