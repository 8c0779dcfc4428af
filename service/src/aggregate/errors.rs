//! Error counts per chain and normalized message.

use super::grouping::normalize_error_message;
use super::source::{ErrorRecord, SourceFeed};
use super::{AggregationUnit, MetricKind, MetricPayload, UnitContext};
use crate::cache_set::CacheSetId;
use crate::window::Window;
use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorsRow {
    pub chain: String,
    pub msg: String,
    pub errors_count: u64,
}

pub fn aggregate_errors(records: &[ErrorRecord]) -> Vec<ErrorsRow> {
    let mut groups: BTreeMap<(String, String), u64> = BTreeMap::new();
    for record in records {
        let Some(msg) = normalize_error_message(&record.message) else {
            continue;
        };
        let count = groups.entry((record.chain.clone(), msg)).or_default();
        *count = count.saturating_add(record.count);
    }
    groups
        .into_iter()
        .map(|((chain, msg), errors_count)| ErrorsRow {
            chain,
            msg,
            errors_count,
        })
        .collect()
}

pub struct ErrorsUnit {
    ctx: UnitContext,
}

impl ErrorsUnit {
    pub fn new(ctx: UnitContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl AggregationUnit for ErrorsUnit {
    fn kind(&self) -> MetricKind {
        MetricKind::Errors
    }

    /// A synced window without errors is a successful, empty result.
    async fn compute_and_persist(&self, cache_set: CacheSetId, window: Window) -> Result<bool> {
        let started = Instant::now();
        if !self
            .ctx
            .feed_ready(self.kind(), SourceFeed::Errors, cache_set, window)
            .await?
        {
            return Ok(false);
        }
        let members = self.ctx.members(cache_set, window)?;
        let records = self.ctx.source.errors(window, &members).await?;
        let rows = aggregate_errors(&records);
        Ok(self
            .ctx
            .persist(cache_set, window, MetricPayload::Errors(rows), started)
            .await)
    }
}
