//! Relay-weighted latency per region and chain.

use super::source::{LatencyRecord, SourceFeed};
use super::{AggregationUnit, MetricKind, MetricPayload, UnitContext};
use crate::cache_set::CacheSetId;
use crate::window::Window;
use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRow {
    pub region: String,
    pub chain: String,
    pub total_relays: u64,
    pub avg_latency: f64,
    pub avg_p90_latency: f64,
    pub avg_weighted_latency: f64,
}

#[derive(Default)]
struct WeightedSums {
    relays: u64,
    latency: f64,
    p90: f64,
    weighted: f64,
}

/// Average each latency figure weighted by relay count. Groups without
/// relays carry no signal and are left out.
pub fn aggregate_latency(records: &[LatencyRecord]) -> Vec<LatencyRow> {
    let mut groups: BTreeMap<(&str, &str), WeightedSums> = BTreeMap::new();
    for record in records {
        let sums = groups
            .entry((record.region.as_str(), record.chain.as_str()))
            .or_default();
        let weight = record.total_relays as f64;
        sums.relays = sums.relays.saturating_add(record.total_relays);
        sums.latency += record.avg_latency * weight;
        sums.p90 += record.avg_p90_latency * weight;
        sums.weighted += record.avg_weighted_latency * weight;
    }
    groups
        .into_iter()
        .filter(|(_, sums)| sums.relays > 0)
        .map(|((region, chain), sums)| {
            let relays = sums.relays as f64;
            LatencyRow {
                region: region.to_string(),
                chain: chain.to_string(),
                total_relays: sums.relays,
                avg_latency: sums.latency / relays,
                avg_p90_latency: sums.p90 / relays,
                avg_weighted_latency: sums.weighted / relays,
            }
        })
        .collect()
}

pub struct LatencyUnit {
    ctx: UnitContext,
}

impl LatencyUnit {
    pub fn new(ctx: UnitContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl AggregationUnit for LatencyUnit {
    fn kind(&self) -> MetricKind {
        MetricKind::Latency
    }

    async fn compute_and_persist(&self, cache_set: CacheSetId, window: Window) -> Result<bool> {
        let started = Instant::now();
        if !self
            .ctx
            .feed_ready(self.kind(), SourceFeed::Latency, cache_set, window)
            .await?
        {
            return Ok(false);
        }
        let members = self.ctx.members(cache_set, window)?;
        let records = self.ctx.source.latency(window, &members).await?;
        let rows = aggregate_latency(&records);
        Ok(self
            .ctx
            .persist(cache_set, window, MetricPayload::Latency(rows), started)
            .await)
    }
}
