//! Rewards per chain.

use super::source::{RewardRecord, SourceFeed};
use super::{AggregationUnit, MetricKind, MetricPayload, UnitContext, TOKEN_DENOMINATION};
use crate::cache_set::CacheSetId;
use crate::window::Window;
use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardsRow {
    pub chain: String,
    pub rewards_total: f64,
    pub normalized_rewards_total: f64,
    pub relays_total: u64,
}

#[derive(Default)]
struct ChainTotals {
    rewards: u64,
    normalized: u64,
    relays: u64,
}

/// Sum rewards and relays per chain, converting to whole tokens.
pub fn aggregate_rewards(records: &[RewardRecord]) -> Vec<RewardsRow> {
    let mut chains: BTreeMap<&str, ChainTotals> = BTreeMap::new();
    for record in records {
        let totals = chains.entry(record.chain.as_str()).or_default();
        totals.rewards = totals.rewards.saturating_add(record.rewards);
        totals.normalized = totals.normalized.saturating_add(record.normalized_rewards);
        totals.relays = totals.relays.saturating_add(record.relays);
    }
    chains
        .into_iter()
        .map(|(chain, totals)| RewardsRow {
            chain: chain.to_string(),
            rewards_total: totals.rewards as f64 / TOKEN_DENOMINATION,
            normalized_rewards_total: totals.normalized as f64 / TOKEN_DENOMINATION,
            relays_total: totals.relays,
        })
        .collect()
}

pub struct RewardsUnit {
    ctx: UnitContext,
}

impl RewardsUnit {
    pub fn new(ctx: UnitContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl AggregationUnit for RewardsUnit {
    fn kind(&self) -> MetricKind {
        MetricKind::Rewards
    }

    async fn compute_and_persist(&self, cache_set: CacheSetId, window: Window) -> Result<bool> {
        let started = Instant::now();
        if !self
            .ctx
            .feed_ready(self.kind(), SourceFeed::Rewards, cache_set, window)
            .await?
        {
            return Ok(false);
        }
        let members = self.ctx.members(cache_set, window)?;
        let records = self.ctx.source.rewards(window, &members).await?;
        let rows = aggregate_rewards(&records);
        Ok(self
            .ctx
            .persist(cache_set, window, MetricPayload::Rewards(rows), started)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::fixture;
    use crate::test_utils::temp_dir;

    fn reward(height: u64, address: &str, chain: &str, rewards: u64, relays: u64) -> RewardRecord {
        RewardRecord {
            height,
            address: address.to_string(),
            chain: chain.to_string(),
            rewards,
            normalized_rewards: rewards / 2,
            relays,
        }
    }

    #[test]
    fn sums_per_chain_in_whole_tokens() {
        let rows = aggregate_rewards(&[
            reward(850, "a", "0021", 2_000_000, 10),
            reward(851, "b", "0021", 1_000_000, 5),
            reward(852, "a", "0040", 500_000, 1),
        ]);
        assert_eq!(
            rows,
            vec![
                RewardsRow {
                    chain: "0021".to_string(),
                    rewards_total: 3.0,
                    normalized_rewards_total: 1.5,
                    relays_total: 15,
                },
                RewardsRow {
                    chain: "0040".to_string(),
                    rewards_total: 0.5,
                    normalized_rewards_total: 0.25,
                    relays_total: 1,
                },
            ]
        );
    }

    #[tokio::test]
    async fn unsynced_feed_reports_failure_without_writing() {
        let dir = temp_dir("rewards-unit");
        let fx = fixture(&["a"], &dir);
        fx.source.push_rewards([reward(850, "a", "0021", 1_000_000, 1)]);
        fx.source.set_synced(SourceFeed::Rewards, 880);
        let unit = RewardsUnit::new(fx.ctx.clone());
        let window = Window::starting_at(850, 50);

        assert!(!unit.compute_and_persist(fx.cache_set, window).await.unwrap());
        assert!(fx
            .ctx
            .results
            .get(MetricKind::Rewards, fx.cache_set, 50, window)
            .is_none());

        fx.source.set_synced(SourceFeed::Rewards, 900);
        assert!(unit.compute_and_persist(fx.cache_set, window).await.unwrap());
        let stored = fx
            .ctx
            .results
            .get(MetricKind::Rewards, fx.cache_set, 50, window)
            .expect("stored result");
        assert_eq!(stored.payload.rows(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
