//! Staked node counts, overall and per chain.

use super::source::NodeRecord;
use super::{AggregationUnit, MetricKind, MetricPayload, UnitContext};
use crate::cache_set::CacheSetId;
use crate::window::Window;
use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCountRow {
    /// `None` for the total across chains.
    pub chain: Option<String>,
    pub node_count: u64,
}

/// One total row (always present) followed by one row per staked chain.
pub fn aggregate_node_count(records: &[NodeRecord]) -> Vec<NodeCountRow> {
    let mut nodes: BTreeSet<&str> = BTreeSet::new();
    let mut per_chain: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for record in records {
        nodes.insert(record.address.as_str());
        for chain in &record.chains {
            per_chain
                .entry(chain.as_str())
                .or_default()
                .insert(record.address.as_str());
        }
    }
    let mut rows = vec![NodeCountRow {
        chain: None,
        node_count: nodes.len() as u64,
    }];
    rows.extend(
        per_chain
            .into_iter()
            .filter(|(_, addresses)| !addresses.is_empty())
            .map(|(chain, addresses)| NodeCountRow {
                chain: Some(chain.to_string()),
                node_count: addresses.len() as u64,
            }),
    );
    rows
}

pub struct NodeCountUnit {
    ctx: UnitContext,
}

impl NodeCountUnit {
    pub fn new(ctx: UnitContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl AggregationUnit for NodeCountUnit {
    fn kind(&self) -> MetricKind {
        MetricKind::NodeCount
    }

    // Node snapshots are read as-is; there is no feed watermark to wait on.
    async fn compute_and_persist(&self, cache_set: CacheSetId, window: Window) -> Result<bool> {
        let started = Instant::now();
        let members = self.ctx.members(cache_set, window)?;
        let records = self.ctx.source.nodes(window, &members).await?;
        let rows = aggregate_node_count(&records);
        Ok(self
            .ctx
            .persist(cache_set, window, MetricPayload::NodeCount(rows), started)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::fixture;
    use crate::test_utils::temp_dir;

    fn node(height: u64, address: &str, chains: &[&str]) -> NodeRecord {
        NodeRecord {
            height,
            address: address.to_string(),
            chains: chains.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn counts_distinct_nodes_overall_and_per_chain() {
        let rows = aggregate_node_count(&[
            node(850, "a", &["0021", "0040"]),
            node(860, "a", &["0021"]),
            node(850, "b", &["0021"]),
            node(850, "c", &[]),
        ]);
        assert_eq!(
            rows,
            vec![
                NodeCountRow {
                    chain: None,
                    node_count: 3,
                },
                NodeCountRow {
                    chain: Some("0021".to_string()),
                    node_count: 2,
                },
                NodeCountRow {
                    chain: Some("0040".to_string()),
                    node_count: 1,
                },
            ]
        );
    }

    #[tokio::test]
    async fn counts_only_members_without_waiting_for_sync() {
        let dir = temp_dir("node-count-unit");
        let fx = fixture(&["a", "b"], &dir);
        fx.source.push_nodes([
            node(860, "a", &["0021"]),
            node(870, "b", &["0021", "0040"]),
            node(870, "outsider", &["0021"]),
            node(950, "a", &["0040"]),
        ]);
        let unit = NodeCountUnit::new(fx.ctx.clone());
        let window = Window::starting_at(850, 50);

        assert!(unit.compute_and_persist(fx.cache_set, window).await.unwrap());
        let stored = fx
            .ctx
            .results
            .get(MetricKind::NodeCount, fx.cache_set, 50, window)
            .expect("stored");
        assert_eq!(
            stored.payload,
            MetricPayload::NodeCount(vec![
                NodeCountRow {
                    chain: None,
                    node_count: 2,
                },
                NodeCountRow {
                    chain: Some("0021".to_string()),
                    node_count: 2,
                },
                NodeCountRow {
                    chain: Some("0040".to_string()),
                    node_count: 1,
                },
            ])
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_window_still_reports_zero_total() {
        assert_eq!(
            aggregate_node_count(&[]),
            vec![NodeCountRow {
                chain: None,
                node_count: 0,
            }]
        );
    }
}
