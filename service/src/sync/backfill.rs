//! Historical backfill for newly created cache sets.
//!
//! Walks every window from the look-back start up to the last complete
//! window once, without stall handling. Metrics run concurrently; windows of
//! one metric run in height order.

use super::{ProgressReporter, SyncSettings};
use crate::aggregate::{AggregationUnit, MetricKind};
use crate::cache_set::CacheSetId;
use crate::ledger::{append_off_runtime, CheckpointLedger, RangeStatus, StateRangeEntry};
use crate::metrics::rate_per_sec;
use crate::window::Window;
use eyre::{eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricTally {
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub cache_set: CacheSetId,
    pub windows: Vec<Window>,
    pub metrics: BTreeMap<MetricKind, MetricTally>,
}

/// Windows a backfill at `current_height` walks.
pub fn backfill_windows(settings: &SyncSettings, current_height: u64) -> Vec<Window> {
    let from = settings.default_watermark(current_height);
    let stop = current_height.saturating_sub(settings.interval);
    let interval = usize::try_from(settings.interval).unwrap_or(usize::MAX);
    (from..stop)
        .step_by(interval)
        .map(|start| Window::starting_at(start, settings.interval))
        .collect()
}

pub async fn run_backfill(
    units: &[Arc<dyn AggregationUnit>],
    ledger: Arc<dyn CheckpointLedger>,
    settings: SyncSettings,
    cache_set: CacheSetId,
    current_height: u64,
    progress: Option<Arc<dyn ProgressReporter>>,
) -> Result<BackfillReport> {
    let started = Instant::now();
    let windows = backfill_windows(&settings, current_height);
    let units: Vec<Arc<dyn AggregationUnit>> = units
        .iter()
        .filter(|unit| unit.kind().supports_backfill())
        .cloned()
        .collect();
    if let Some(progress) = &progress {
        progress.set_length((windows.len() * units.len()) as u64);
    }
    info!(
        cache_set,
        windows = windows.len(),
        metrics = units.len(),
        current_height,
        "backfill started"
    );

    let mut tasks: JoinSet<Result<(MetricKind, MetricTally)>> = JoinSet::new();
    for unit in units {
        let ledger = Arc::clone(&ledger);
        let progress = progress.clone();
        let windows = windows.clone();
        tasks.spawn(async move {
            let metric = unit.kind();
            let mut tally = MetricTally::default();
            for window in windows {
                let succeeded = match unit.compute_and_persist(cache_set, window).await {
                    Ok(succeeded) => succeeded,
                    Err(err) => {
                        warn!(
                            cache_set,
                            metric = %metric,
                            window = %window,
                            error = %err,
                            "backfill window failed"
                        );
                        false
                    }
                };
                append_off_runtime(
                    &ledger,
                    StateRangeEntry::new(
                        metric,
                        cache_set,
                        window,
                        settings.interval,
                        RangeStatus::from_outcome(succeeded),
                    ),
                )
                .await?;
                if succeeded {
                    tally.succeeded += 1;
                } else {
                    tally.failed += 1;
                }
                if let Some(progress) = &progress {
                    progress.inc(1);
                }
            }
            Ok((metric, tally))
        });
    }

    let mut metrics = BTreeMap::new();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((metric, tally))) => {
                metrics.insert(metric, tally);
            }
            Ok(Err(err)) => {
                warn!(cache_set, error = %err, "backfill metric aborted");
                first_error.get_or_insert(err);
            }
            Err(err) => {
                warn!(cache_set, error = %err, "backfill task panicked");
                first_error.get_or_insert_with(|| eyre!("backfill task panicked: {err}"));
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let attempted: u64 = metrics
        .values()
        .map(|tally| tally.succeeded + tally.failed)
        .sum();
    info!(
        target: "perf",
        cache_set,
        attempted,
        windows_per_sec = rate_per_sec(attempted, started.elapsed()).unwrap_or_default(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "backfill finished"
    );
    Ok(BackfillReport {
        cache_set,
        windows,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::source::{RewardRecord, SourceFeed};
    use crate::aggregate::test_support::fixture;
    use crate::aggregate::{MetricPayload, RewardsUnit};
    use crate::ledger::MemoryLedger;
    use crate::sync::driver::tests::ScriptedUnit;
    use crate::test_utils::temp_dir;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn settings() -> SyncSettings {
        SyncSettings {
            interval: 50,
            look_back: 200,
            stuck_tolerance: 3,
            hard_stop_after: 20,
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        len: AtomicU64,
        done: AtomicU64,
    }

    impl ProgressReporter for CountingProgress {
        fn set_length(&self, len: u64) {
            self.len.store(len, Ordering::SeqCst);
        }

        fn inc(&self, delta: u64) {
            self.done.fetch_add(delta, Ordering::SeqCst);
        }
    }

    #[test]
    fn windows_stop_below_the_last_interval() {
        let starts: Vec<u64> = backfill_windows(&settings(), 1000)
            .iter()
            .map(|window| window.start)
            .collect();
        assert_eq!(starts, vec![800, 850, 900]);

        let starts: Vec<u64> = backfill_windows(&settings(), 1020)
            .iter()
            .map(|window| window.start)
            .collect();
        assert_eq!(starts, vec![800, 850, 900, 950]);
        assert!(backfill_windows(&settings(), 40).is_empty());
    }

    #[tokio::test]
    async fn only_backfill_capable_metrics_run() {
        let ledger = Arc::new(MemoryLedger::new());
        let rewards = Arc::new(ScriptedUnit::new(MetricKind::Rewards, u64::MAX));
        let node_count = Arc::new(ScriptedUnit::new(MetricKind::NodeCount, u64::MAX));
        let units: Vec<Arc<dyn AggregationUnit>> = vec![rewards.clone(), node_count.clone()];
        let progress = Arc::new(CountingProgress::default());

        let report = run_backfill(
            &units,
            ledger.clone(),
            settings(),
            1,
            1000,
            Some(progress.clone() as Arc<dyn ProgressReporter>),
        )
        .await
        .unwrap();

        assert_eq!(rewards.calls().len(), 3);
        assert!(node_count.calls().is_empty());
        assert_eq!(
            report.metrics.get(&MetricKind::Rewards),
            Some(&MetricTally {
                succeeded: 3,
                failed: 0,
            })
        );
        assert!(!report.metrics.contains_key(&MetricKind::NodeCount));
        assert_eq!(progress.len.load(Ordering::SeqCst), 3);
        assert_eq!(progress.done.load(Ordering::SeqCst), 3);
        assert_eq!(
            ledger
                .max_success_end_height(MetricKind::Rewards, 1, 50)
                .unwrap(),
            Some(950)
        );
    }

    #[tokio::test]
    async fn repeated_backfill_leaves_watermark_unchanged() {
        let ledger = Arc::new(MemoryLedger::new());
        let latency = Arc::new(ScriptedUnit::new(MetricKind::Latency, 900));
        let units: Vec<Arc<dyn AggregationUnit>> = vec![latency.clone()];

        let first = run_backfill(&units, ledger.clone(), settings(), 1, 1000, None)
            .await
            .unwrap();
        let second = run_backfill(&units, ledger.clone(), settings(), 1, 1000, None)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.metrics.get(&MetricKind::Latency),
            Some(&MetricTally {
                succeeded: 2,
                failed: 1,
            })
        );
        assert_eq!(
            ledger
                .max_success_end_height(MetricKind::Latency, 1, 50)
                .unwrap(),
            Some(900)
        );
        assert_eq!(ledger.entries(MetricKind::Latency, 1).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn repeated_backfill_rewrites_identical_results() {
        let dir = temp_dir("backfill-results");
        let fx = fixture(&["a"], &dir);
        fx.source.push_rewards([800u64, 850, 851, 900].map(|height| RewardRecord {
            height,
            address: "a".to_string(),
            chain: "0021".to_string(),
            rewards: 1_000_000,
            normalized_rewards: 500_000,
            relays: height,
        }));
        fx.source.set_synced(SourceFeed::Rewards, 950);
        let ledger = Arc::new(MemoryLedger::new());
        let units: Vec<Arc<dyn AggregationUnit>> = vec![Arc::new(RewardsUnit::new(fx.ctx.clone()))];

        let stored = || fx.ctx.results.range(MetricKind::Rewards, fx.cache_set, 50, 0, u64::MAX);
        run_backfill(&units, ledger.clone(), settings(), fx.cache_set, 1000, None)
            .await
            .unwrap();
        let first = stored();
        run_backfill(&units, ledger.clone(), settings(), fx.cache_set, 1000, None)
            .await
            .unwrap();
        let second = stored();

        let starts: Vec<u64> = second.iter().map(|result| result.window.start).collect();
        assert_eq!(starts, vec![800, 850, 900]);
        assert_eq!(first, second);
        let MetricPayload::Rewards(rows) = &second[1].payload else {
            panic!("unexpected payload {:?}", second[1].payload);
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].relays_total, 1701);
        assert_eq!(ledger.entries(MetricKind::Rewards, fx.cache_set).unwrap().len(), 6);
        assert_eq!(
            ledger
                .max_success_end_height(MetricKind::Rewards, fx.cache_set, 50)
                .unwrap(),
            Some(950)
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
