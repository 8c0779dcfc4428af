//! Window driver: walks one pipeline forward until it catches up or stalls out.

use super::{check_progress, resolve_watermark, ProgressState, StallVerdict, SyncSettings};
use crate::aggregate::{AggregationUnit, MetricKind};
use crate::cache_set::CacheSetId;
use crate::ledger::{append_off_runtime, CheckpointLedger, RangeStatus, StateRangeEntry};
use crate::metrics::windows_behind;
use crate::window::{align_down, Window};
use eyre::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    /// The next window would end beyond the current height.
    CaughtUp,
    HardStop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverReport {
    pub metric: MetricKind,
    pub cache_set: CacheSetId,
    pub attempts: u64,
    pub successes: u64,
    pub skipped: Vec<Window>,
    /// Height the run ended at.
    pub watermark: u64,
    pub outcome: DriverOutcome,
}

impl DriverReport {
    pub fn failures(&self) -> u64 {
        self.attempts - self.successes
    }
}

pub struct WindowDriver {
    unit: Arc<dyn AggregationUnit>,
    ledger: Arc<dyn CheckpointLedger>,
    settings: SyncSettings,
}

impl WindowDriver {
    pub fn new(
        unit: Arc<dyn AggregationUnit>,
        ledger: Arc<dyn CheckpointLedger>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            unit,
            ledger,
            settings,
        }
    }

    /// Run the pipeline of `cache_set` against a fixed `current_height`.
    ///
    /// Ledger errors abort the run; unit errors count as failed windows.
    pub async fn run(&self, cache_set: CacheSetId, current_height: u64) -> Result<DriverReport> {
        let metric = self.unit.kind();
        let interval = self.settings.interval;
        let started = Instant::now();
        let watermark = resolve_watermark(
            self.ledger.as_ref(),
            metric,
            cache_set,
            &self.settings,
            current_height,
        )?;
        debug!(
            cache_set,
            metric = %metric,
            watermark,
            current_height,
            behind = windows_behind(current_height, watermark, interval),
            "driver started"
        );

        let mut state = ProgressState::new(watermark);
        let mut report = DriverReport {
            metric,
            cache_set,
            attempts: 0,
            successes: 0,
            skipped: Vec::new(),
            watermark,
            outcome: DriverOutcome::CaughtUp,
        };

        loop {
            let start = align_down(state.last_recorded_height, interval);
            if start.saturating_add(interval) > current_height {
                break;
            }
            state.last_recorded_height = start;
            let window = Window::starting_at(start, interval);

            let succeeded = match self.unit.compute_and_persist(cache_set, window).await {
                Ok(succeeded) => succeeded,
                Err(err) => {
                    warn!(
                        cache_set,
                        metric = %metric,
                        window = %window,
                        error = %err,
                        "aggregation unit failed"
                    );
                    false
                }
            };
            append_off_runtime(
                &self.ledger,
                StateRangeEntry::new(
                    metric,
                    cache_set,
                    window,
                    interval,
                    RangeStatus::from_outcome(succeeded),
                ),
            )
            .await?;
            report.attempts += 1;
            if succeeded {
                report.successes += 1;
            }

            let (next, verdict) =
                check_progress(self.ledger.as_ref(), metric, cache_set, &self.settings, state)?;
            state = next;
            match verdict {
                StallVerdict::Progressed | StallVerdict::Stalled => {}
                StallVerdict::Skipped { gap } => report.skipped.push(gap),
                StallVerdict::HardStop => {
                    report.outcome = DriverOutcome::HardStop;
                    break;
                }
            }
        }

        report.watermark = state.last_recorded_height;
        info!(
            target: "perf",
            cache_set,
            metric = %metric,
            attempts = report.attempts,
            successes = report.successes,
            skipped = report.skipped.len(),
            watermark = report.watermark,
            outcome = ?report.outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "driver finished"
        );
        Ok(report)
    }
}
