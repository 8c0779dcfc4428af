//! Checkpoint-driven window scheduling.
//!
//! Each (metric, cache set) pair is a pipeline whose watermark lives in the
//! checkpoint ledger. A driver run resolves the watermark, computes the next
//! window, records the attempt, and checks whether the ledger moved. Runs that
//! stop making progress are pushed forward by the stall policy and eventually
//! abandoned for the current cycle.

pub mod backfill;
pub mod dispatcher;
pub mod driver;

use crate::aggregate::MetricKind;
use crate::cache_set::CacheSetId;
use crate::cli::ServiceConfig;
use crate::ledger::CheckpointLedger;
use crate::window::{align_down, Window};
use eyre::{eyre, Result};
use tracing::{error, info, warn};

/// Progress reporting hook for long walks.
pub trait ProgressReporter: Send + Sync {
    fn set_length(&self, len: u64);
    fn inc(&self, delta: u64);
}

/// Window and stall policy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub interval: u64,
    pub look_back: u64,
    pub stuck_tolerance: u32,
    pub hard_stop_after: u32,
}

impl SyncSettings {
    /// Validate the scheduling parameters of `config`.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        if config.interval == 0 {
            return Err(eyre!("interval must be greater than zero"));
        }
        if config.stuck_tolerance == 0 {
            return Err(eyre!("stuck tolerance must be greater than zero"));
        }
        if config.hard_stop_after == 0 {
            return Err(eyre!("hard stop limit must be greater than zero"));
        }
        if config.look_back % config.interval != 0 {
            warn!(
                look_back = config.look_back,
                interval = config.interval,
                "look-back is not a multiple of the interval; first windows are aligned down"
            );
        }
        Ok(Self {
            interval: config.interval,
            look_back: config.look_back,
            stuck_tolerance: config.stuck_tolerance,
            hard_stop_after: config.hard_stop_after,
        })
    }

    /// Start of the first window of a pipeline without checkpoints.
    pub fn default_watermark(&self, current_height: u64) -> u64 {
        align_down(current_height.saturating_sub(self.look_back), self.interval)
    }
}

/// Next window start for a pipeline: its highest successful checkpoint, or
/// the look-back default when it has none.
pub fn resolve_watermark(
    ledger: &dyn CheckpointLedger,
    metric: MetricKind,
    cache_set: CacheSetId,
    settings: &SyncSettings,
    current_height: u64,
) -> Result<u64> {
    Ok(ledger
        .max_success_end_height(metric, cache_set, settings.interval)?
        .unwrap_or_else(|| settings.default_watermark(current_height)))
}

/// Per-run progress of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    pub last_recorded_height: u64,
    /// Start of the most recently skipped window.
    pub problematic_height: Option<u64>,
    pub stall_count: u32,
}

impl ProgressState {
    pub fn new(watermark: u64) -> Self {
        Self {
            last_recorded_height: watermark,
            problematic_height: None,
            stall_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    /// The ledger moved past the attempted window.
    Progressed,
    /// No progress; retry the same window.
    Stalled,
    /// No progress for too long; `gap` is left behind and the run moves on.
    Skipped { gap: Window },
    /// The run gives up for this cycle.
    HardStop,
}

/// Apply the stall policy given the ledger's transition height after an
/// attempt.
pub fn apply_transition(
    state: ProgressState,
    transition: u64,
    settings: &SyncSettings,
) -> (ProgressState, StallVerdict) {
    let candidate = state.last_recorded_height;
    let stuck = transition == candidate
        || state
            .problematic_height
            .is_some_and(|problematic| transition <= problematic);
    if !stuck {
        let next = ProgressState {
            last_recorded_height: transition,
            ..state
        };
        return (next, StallVerdict::Progressed);
    }

    let mut next = state;
    next.stall_count = state.stall_count.saturating_add(1);
    let mut verdict = StallVerdict::Stalled;
    if next.stall_count % settings.stuck_tolerance == 0 {
        next.problematic_height = Some(candidate);
        next.last_recorded_height = candidate.saturating_add(settings.interval);
        verdict = StallVerdict::Skipped {
            gap: Window::starting_at(candidate, settings.interval),
        };
    }
    if next.stall_count >= settings.hard_stop_after {
        verdict = StallVerdict::HardStop;
    }
    (next, verdict)
}

/// Re-read the ledger after an attempt and apply the stall policy.
pub fn check_progress(
    ledger: &dyn CheckpointLedger,
    metric: MetricKind,
    cache_set: CacheSetId,
    settings: &SyncSettings,
    state: ProgressState,
) -> Result<(ProgressState, StallVerdict)> {
    let transition = ledger
        .max_success_end_height(metric, cache_set, settings.interval)?
        .unwrap_or(state.last_recorded_height);
    let (next, verdict) = apply_transition(state, transition, settings);
    match verdict {
        StallVerdict::Progressed => {}
        StallVerdict::Stalled => info!(
            target: "stall",
            cache_set,
            metric = %metric,
            height = state.last_recorded_height,
            stall_count = next.stall_count,
            "no progress"
        ),
        StallVerdict::Skipped { gap } => warn!(
            target: "stall",
            cache_set,
            metric = %metric,
            gap = %gap,
            stall_count = next.stall_count,
            "skipping stuck window"
        ),
        StallVerdict::HardStop => error!(
            target: "stall",
            cache_set,
            metric = %metric,
            height = next.last_recorded_height,
            stall_count = next.stall_count,
            "stall limit reached, stopping pipeline for this cycle"
        ),
    }
    Ok((next, verdict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, RangeStatus, StateRangeEntry};
    use crate::test_utils::{base_config, temp_dir};

    fn settings() -> SyncSettings {
        SyncSettings {
            interval: 50,
            look_back: 200,
            stuck_tolerance: 3,
            hard_stop_after: 20,
        }
    }

    fn record(ledger: &MemoryLedger, start: u64, status: RangeStatus) {
        ledger
            .append(StateRangeEntry::new(
                MetricKind::Rewards,
                1,
                Window::starting_at(start, 50),
                50,
                status,
            ))
            .expect("append");
    }

    #[test]
    fn empty_ledger_resolves_to_aligned_look_back() {
        let ledger = MemoryLedger::new();
        let height = resolve_watermark(&ledger, MetricKind::Rewards, 1, &settings(), 1000).unwrap();
        assert_eq!(height, 800);
        let height = resolve_watermark(&ledger, MetricKind::Rewards, 1, &settings(), 1030).unwrap();
        assert_eq!(height, 800);
        let height = resolve_watermark(&ledger, MetricKind::Rewards, 1, &settings(), 120).unwrap();
        assert_eq!(height, 0);
    }

    #[test]
    fn ledger_watermark_wins_over_look_back() {
        let ledger = MemoryLedger::new();
        record(&ledger, 800, RangeStatus::Success);
        record(&ledger, 850, RangeStatus::Failed);
        let height = resolve_watermark(&ledger, MetricKind::Rewards, 1, &settings(), 5000).unwrap();
        assert_eq!(height, 850);
        let other = resolve_watermark(&ledger, MetricKind::Latency, 1, &settings(), 1000).unwrap();
        assert_eq!(other, 800);
    }

    #[test]
    fn progress_adopts_transition_and_keeps_counters() {
        let state = ProgressState {
            last_recorded_height: 850,
            problematic_height: Some(700),
            stall_count: 2,
        };
        let (next, verdict) = apply_transition(state, 900, &settings());
        assert_eq!(verdict, StallVerdict::Progressed);
        assert_eq!(
            next,
            ProgressState {
                last_recorded_height: 900,
                problematic_height: Some(700),
                stall_count: 2,
            }
        );
    }

    #[test]
    fn three_stalls_skip_one_window() {
        let ledger = MemoryLedger::new();
        record(&ledger, 800, RangeStatus::Success);
        let mut state = ProgressState::new(850);
        let mut verdicts = Vec::new();
        for _ in 0..3 {
            record(&ledger, 850, RangeStatus::Failed);
            let (next, verdict) =
                check_progress(&ledger, MetricKind::Rewards, 1, &settings(), state).unwrap();
            state = next;
            verdicts.push(verdict);
        }
        assert_eq!(
            verdicts,
            vec![
                StallVerdict::Stalled,
                StallVerdict::Stalled,
                StallVerdict::Skipped {
                    gap: Window::starting_at(850, 50),
                },
            ]
        );
        assert_eq!(state.problematic_height, Some(850));
        assert_eq!(state.last_recorded_height, 900);
        assert_eq!(state.stall_count, 3);
    }

    #[test]
    fn transition_at_or_below_skipped_window_is_a_stall() {
        let state = ProgressState {
            last_recorded_height: 900,
            problematic_height: Some(850),
            stall_count: 3,
        };
        let (next, verdict) = apply_transition(state, 850, &settings());
        assert_eq!(verdict, StallVerdict::Stalled);
        assert_eq!(next.last_recorded_height, 900);
        assert_eq!(next.stall_count, 4);
    }

    #[test]
    fn twentieth_stall_stops_the_run() {
        let mut state = ProgressState::new(850);
        for call in 1..=20u32 {
            let transition = state.last_recorded_height;
            let (next, verdict) = apply_transition(state, transition, &settings());
            state = next;
            if call < 20 {
                assert_ne!(verdict, StallVerdict::HardStop, "stopped early at {call}");
            } else {
                assert_eq!(verdict, StallVerdict::HardStop);
            }
        }
        // Skips on stalls 3, 6, ..., 18.
        assert_eq!(state.last_recorded_height, 850 + 6 * 50);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let dir = temp_dir("settings");
        let mut config = base_config(dir);
        assert_eq!(SyncSettings::from_config(&config).unwrap(), settings());

        config.interval = 0;
        assert!(SyncSettings::from_config(&config).is_err());
        config.interval = 50;
        config.stuck_tolerance = 0;
        assert!(SyncSettings::from_config(&config).is_err());
        config.stuck_tolerance = 3;
        config.hard_stop_after = 0;
        assert!(SyncSettings::from_config(&config).is_err());
        config.hard_stop_after = 20;
        config.look_back = 210;
        assert!(SyncSettings::from_config(&config).is_ok());
    }
}
