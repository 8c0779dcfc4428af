//! Cycle dispatcher: fans window drivers out over cache sets and metrics.

use super::driver::{DriverOutcome, DriverReport, WindowDriver};
use super::SyncSettings;
use crate::aggregate::{AggregationUnit, MetricKind};
use crate::cache_set::{CacheSetId, CacheSetRegistry};
use crate::cli::{Cadence, ServiceConfig};
use crate::ledger::CheckpointLedger;
use crate::oracle::{HeightOracle, MonotonicHeight};
use eyre::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    pub max_cache_set_jobs: usize,
    pub max_metric_drivers: usize,
}

impl DispatchLimits {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_cache_set_jobs: config.max_cache_set_jobs.max(1),
            max_metric_drivers: config.max_metric_drivers.max(1),
        }
    }
}

/// When the poll loop starts cycles and how long it sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub cycle_pause: Duration,
    pub poll_interval: Duration,
    /// Cycles only start when `height % interval` is below this.
    pub boundary_slack: Option<u64>,
}

impl PollSchedule {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let cadence: Cadence = config.cadence;
        Self {
            cycle_pause: cadence.cycle_pause(),
            poll_interval: cadence.poll_interval(),
            boundary_slack: cadence
                .gates_on_boundary()
                .then_some(config.boundary_slack),
        }
    }

    /// Whether a cycle is due at `height` given the height of the last cycle.
    pub fn cycle_due(&self, height: u64, last_cycle: Option<u64>, interval: u64) -> bool {
        let near_boundary = self
            .boundary_slack
            .map_or(true, |slack| height % interval < slack);
        let interval_elapsed =
            last_cycle.map_or(true, |last| last.saturating_add(interval) <= height);
        near_boundary && interval_elapsed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSetReport {
    pub cache_set: CacheSetId,
    pub drivers: Vec<DriverReport>,
    /// Drivers that errored or panicked, with the failure text.
    pub faults: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub height: u64,
    pub cache_sets: Vec<CacheSetReport>,
    pub job_faults: usize,
}

impl CycleReport {
    pub fn hard_stops(&self) -> usize {
        self.cache_sets
            .iter()
            .flat_map(|set| &set.drivers)
            .filter(|driver| driver.outcome == DriverOutcome::HardStop)
            .count()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<CacheSetRegistry>,
    ledger: Arc<dyn CheckpointLedger>,
    units: Vec<Arc<dyn AggregationUnit>>,
    settings: SyncSettings,
    limits: DispatchLimits,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CacheSetRegistry>,
        ledger: Arc<dyn CheckpointLedger>,
        units: Vec<Arc<dyn AggregationUnit>>,
        settings: SyncSettings,
        limits: DispatchLimits,
    ) -> Self {
        Self {
            registry,
            ledger,
            units,
            settings,
            limits,
        }
    }

    pub fn metrics(&self) -> Vec<MetricKind> {
        self.units.iter().map(|unit| unit.kind()).collect()
    }

    /// Drive every active cache set once against `current_height`.
    ///
    /// Faults are logged and reported; they never cancel other jobs.
    pub async fn run_cycle(&self, current_height: u64) -> CycleReport {
        let started = Instant::now();
        self.refresh_stores().await;
        let cache_sets = self.registry.active();
        info!(
            height = current_height,
            cache_sets = cache_sets.len(),
            metrics = self.units.len(),
            "cycle started"
        );

        let semaphore = Arc::new(Semaphore::new(self.limits.max_cache_set_jobs));
        let mut jobs: JoinSet<CacheSetReport> = JoinSet::new();
        for cache_set in cache_sets {
            let dispatcher = self.clone();
            let semaphore = Arc::clone(&semaphore);
            jobs.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                dispatcher.run_cache_set(cache_set.id, current_height).await
            });
        }

        let mut report = CycleReport {
            height: current_height,
            cache_sets: Vec::new(),
            job_faults: 0,
        };
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(set_report) => report.cache_sets.push(set_report),
                Err(err) => {
                    error!(error = %err, "cache set job panicked");
                    report.job_faults += 1;
                }
            }
        }
        report.cache_sets.sort_by_key(|set| set.cache_set);

        info!(
            target: "perf",
            height = current_height,
            cache_sets = report.cache_sets.len(),
            hard_stops = report.hard_stops(),
            job_faults = report.job_faults,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cycle finished"
        );
        report
    }

    /// Pick up cache set and ledger changes written by admin commands.
    ///
    /// A failed reload keeps the previous view for this cycle.
    async fn refresh_stores(&self) {
        let registry = Arc::clone(&self.registry);
        let ledger = Arc::clone(&self.ledger);
        let refreshed = tokio::task::spawn_blocking(move || -> Result<usize> {
            registry.refresh()?;
            ledger.refresh()
        })
        .await;
        match refreshed {
            Ok(Ok(entries)) if entries > 0 => {
                debug!(entries, "ledger entries picked up from disk");
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to reload stores; using cached state"),
            Err(err) => error!(error = %err, "store reload task panicked"),
        }
    }

    async fn run_cache_set(&self, cache_set: CacheSetId, current_height: u64) -> CacheSetReport {
        let semaphore = Arc::new(Semaphore::new(self.limits.max_metric_drivers));
        let mut drivers: JoinSet<(MetricKind, Result<DriverReport>)> = JoinSet::new();
        for unit in &self.units {
            let metric = unit.kind();
            let driver = WindowDriver::new(Arc::clone(unit), Arc::clone(&self.ledger), self.settings);
            let semaphore = Arc::clone(&semaphore);
            drivers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (metric, driver.run(cache_set, current_height).await)
            });
        }

        let mut report = CacheSetReport {
            cache_set,
            drivers: Vec::new(),
            faults: Vec::new(),
        };
        while let Some(joined) = drivers.join_next().await {
            match joined {
                Ok((_, Ok(driver_report))) => {
                    debug!(
                        cache_set,
                        metric = %driver_report.metric,
                        failures = driver_report.failures(),
                        "driver joined"
                    );
                    report.drivers.push(driver_report);
                }
                Ok((metric, Err(err))) => {
                    error!(cache_set, metric = %metric, error = %err, "driver failed");
                    report.faults.push(format!("{metric}: {err}"));
                }
                Err(err) => {
                    error!(cache_set, error = %err, "driver panicked");
                    report.faults.push(err.to_string());
                }
            }
        }
        report.drivers.sort_by_key(|driver| driver.metric);
        report
    }

    /// Poll the oracle and run cycles until `stop_rx` flips to `true`.
    ///
    /// Oracle failures are logged and retried after the poll interval.
    pub async fn poll(
        &self,
        oracle: Arc<dyn HeightOracle>,
        schedule: PollSchedule,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let observed = MonotonicHeight::default();
        let mut last_cycle: Option<u64> = None;
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let pause = match oracle.current_height().await {
                Ok(reading) => {
                    let height = observed.observe(reading);
                    if schedule.cycle_due(height, last_cycle, self.settings.interval) {
                        let report = self.run_cycle(height).await;
                        if report.job_faults > 0 {
                            warn!(height, faults = report.job_faults, "cycle had failed jobs");
                        }
                        last_cycle = Some(height);
                        schedule.cycle_pause
                    } else {
                        debug!(height, ?last_cycle, "no cycle due");
                        schedule.poll_interval
                    }
                }
                Err(err) => {
                    warn!(error = %err, "height oracle unavailable");
                    schedule.poll_interval
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("poll loop stopped");
        Ok(())
    }
}
