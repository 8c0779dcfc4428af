//! CLI and config handling.

use crate::aggregate::MetricKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_INTERVAL: u64 = 4;
pub const DEFAULT_LOOK_BACK: u64 = 96;
pub const DEFAULT_STUCK_TOLERANCE: u32 = 3;
pub const DEFAULT_HARD_STOP_AFTER: u32 = 20;
pub const DEFAULT_BOUNDARY_SLACK: u64 = 3;
pub const DEFAULT_MAX_CACHE_SET_JOBS: usize = 8;
pub const DEFAULT_MAX_METRIC_DRIVERS: usize = 5;
pub const DEFAULT_ORACLE_URL: &str = "http://127.0.0.1:8081";
pub const DEFAULT_SOURCE_DIR: &str = "source";
pub const DEFAULT_LOG_OUTPUT_DIR: &str = "logs";
pub const DEFAULT_LOG_JSON_FILTER: &str = "debug";

/// Polling cadence of the service loop.
#[derive(ValueEnum, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    /// Pause 15 minutes after a cycle, poll the oracle every minute.
    Production,
    /// One second between everything; no window-boundary gate.
    Fast,
}

impl Cadence {
    /// Sleep after a completed cycle.
    pub fn cycle_pause(self) -> Duration {
        match self {
            Self::Production => Duration::from_secs(15 * 60),
            Self::Fast => Duration::from_secs(1),
        }
    }

    /// Sleep between oracle polls.
    pub fn poll_interval(self) -> Duration {
        match self {
            Self::Production => Duration::from_secs(60),
            Self::Fast => Duration::from_secs(1),
        }
    }

    /// Whether cycles only start close to a window boundary.
    pub fn gates_on_boundary(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Cache-set aggregation service configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "cacheset-sync", about = "Windowed cache-set metric aggregation")]
pub struct ServiceConfig {
    /// Base data directory for ledger, results and cache-set registry.
    #[arg(long, default_value = "data", global = true)]
    pub data_dir: PathBuf,
    /// Window size in height units.
    #[arg(long, default_value_t = DEFAULT_INTERVAL, global = true)]
    pub interval: u64,
    /// How far behind the current height a pipeline without checkpoints starts.
    #[arg(long, default_value_t = DEFAULT_LOOK_BACK, global = true)]
    pub look_back: u64,
    /// Consecutive stalls before the stuck window is skipped.
    #[arg(long, default_value_t = DEFAULT_STUCK_TOLERANCE, global = true)]
    pub stuck_tolerance: u32,
    /// Stalls after which a pipeline gives up for the current cycle.
    #[arg(long, default_value_t = DEFAULT_HARD_STOP_AFTER, global = true)]
    pub hard_stop_after: u32,
    /// Polling cadence.
    #[arg(long, value_enum, default_value_t = Cadence::Production, global = true)]
    pub cadence: Cadence,
    /// A production cycle only starts when `height % interval` is below this.
    #[arg(long, default_value_t = DEFAULT_BOUNDARY_SLACK, global = true)]
    pub boundary_slack: u64,
    /// Cache sets processed concurrently.
    #[arg(long, default_value_t = DEFAULT_MAX_CACHE_SET_JOBS, global = true)]
    pub max_cache_set_jobs: usize,
    /// Metric drivers run concurrently per cache set.
    #[arg(long, default_value_t = DEFAULT_MAX_METRIC_DRIVERS, global = true)]
    pub max_metric_drivers: usize,
    /// Base URL of the height oracle.
    #[arg(long, default_value = DEFAULT_ORACLE_URL, global = true)]
    pub oracle_url: String,
    /// Directory holding the source feeds.
    #[arg(long, default_value = DEFAULT_SOURCE_DIR, global = true)]
    pub source_dir: PathBuf,
    /// Restrict the service to these metrics (repeatable).
    #[arg(long, value_enum, global = true)]
    pub only: Vec<MetricKind>,
    /// Verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,
    /// Write JSON-lines logs to `--log-dir`.
    #[arg(long, global = true)]
    pub log_json: bool,
    /// Output directory for JSON logs.
    #[arg(long, default_value = DEFAULT_LOG_OUTPUT_DIR, global = true)]
    pub log_dir: PathBuf,
    /// Filter for the JSON log files.
    #[arg(long, default_value = DEFAULT_LOG_JSON_FILTER, global = true)]
    pub log_json_filter: String,
    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

impl ServiceConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Metrics the service drives, honoring `--only`.
    pub fn enabled_metrics(&self) -> Vec<MetricKind> {
        if self.only.is_empty() {
            MetricKind::ALL.to_vec()
        } else {
            MetricKind::ALL
                .into_iter()
                .filter(|kind| self.only.contains(kind))
                .collect()
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the polling service (default).
    Run,
    /// Create a cache set and backfill its history.
    CreateSet(CreateSetArgs),
    /// Add or remove members of a cache set from the current height on.
    UpdateSet(UpdateSetArgs),
    /// Deactivate a cache set.
    DeactivateSet(CacheSetArg),
    /// List cache sets.
    ListSets(ListSetsArgs),
    /// Backfill historical windows for an existing cache set.
    Backfill(CacheSetArg),
    /// Show checkpoint ledger state for a cache set.
    Ledger(LedgerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CreateSetArgs {
    /// Owner of the cache set.
    #[arg(long)]
    pub owner: u64,
    /// Display name, unique per owner.
    #[arg(long)]
    pub name: String,
    /// Comma-separated tracked identifiers.
    #[arg(long, value_delimiter = ',')]
    pub addresses: Vec<String>,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub public: bool,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub internal: bool,
    /// Skip the historical backfill.
    #[arg(long)]
    pub no_backfill: bool,
}

#[derive(Args, Debug, Clone)]
pub struct UpdateSetArgs {
    #[arg(long)]
    pub cache_set: u64,
    /// Identifiers joining the set.
    #[arg(long, value_delimiter = ',')]
    pub add: Vec<String>,
    /// Identifiers leaving the set.
    #[arg(long, value_delimiter = ',')]
    pub remove: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct CacheSetArg {
    #[arg(long)]
    pub cache_set: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ListSetsArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LedgerArgs {
    #[arg(long)]
    pub cache_set: u64,
    /// Metric to inspect; all metrics when omitted.
    #[arg(long, value_enum)]
    pub metric: Option<MetricKind>,
    /// Number of trailing entries to print per metric.
    #[arg(long, default_value_t = 10)]
    pub tail: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = ServiceConfig::parse_from(["cacheset-sync"]);
        assert_eq!(config.interval, DEFAULT_INTERVAL);
        assert_eq!(config.hard_stop_after, 20);
        assert_eq!(config.cadence, Cadence::Production);
        assert!(config.command.is_none());
        assert_eq!(config.enabled_metrics(), MetricKind::ALL.to_vec());
    }

    #[test]
    fn only_filter_keeps_declared_order() {
        let config = ServiceConfig::parse_from([
            "cacheset-sync",
            "--only",
            "errors",
            "--only",
            "rewards",
        ]);
        assert_eq!(
            config.enabled_metrics(),
            vec![MetricKind::Rewards, MetricKind::Errors]
        );
    }

    #[test]
    fn create_set_splits_addresses() {
        let config = ServiceConfig::parse_from([
            "cacheset-sync",
            "create-set",
            "--owner",
            "7",
            "--name",
            "fleet",
            "--addresses",
            "a1,a2,a3",
            "--public",
            "false",
        ]);
        match config.command {
            Some(Command::CreateSet(args)) => {
                assert_eq!(args.owner, 7);
                assert_eq!(args.addresses, vec!["a1", "a2", "a3"]);
                assert!(!args.public);
                assert!(args.internal);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn fast_cadence_skips_boundary_gate() {
        assert!(!Cadence::Fast.gates_on_boundary());
        assert!(Cadence::Production.gates_on_boundary());
        assert!(Cadence::Fast.cycle_pause() < Cadence::Production.cycle_pause());
    }
}
