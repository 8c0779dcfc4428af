use crate::cli::{
    Cadence, ServiceConfig, DEFAULT_BOUNDARY_SLACK, DEFAULT_LOG_JSON_FILTER,
    DEFAULT_LOG_OUTPUT_DIR, DEFAULT_MAX_CACHE_SET_JOBS, DEFAULT_MAX_METRIC_DRIVERS,
    DEFAULT_ORACLE_URL,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "cacheset-sync-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

/// Config with a 50-height interval and a 200-height look-back.
pub fn base_config(data_dir: PathBuf) -> ServiceConfig {
    ServiceConfig {
        source_dir: data_dir.join("source"),
        data_dir,
        interval: 50,
        look_back: 200,
        stuck_tolerance: 3,
        hard_stop_after: 20,
        cadence: Cadence::Fast,
        boundary_slack: DEFAULT_BOUNDARY_SLACK,
        max_cache_set_jobs: DEFAULT_MAX_CACHE_SET_JOBS,
        max_metric_drivers: DEFAULT_MAX_METRIC_DRIVERS,
        oracle_url: DEFAULT_ORACLE_URL.to_string(),
        only: Vec::new(),
        verbosity: 0,
        log_json: false,
        log_dir: PathBuf::from(DEFAULT_LOG_OUTPUT_DIR),
        log_json_filter: DEFAULT_LOG_JSON_FILTER.to_string(),
        command: None,
    }
}
