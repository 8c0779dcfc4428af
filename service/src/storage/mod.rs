//! Data directory bootstrap and the stores living in it.

pub mod lock;
pub mod results;
pub mod wal;

use crate::cache_set::CacheSetRegistry;
use crate::cli::ServiceConfig;
use crate::ledger::FileLedger;
use eyre::{eyre, Result, WrapErr};
use results::ResultStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SCHEMA_VERSION: u64 = 1;
const META_FILE: &str = "meta.json";
const LEDGER_FILE: &str = "ledger.wal";
const RESULTS_FILE: &str = "results.wal";
const CACHE_SETS_FILE: &str = "cache_sets.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct StoredMeta {
    schema_version: u64,
    /// Watermarks are keyed by interval, so a changed interval starts fresh
    /// pipelines; it is recorded for operators, not enforced.
    interval: u64,
}

/// Durable state shared by drivers and admin commands.
#[derive(Debug, Clone)]
pub struct Storage {
    pub ledger: Arc<FileLedger>,
    pub results: Arc<ResultStore>,
    pub registry: Arc<CacheSetRegistry>,
}

impl Storage {
    /// Open the data directory, bootstrapping metadata if needed.
    pub fn open(config: &ServiceConfig) -> Result<Self> {
        let dir = &config.data_dir;
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create data dir {}", dir.display()))?;
        bootstrap(dir, config)?;
        Ok(Self {
            ledger: Arc::new(FileLedger::open(dir.join(LEDGER_FILE))?),
            results: Arc::new(ResultStore::open(dir.join(RESULTS_FILE))?),
            registry: Arc::new(CacheSetRegistry::open(dir.join(CACHE_SETS_FILE))?),
        })
    }
}

fn bootstrap(dir: &Path, config: &ServiceConfig) -> Result<()> {
    let meta_path = dir.join(META_FILE);
    if !meta_path.exists() {
        let meta = StoredMeta {
            schema_version: SCHEMA_VERSION,
            interval: config.interval,
        };
        let bytes = serde_json::to_vec_pretty(&meta).wrap_err("failed to serialize metadata")?;
        fs::write(&meta_path, bytes)
            .wrap_err_with(|| format!("failed to write {}", meta_path.display()))?;
        info!(data_dir = %dir.display(), "initialized storage metadata");
        return Ok(());
    }

    let bytes =
        fs::read(&meta_path).wrap_err_with(|| format!("failed to read {}", meta_path.display()))?;
    let meta: StoredMeta =
        serde_json::from_slice(&bytes).wrap_err("failed to deserialize metadata")?;
    if meta.schema_version != SCHEMA_VERSION {
        return Err(eyre!(
            "unsupported schema version {} (expected {SCHEMA_VERSION})",
            meta.schema_version
        ));
    }
    if meta.interval != config.interval {
        tracing::warn!(
            stored = meta.interval,
            configured = config.interval,
            "interval changed since the data dir was created; watermarks restart for the new interval"
        );
    }
    Ok(())
}
