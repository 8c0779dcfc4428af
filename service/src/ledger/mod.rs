//! Checkpoint ledger: append-only log of computed windows.
//!
//! Every window attempt appends one [`StateRangeEntry`]. Entries are never
//! rewritten; the effective watermark of a pipeline is the highest
//! `end_height` among its successful entries for the configured interval.

use crate::aggregate::MetricKind;
use crate::cache_set::CacheSetId;
use crate::storage::wal::SharedWal;
use crate::window::Window;
use eyre::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStatus {
    Success,
    Failed,
}

impl RangeStatus {
    pub fn from_outcome(succeeded: bool) -> Self {
        if succeeded {
            Self::Success
        } else {
            Self::Failed
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRangeEntry {
    pub metric: MetricKind,
    pub cache_set: CacheSetId,
    pub start_height: u64,
    pub end_height: u64,
    pub interval: u64,
    pub status: RangeStatus,
}

impl StateRangeEntry {
    pub fn new(
        metric: MetricKind,
        cache_set: CacheSetId,
        window: Window,
        interval: u64,
        status: RangeStatus,
    ) -> Self {
        Self {
            metric,
            cache_set,
            start_height: window.start,
            end_height: window.end,
            interval,
            status,
        }
    }

    pub fn window(&self) -> Window {
        Window {
            start: self.start_height,
            end: self.end_height,
        }
    }
}

/// Storage seam for the checkpoint ledger.
pub trait CheckpointLedger: Send + Sync {
    /// Append an entry; never rewrites earlier entries.
    fn append(&self, entry: StateRangeEntry) -> Result<()>;

    /// Highest successful `end_height` for the pipeline, if any.
    fn max_success_end_height(
        &self,
        metric: MetricKind,
        cache_set: CacheSetId,
        interval: u64,
    ) -> Result<Option<u64>>;

    /// All entries of a pipeline in insertion order.
    fn entries(&self, metric: MetricKind, cache_set: CacheSetId) -> Result<Vec<StateRangeEntry>>;

    /// Pick up entries other writers appended since the last read, returning
    /// how many were new.
    fn refresh(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Append from async code, keeping the file write off the runtime workers.
pub async fn append_off_runtime(
    ledger: &Arc<dyn CheckpointLedger>,
    entry: StateRangeEntry,
) -> Result<()> {
    let ledger = Arc::clone(ledger);
    tokio::task::spawn_blocking(move || ledger.append(entry)).await?
}

type WatermarkKey = (MetricKind, CacheSetId, u64);

#[derive(Debug, Default)]
struct LedgerIndex {
    entries: HashMap<(MetricKind, CacheSetId), Vec<StateRangeEntry>>,
    watermarks: HashMap<WatermarkKey, u64>,
}

impl LedgerIndex {
    fn insert(&mut self, entry: StateRangeEntry) {
        if entry.status == RangeStatus::Success {
            let key = (entry.metric, entry.cache_set, entry.interval);
            let watermark = self.watermarks.entry(key).or_insert(entry.end_height);
            *watermark = (*watermark).max(entry.end_height);
        }
        self.entries
            .entry((entry.metric, entry.cache_set))
            .or_default()
            .push(entry);
    }

    fn watermark(&self, key: &WatermarkKey) -> Option<u64> {
        self.watermarks.get(key).copied()
    }

    fn entries(&self, metric: MetricKind, cache_set: CacheSetId) -> Vec<StateRangeEntry> {
        self.entries
            .get(&(metric, cache_set))
            .cloned()
            .unwrap_or_default()
    }
}

/// Volatile ledger for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryLedger {
    index: RwLock<LedgerIndex>,
}

#[cfg(test)]
impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl CheckpointLedger for MemoryLedger {
    fn append(&self, entry: StateRangeEntry) -> Result<()> {
        self.index.write().insert(entry);
        Ok(())
    }

    fn max_success_end_height(
        &self,
        metric: MetricKind,
        cache_set: CacheSetId,
        interval: u64,
    ) -> Result<Option<u64>> {
        Ok(self.index.read().watermark(&(metric, cache_set, interval)))
    }

    fn entries(&self, metric: MetricKind, cache_set: CacheSetId) -> Result<Vec<StateRangeEntry>> {
        Ok(self.index.read().entries(metric, cache_set))
    }
}

/// Ledger persisted to a CRC-framed append-only file, indexed in memory.
///
/// Admin commands append to the same file from their own process; the
/// index sees those entries after [`CheckpointLedger::refresh`] or the next
/// append.
#[derive(Debug)]
pub struct FileLedger {
    wal: SharedWal,
    index: RwLock<LedgerIndex>,
}

impl FileLedger {
    /// Open the ledger file, replaying existing entries into the index.
    pub fn open(path: PathBuf) -> Result<Self> {
        let ledger = Self {
            wal: SharedWal::open(path.clone())?,
            index: RwLock::new(LedgerIndex::default()),
        };
        let replayed = ledger.refresh()?;
        tracing::debug!(path = %path.display(), entries = replayed, "ledger replayed");
        Ok(ledger)
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.values().map(Vec::len).sum()
    }
}

impl CheckpointLedger for FileLedger {
    fn append(&self, entry: StateRangeEntry) -> Result<()> {
        self.wal.append(entry.end_height, entry, |entry: StateRangeEntry| {
            self.index.write().insert(entry);
        })
    }

    fn refresh(&self) -> Result<usize> {
        self.wal.catch_up(|entry: StateRangeEntry| {
            self.index.write().insert(entry);
        })
    }

    fn max_success_end_height(
        &self,
        metric: MetricKind,
        cache_set: CacheSetId,
        interval: u64,
    ) -> Result<Option<u64>> {
        Ok(self.index.read().watermark(&(metric, cache_set, interval)))
    }

    fn entries(&self, metric: MetricKind, cache_set: CacheSetId) -> Result<Vec<StateRangeEntry>> {
        Ok(self.index.read().entries(metric, cache_set))
    }
}
