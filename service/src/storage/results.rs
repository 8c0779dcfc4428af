//! Window result store.
//!
//! Results are appended to a CRC-framed file and indexed by
//! `(metric, cache set, interval, start, end)`. Writing the same key again
//! replaces the indexed value, so recomputing a window is an overwrite.
//! Results written by other processes show up after [`ResultStore::refresh`].

use super::wal::SharedWal;
use crate::aggregate::{MetricKind, MetricPayload};
use crate::cache_set::CacheSetId;
use crate::window::Window;
use eyre::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub metric: MetricKind,
    pub cache_set: CacheSetId,
    pub interval: u64,
    pub window: Window,
    pub payload: MetricPayload,
}

type ResultKey = (MetricKind, CacheSetId, u64, u64, u64);

fn key_of(metric: MetricKind, cache_set: CacheSetId, interval: u64, window: Window) -> ResultKey {
    (metric, cache_set, interval, window.start, window.end)
}

type ResultIndex = BTreeMap<ResultKey, WindowResult>;

fn index_result(index: &mut ResultIndex, result: WindowResult) {
    index.insert(
        key_of(result.metric, result.cache_set, result.interval, result.window),
        result,
    );
}

#[derive(Debug)]
pub struct ResultStore {
    wal: SharedWal,
    index: RwLock<ResultIndex>,
}

impl ResultStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let store = Self {
            wal: SharedWal::open(path.clone())?,
            index: RwLock::new(BTreeMap::new()),
        };
        store.refresh()?;
        tracing::debug!(path = %path.display(), results = store.len(), "results replayed");
        Ok(store)
    }

    /// Store `result`, replacing any earlier result for the same window.
    pub fn put(&self, result: WindowResult) -> Result<()> {
        self.wal.append(result.window.end, result, |result: WindowResult| {
            index_result(&mut self.index.write(), result);
        })
    }

    /// Index results appended by other writers since the last read.
    pub fn refresh(&self) -> Result<usize> {
        self.wal.catch_up(|result: WindowResult| {
            index_result(&mut self.index.write(), result);
        })
    }

    #[cfg(test)]
    pub fn get(
        &self,
        metric: MetricKind,
        cache_set: CacheSetId,
        interval: u64,
        window: Window,
    ) -> Option<WindowResult> {
        self.index
            .read()
            .get(&key_of(metric, cache_set, interval, window))
            .cloned()
    }

    /// Results of one pipeline whose window starts in `[from, to)`, by height.
    pub fn range(
        &self,
        metric: MetricKind,
        cache_set: CacheSetId,
        interval: u64,
        from: u64,
        to: u64,
    ) -> Vec<WindowResult> {
        if from >= to {
            return Vec::new();
        }
        let lower = (metric, cache_set, interval, from, 0);
        let upper = (metric, cache_set, interval, to, 0);
        self.index
            .read()
            .range(lower..upper)
            .map(|(_, result)| result.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }
}
