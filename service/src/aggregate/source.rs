//! Raw source feeds the aggregation units read from.

use crate::window::Window;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Upstream feeds with their own sync watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFeed {
    Rewards,
    Latency,
    Errors,
    Nodes,
    Locations,
}

impl SourceFeed {
    fn file_name(self) -> &'static str {
        match self {
            Self::Rewards => "rewards.jsonl",
            Self::Latency => "latency.jsonl",
            Self::Errors => "errors.jsonl",
            Self::Nodes => "nodes.jsonl",
            Self::Locations => "locations.jsonl",
        }
    }
}

/// Reward claimed by one node at one height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub height: u64,
    pub address: String,
    pub chain: String,
    pub rewards: u64,
    /// Rewards normalized to the reference stake size.
    pub normalized_rewards: u64,
    pub relays: u64,
}

/// Latency sample covering `[start_height, end_height)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub address: String,
    pub chain: String,
    pub region: String,
    pub start_height: u64,
    pub end_height: u64,
    pub total_relays: u64,
    pub avg_latency: f64,
    pub avg_p90_latency: f64,
    pub avg_weighted_latency: f64,
}

/// Count of one raw error message for a node at one height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub height: u64,
    pub address: String,
    pub chain: String,
    pub message: String,
    pub count: u64,
}

/// Staking snapshot of one node at one height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub height: u64,
    pub address: String,
    pub chains: Vec<String>,
}

/// Geo lookup of a node, `ran_from` naming the vantage point it ran from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub address: String,
    pub ip: String,
    pub continent: String,
    pub country: String,
    pub city: String,
    pub isp: String,
    pub lat: String,
    pub lon: String,
    pub ran_from: String,
}

/// Read access to the raw feeds.
#[async_trait]
pub trait SourceData: Send + Sync {
    /// True when `feed` has data up to `end_height`.
    async fn is_synced(&self, feed: SourceFeed, end_height: u64) -> Result<bool>;

    async fn rewards(&self, window: Window, addresses: &[String]) -> Result<Vec<RewardRecord>>;

    async fn latency(&self, window: Window, addresses: &[String]) -> Result<Vec<LatencyRecord>>;

    async fn errors(&self, window: Window, addresses: &[String]) -> Result<Vec<ErrorRecord>>;

    async fn nodes(&self, window: Window, addresses: &[String]) -> Result<Vec<NodeRecord>>;

    /// Latest known locations; not windowed.
    async fn locations(&self, addresses: &[String]) -> Result<Vec<LocationRecord>>;
}

fn address_set(addresses: &[String]) -> HashSet<&str> {
    addresses.iter().map(String::as_str).collect()
}

fn select_rewards(records: &[RewardRecord], window: Window, addresses: &[String]) -> Vec<RewardRecord> {
    let members = address_set(addresses);
    records
        .iter()
        .filter(|r| window.contains(r.height) && members.contains(r.address.as_str()))
        .cloned()
        .collect()
}

fn select_latency(
    records: &[LatencyRecord],
    window: Window,
    addresses: &[String],
) -> Vec<LatencyRecord> {
    let members = address_set(addresses);
    records
        .iter()
        .filter(|r| window.covers(r.start_height, r.end_height))
        .filter(|r| members.contains(r.address.as_str()))
        .cloned()
        .collect()
}

fn select_errors(records: &[ErrorRecord], window: Window, addresses: &[String]) -> Vec<ErrorRecord> {
    let members = address_set(addresses);
    records
        .iter()
        .filter(|r| window.contains(r.height) && members.contains(r.address.as_str()))
        .cloned()
        .collect()
}

fn select_nodes(records: &[NodeRecord], window: Window, addresses: &[String]) -> Vec<NodeRecord> {
    let members = address_set(addresses);
    records
        .iter()
        .filter(|r| window.contains(r.height) && members.contains(r.address.as_str()))
        .cloned()
        .collect()
}

fn select_locations(records: &[LocationRecord], addresses: &[String]) -> Vec<LocationRecord> {
    let members = address_set(addresses);
    records
        .iter()
        .filter(|r| members.contains(r.address.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
#[derive(Debug, Default)]
struct FeedRecords {
    rewards: Vec<RewardRecord>,
    latency: Vec<LatencyRecord>,
    errors: Vec<ErrorRecord>,
    nodes: Vec<NodeRecord>,
    locations: Vec<LocationRecord>,
}

/// In-memory source fed directly by tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySource {
    records: RwLock<FeedRecords>,
    synced: RwLock<HashMap<SourceFeed, u64>>,
}

#[cfg(test)]
impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_synced(&self, feed: SourceFeed, height: u64) {
        self.synced.write().insert(feed, height);
    }

    pub fn push_rewards(&self, records: impl IntoIterator<Item = RewardRecord>) {
        self.records.write().rewards.extend(records);
    }

    pub fn push_latency(&self, records: impl IntoIterator<Item = LatencyRecord>) {
        self.records.write().latency.extend(records);
    }

    pub fn push_errors(&self, records: impl IntoIterator<Item = ErrorRecord>) {
        self.records.write().errors.extend(records);
    }

    pub fn push_nodes(&self, records: impl IntoIterator<Item = NodeRecord>) {
        self.records.write().nodes.extend(records);
    }

    pub fn push_locations(&self, records: impl IntoIterator<Item = LocationRecord>) {
        self.records.write().locations.extend(records);
    }
}

#[cfg(test)]
#[async_trait]
impl SourceData for MemorySource {
    async fn is_synced(&self, feed: SourceFeed, end_height: u64) -> Result<bool> {
        Ok(self
            .synced
            .read()
            .get(&feed)
            .is_some_and(|synced| *synced >= end_height))
    }

    async fn rewards(&self, window: Window, addresses: &[String]) -> Result<Vec<RewardRecord>> {
        Ok(select_rewards(&self.records.read().rewards, window, addresses))
    }

    async fn latency(&self, window: Window, addresses: &[String]) -> Result<Vec<LatencyRecord>> {
        Ok(select_latency(&self.records.read().latency, window, addresses))
    }

    async fn errors(&self, window: Window, addresses: &[String]) -> Result<Vec<ErrorRecord>> {
        Ok(select_errors(&self.records.read().errors, window, addresses))
    }

    async fn nodes(&self, window: Window, addresses: &[String]) -> Result<Vec<NodeRecord>> {
        Ok(select_nodes(&self.records.read().nodes, window, addresses))
    }

    async fn locations(&self, addresses: &[String]) -> Result<Vec<LocationRecord>> {
        Ok(select_locations(&self.records.read().locations, addresses))
    }
}

/// Size and modification time of a feed file when it was parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Self {
                len: meta.len(),
                modified: meta.modified().ok(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).wrap_err_with(|| format!("failed to stat {}", path.display())),
        }
    }
}

type ParsedFeed = (FileStamp, Arc<dyn Any + Send + Sync>);

/// Source reading `<dir>/<feed>.jsonl` files, with per-feed sync heights in
/// `<dir>/synced.json` (`{"rewards": 1200, ...}`).
///
/// Parsed feeds are kept until the file's size or mtime changes, so upstream
/// writers can append between cycles. File access runs on blocking threads.
#[derive(Clone)]
pub struct JsonlSource {
    dir: PathBuf,
    parsed: Arc<RwLock<HashMap<SourceFeed, ParsedFeed>>>,
}

impl fmt::Debug for JsonlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlSource")
            .field("dir", &self.dir)
            .field("parsed_feeds", &self.parsed.read().len())
            .finish()
    }
}

impl JsonlSource {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            parsed: Arc::default(),
        }
    }

    async fn feed<T>(&self, feed: SourceFeed) -> Result<Arc<Vec<T>>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.load_feed(feed)).await?
    }

    fn load_feed<T>(&self, feed: SourceFeed) -> Result<Arc<Vec<T>>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let path = self.dir.join(feed.file_name());
        let Some(stamp) = FileStamp::of(&path)? else {
            return Ok(Arc::new(Vec::new()));
        };
        if let Some((parsed_at, records)) = self.parsed.read().get(&feed) {
            if *parsed_at == stamp {
                if let Ok(records) = Arc::clone(records).downcast::<Vec<T>>() {
                    return Ok(records);
                }
            }
        }

        let records = Arc::new(parse_jsonl::<T>(&path)?);
        tracing::debug!(feed = feed.file_name(), records = records.len(), "feed parsed");
        let erased: Arc<dyn Any + Send + Sync> = records.clone();
        self.parsed.write().insert(feed, (stamp, erased));
        Ok(records)
    }

    async fn synced_heights(&self) -> Result<HashMap<SourceFeed, u64>> {
        let path = self.dir.join("synced.json");
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(HashMap::new());
            }
            let bytes =
                fs::read(&path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
            serde_json::from_slice(&bytes).wrap_err("failed to deserialize synced heights")
        })
        .await?
    }
}

fn parse_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .wrap_err_with(|| format!("malformed record at {}:{}", path.display(), line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl SourceData for JsonlSource {
    async fn is_synced(&self, feed: SourceFeed, end_height: u64) -> Result<bool> {
        Ok(self
            .synced_heights()
            .await?
            .get(&feed)
            .is_some_and(|synced| *synced >= end_height))
    }

    async fn rewards(&self, window: Window, addresses: &[String]) -> Result<Vec<RewardRecord>> {
        let records = self.feed::<RewardRecord>(SourceFeed::Rewards).await?;
        Ok(select_rewards(&records, window, addresses))
    }

    async fn latency(&self, window: Window, addresses: &[String]) -> Result<Vec<LatencyRecord>> {
        let records = self.feed::<LatencyRecord>(SourceFeed::Latency).await?;
        Ok(select_latency(&records, window, addresses))
    }

    async fn errors(&self, window: Window, addresses: &[String]) -> Result<Vec<ErrorRecord>> {
        let records = self.feed::<ErrorRecord>(SourceFeed::Errors).await?;
        Ok(select_errors(&records, window, addresses))
    }

    async fn nodes(&self, window: Window, addresses: &[String]) -> Result<Vec<NodeRecord>> {
        let records = self.feed::<NodeRecord>(SourceFeed::Nodes).await?;
        Ok(select_nodes(&records, window, addresses))
    }

    async fn locations(&self, addresses: &[String]) -> Result<Vec<LocationRecord>> {
        let records = self.feed::<LocationRecord>(SourceFeed::Locations).await?;
        Ok(select_locations(&records, addresses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;
    use std::io::Write;

    fn reward(height: u64, address: &str) -> RewardRecord {
        RewardRecord {
            height,
            address: address.to_string(),
            chain: "0021".to_string(),
            rewards: 10,
            normalized_rewards: 5,
            relays: 1,
        }
    }

    #[tokio::test]
    async fn memory_source_filters_by_window_and_members() {
        let source = MemorySource::new();
        source.push_rewards([
            reward(849, "a"),
            reward(850, "a"),
            reward(899, "b"),
            reward(900, "a"),
            reward(860, "z"),
        ]);
        let members = vec!["a".to_string(), "b".to_string()];
        let heights: Vec<u64> = source
            .rewards(Window::starting_at(850, 50), &members)
            .await
            .unwrap()
            .iter()
            .map(|r| r.height)
            .collect();
        assert_eq!(heights, vec![850, 899]);
    }

    #[tokio::test]
    async fn synced_height_gates_window_end() {
        let source = MemorySource::new();
        assert!(!source.is_synced(SourceFeed::Latency, 900).await.unwrap());
        source.set_synced(SourceFeed::Latency, 899);
        assert!(!source.is_synced(SourceFeed::Latency, 900).await.unwrap());
        source.set_synced(SourceFeed::Latency, 900);
        assert!(source.is_synced(SourceFeed::Latency, 900).await.unwrap());
        assert!(!source.is_synced(SourceFeed::Rewards, 900).await.unwrap());
    }

    #[tokio::test]
    async fn jsonl_source_reads_feeds_and_sync_heights() {
        let dir = temp_dir("jsonl-source");
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = File::create(dir.join("rewards.jsonl")).unwrap();
        for record in [reward(850, "a"), reward(950, "a")] {
            writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
        }
        writeln!(file).unwrap();
        std::fs::write(dir.join("synced.json"), br#"{"rewards": 900}"#).unwrap();

        let source = JsonlSource::new(dir.clone());
        let members = vec!["a".to_string()];
        let records = source
            .rewards(Window::starting_at(850, 50), &members)
            .await
            .unwrap();
        assert_eq!(records, vec![reward(850, "a")]);
        assert!(source.is_synced(SourceFeed::Rewards, 900).await.unwrap());
        assert!(!source.is_synced(SourceFeed::Errors, 900).await.unwrap());
        assert!(source
            .latency(Window::starting_at(850, 50), &members)
            .await
            .unwrap()
            .is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn jsonl_source_reparses_only_changed_feeds() {
        let dir = temp_dir("jsonl-source-cache");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rewards.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&reward(850, "a")).unwrap()).unwrap();

        let source = JsonlSource::new(dir.clone());
        let first = source.feed::<RewardRecord>(SourceFeed::Rewards).await.unwrap();
        let again = source.feed::<RewardRecord>(SourceFeed::Rewards).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        writeln!(file, "{}", serde_json::to_string(&reward(860, "a")).unwrap()).unwrap();
        drop(file);
        let members = vec!["a".to_string()];
        let heights: Vec<u64> = source
            .rewards(Window::starting_at(850, 50), &members)
            .await
            .unwrap()
            .iter()
            .map(|r| r.height)
            .collect();
        assert_eq!(heights, vec![850, 860]);
        assert!(source
            .feed::<LatencyRecord>(SourceFeed::Latency)
            .await
            .unwrap()
            .is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
