//! Height oracle: the current value of the upstream height counter.

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait HeightOracle: Send + Sync {
    async fn current_height(&self) -> Result<u64>;
}

/// Oracle backed by an upstream node's `/v1/query/height` endpoint.
#[derive(Debug, Clone)]
pub struct HttpHeightOracle {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct HeightResponse {
    height: u64,
}

impl HttpHeightOracle {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HeightOracle for HttpHeightOracle {
    async fn current_height(&self) -> Result<u64> {
        let url = format!("{}/v1/query/height", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .wrap_err_with(|| format!("height request to {url} failed"))?;
        if !response.status().is_success() {
            return Err(eyre!("height request to {url} returned {}", response.status()));
        }
        let body: HeightResponse = response
            .json()
            .await
            .wrap_err("failed to parse height response")?;
        Ok(body.height)
    }
}

/// Settable oracle for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryHeightOracle {
    height: AtomicU64,
}

#[cfg(test)]
impl MemoryHeightOracle {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
        }
    }

    pub fn set(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl HeightOracle for MemoryHeightOracle {
    async fn current_height(&self) -> Result<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}

/// Tracks the highest height seen so a lagging oracle reading never moves
/// the scheduler backwards.
#[derive(Debug, Default)]
pub struct MonotonicHeight {
    seen: AtomicU64,
}

impl MonotonicHeight {
    pub fn observe(&self, reading: u64) -> u64 {
        let previous = self.seen.fetch_max(reading, Ordering::SeqCst);
        if reading < previous {
            tracing::warn!(reading, kept = previous, "height oracle went backwards");
            previous
        } else {
            reading
        }
    }
}
