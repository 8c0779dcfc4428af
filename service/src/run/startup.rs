//! Wiring of storage, source, oracle and units.

use crate::aggregate::source::{JsonlSource, SourceData};
use crate::aggregate::{build_units, AggregationUnit, UnitContext};
use crate::cli::ServiceConfig;
use crate::ledger::CheckpointLedger;
use crate::oracle::{HeightOracle, HttpHeightOracle};
use crate::storage::Storage;
use crate::sync::dispatcher::{DispatchLimits, Dispatcher, PollSchedule};
use crate::sync::SyncSettings;
use eyre::Result;
use std::sync::Arc;
use tracing::info;

/// Everything a command needs, opened once per process.
pub struct ServiceContext {
    pub config: ServiceConfig,
    pub settings: SyncSettings,
    pub storage: Storage,
    pub oracle: Arc<dyn HeightOracle>,
    pub units: Vec<Arc<dyn AggregationUnit>>,
}

impl ServiceContext {
    /// Open the data dir and connect to the configured source and oracle.
    pub fn open(config: &ServiceConfig) -> Result<Self> {
        let source: Arc<dyn SourceData> = Arc::new(JsonlSource::new(config.source_dir.clone()));
        let oracle: Arc<dyn HeightOracle> =
            Arc::new(HttpHeightOracle::new(config.oracle_url.clone())?);
        Self::with_parts(config, source, oracle)
    }

    pub fn with_parts(
        config: &ServiceConfig,
        source: Arc<dyn SourceData>,
        oracle: Arc<dyn HeightOracle>,
    ) -> Result<Self> {
        let settings = SyncSettings::from_config(config)?;
        let storage = Storage::open(config)?;
        let unit_ctx = UnitContext {
            source,
            registry: Arc::clone(&storage.registry),
            results: Arc::clone(&storage.results),
            interval: settings.interval,
        };
        let metrics = config.enabled_metrics();
        let units = build_units(&unit_ctx, &metrics);
        info!(
            data_dir = %config.data_dir.display(),
            interval = settings.interval,
            look_back = settings.look_back,
            metrics = ?metrics,
            ledger_entries = storage.ledger.len(),
            results = storage.results.len(),
            "service context ready"
        );
        Ok(Self {
            config: config.clone(),
            settings,
            storage,
            oracle,
            units,
        })
    }

    pub fn ledger(&self) -> Arc<dyn CheckpointLedger> {
        Arc::clone(&self.storage.ledger) as Arc<dyn CheckpointLedger>
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.storage.registry),
            self.ledger(),
            self.units.clone(),
            self.settings,
            DispatchLimits::from_config(&self.config),
        )
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule::from_config(&self.config)
    }
}
