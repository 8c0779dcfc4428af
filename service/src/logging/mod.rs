//! Tracing setup: stdout plus optional JSON-lines files.
//!
//! With `--log-json`, events go to `service.jsonl` and stall policy events
//! (target `stall`) go to their own `stalls.jsonl`.

mod json;

pub use json::{JsonLogFilter, JsonLogLayer, JsonLogWriter, LOG_BUFFER};

use crate::cli::{ServiceConfig, DEFAULT_LOG_JSON_FILTER};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

pub const SERVICE_LOG_FILE: &str = "service.jsonl";
pub const STALL_LOG_FILE: &str = "stalls.jsonl";

/// Guards that must be held to keep logging active.
pub struct TracingGuards {
    pub service_writer: Option<Arc<JsonLogWriter>>,
    pub stall_writer: Option<Arc<JsonLogWriter>>,
}

impl TracingGuards {
    /// Flush and close the JSON log files.
    pub fn finish(&self) {
        for writer in [&self.service_writer, &self.stall_writer].into_iter().flatten() {
            if let Err(err) = writer.finish() {
                warn!(error = %err, "failed to flush json log");
            }
            if writer.dropped_events() > 0 {
                warn!(dropped = writer.dropped_events(), "json log dropped events");
            }
        }
    }
}

fn stdout_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let (global, local) = match verbosity {
            0 => ("warn", "info"),
            1 => ("warn", "debug"),
            2 => ("info", "trace"),
            _ => ("debug", "trace"),
        };
        EnvFilter::new(format!("{global},cacheset_sync={local},stall={local},perf={local}"))
    })
}

fn open_writer(config: &ServiceConfig, file: &str) -> Option<Arc<JsonLogWriter>> {
    if !config.log_json {
        return None;
    }
    let path = config.log_dir.join(file);
    match JsonLogWriter::new(&path, LOG_BUFFER) {
        Ok(writer) => Some(Arc::new(writer)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to initialize json log writer");
            None
        }
    }
}

pub fn init_tracing(config: &ServiceConfig) -> TracingGuards {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter(config.verbosity));

    let json_filter = || {
        EnvFilter::try_new(&config.log_json_filter)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_JSON_FILTER))
    };
    let service_writer = open_writer(config, SERVICE_LOG_FILE);
    let stall_writer = open_writer(config, STALL_LOG_FILE);
    let service_layer = service_writer.as_ref().map(|writer| {
        JsonLogLayer::with_filter(Arc::clone(writer), JsonLogFilter::ExcludeStalls)
            .with_filter(json_filter())
    });
    let stall_layer = stall_writer.as_ref().map(|writer| {
        JsonLogLayer::with_filter(Arc::clone(writer), JsonLogFilter::StallsOnly)
            .with_filter(json_filter())
    });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(service_layer)
        .with(stall_layer)
        .init();

    TracingGuards {
        service_writer,
        stall_writer,
    }
}
