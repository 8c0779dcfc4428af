//! JSON-lines log files fed by a tracing layer.

use eyre::{eyre, WrapErr};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing_subscriber::Layer;

/// Buffer size for JSON log channel.
pub const LOG_BUFFER: usize = 10_000;

/// Target of stall policy events.
const STALL_TARGET: &str = "stall";

const FLUSH_EVERY: usize = 256;

#[derive(Debug, Serialize)]
pub struct LogRecord {
    pub t_ms: u64,
    pub level: String,
    pub target: String,
    pub message: Option<String>,
    pub fields: JsonMap<String, JsonValue>,
}

/// Collects event fields as JSON values.
#[derive(Default)]
struct FieldCollector {
    fields: JsonMap<String, JsonValue>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: impl Into<JsonValue>) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    /// The `message` field, lifted out of the remaining fields.
    fn take_message(&mut self) -> Option<String> {
        match self.fields.remove("message")? {
            JsonValue::String(text) => Some(text),
            other => Some(other.to_string()),
        }
    }
}

impl Visit for FieldCollector {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities have no JSON number form.
        match serde_json::Number::from_f64(value) {
            Some(number) => self.put(field, number),
            None => self.put(field, value.to_string()),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

/// Appends records to a JSON-lines file from a background thread. Records
/// are dropped when the channel is full so logging never blocks a driver.
#[derive(Debug)]
pub struct JsonLogWriter {
    opened_at: Instant,
    sender: Mutex<Option<SyncSender<LogRecord>>>,
    worker: Mutex<Option<JoinHandle<eyre::Result<()>>>>,
    dropped: AtomicU64,
}

impl JsonLogWriter {
    pub fn new(path: &Path, capacity: usize) -> eyre::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;
        let (sender, receiver) = mpsc::sync_channel::<LogRecord>(capacity);
        let worker = thread::spawn(move || drain_records(receiver, BufWriter::new(file)));
        Ok(Self {
            opened_at: Instant::now(),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn record(&self, record: LogRecord) {
        let delivered = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.try_send(record).is_ok());
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close the channel and wait until queued records hit the file.
    pub fn finish(&self) -> eyre::Result<()> {
        self.sender.lock().take();
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        worker
            .join()
            .map_err(|_| eyre!("json log writer thread panicked"))?
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }
}

fn drain_records(receiver: Receiver<LogRecord>, mut out: BufWriter<File>) -> eyre::Result<()> {
    for (written, record) in receiver.into_iter().enumerate() {
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
        if (written + 1) % FLUSH_EVERY == 0 {
            out.flush()?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Which events a JSON log layer keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonLogFilter {
    /// Only stall policy events.
    StallsOnly,
    /// Everything except stall policy events.
    ExcludeStalls,
}

impl JsonLogFilter {
    fn accepts(self, target: &str) -> bool {
        let is_stall = target == STALL_TARGET;
        match self {
            Self::StallsOnly => is_stall,
            Self::ExcludeStalls => !is_stall,
        }
    }
}

#[derive(Clone)]
pub struct JsonLogLayer {
    writer: Arc<JsonLogWriter>,
    filter: JsonLogFilter,
}

impl JsonLogLayer {
    pub fn with_filter(writer: Arc<JsonLogWriter>, filter: JsonLogFilter) -> Self {
        Self { writer, filter }
    }
}

impl<S> Layer<S> for JsonLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let meta = event.metadata();
        if !self.filter.accepts(meta.target()) {
            return;
        }
        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        let message = collector.take_message();
        self.writer.record(LogRecord {
            t_ms: self.writer.elapsed_ms(),
            level: meta.level().as_str().to_string(),
            target: meta.target().to_string(),
            message,
            fields: collector.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn stall_events_are_split_from_service_events() {
        let dir = temp_dir("json-log");
        let service = Arc::new(JsonLogWriter::new(&dir.join("service.jsonl"), 16).unwrap());
        let stalls = Arc::new(JsonLogWriter::new(&dir.join("stalls.jsonl"), 16).unwrap());
        let subscriber = tracing_subscriber::registry()
            .with(JsonLogLayer::with_filter(
                Arc::clone(&service),
                JsonLogFilter::ExcludeStalls,
            ))
            .with(JsonLogLayer::with_filter(
                Arc::clone(&stalls),
                JsonLogFilter::StallsOnly,
            ));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(cache_set = 4u64, "cycle started");
            tracing::warn!(target: "stall", cache_set = 4u64, stall_count = 3u32, "skipping stuck window");
        });
        service.finish().unwrap();
        stalls.finish().unwrap();

        let service_log = std::fs::read_to_string(dir.join("service.jsonl")).unwrap();
        let stall_log = std::fs::read_to_string(dir.join("stalls.jsonl")).unwrap();
        assert_eq!(service_log.lines().count(), 1);
        assert_eq!(stall_log.lines().count(), 1);
        let record: JsonValue = serde_json::from_str(stall_log.trim()).unwrap();
        assert_eq!(record["target"], "stall");
        assert_eq!(record["message"], "skipping stuck window");
        assert_eq!(record["fields"]["stall_count"], 3);
        assert_eq!(service.dropped_events(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
