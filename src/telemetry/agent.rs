//! Batching agent linked into sandboxed programs.
//!
//! Events are buffered in arrival order and handed to a [`BatchSink`] as one
//! NDJSON body once `batch_size` of them are pending, on [`Agent::flush`], and
//! on [`Agent::shutdown`]. A batch whose delivery fails is logged and dropped.

use super::event::{to_ndjson, Event};
use crate::config::daemon::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_INGEST_URL};
use crate::config::types::Result;
use chrono::Utc;
use log::{debug, error, info};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Agent settings, normally taken from the variables the daemon injects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    pub ingest_url: String,
    pub run_id: String,
    pub batch_size: usize,
    /// Period the host runtime hook should call [`Agent::flush`] at. The
    /// agent runs no timer of its own; it only carries the value.
    pub flush_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            run_id: String::new(),
            batch_size: DEFAULT_BATCH_SIZE as usize,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset, empty or unparsable values fall back to the defaults. A batch
    /// size of zero is treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Self {
            ingest_url: get("KYNTRIX_INGEST_URL").unwrap_or(defaults.ingest_url),
            run_id: get("KYNTRIX_RUN_ID").unwrap_or(defaults.run_id),
            batch_size: get("KYNTRIX_BATCH_SIZE")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.batch_size),
            flush_interval_ms: get("KYNTRIX_FLUSH_MS")
                .or_else(|| get("KYNTRIX_FLUSH_INTERVAL"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.flush_interval_ms),
        }
    }
}

/// Destination of encoded batches. [`HttpSink`](super::HttpSink) posts them
/// to the ingest endpoint.
pub trait BatchSink: Send + Sync {
    fn deliver(&self, ingest_url: &str, body: &str) -> Result<()>;
}

/// Keeps every delivered body; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn batches(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BatchSink for MemorySink {
    fn deliver(&self, _ingest_url: &str, body: &str) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(body.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct Buffer {
    events: Vec<Event>,
    closed: bool,
}

pub struct Agent<S: BatchSink> {
    config: AgentConfig,
    sink: S,
    buffer: Mutex<Buffer>,
    seq: AtomicI64,
}

impl<S: BatchSink> Agent<S> {
    pub fn new(config: AgentConfig, sink: S) -> Self {
        info!(
            "telemetry agent ready: url={} batch={}",
            config.ingest_url, config.batch_size
        );
        let capacity = config.batch_size;
        Self {
            config,
            sink,
            buffer: Mutex::new(Buffer {
                events: Vec::with_capacity(capacity),
                closed: false,
            }),
            seq: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Next per-agent sequence number, starting at 1.
    pub fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Wall clock in milliseconds since the Unix epoch.
    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer one event; returns false once the agent is shut down.
    pub fn record(&self, event: Event) -> bool {
        let mut event = event.normalized();
        if event.run_id.is_empty() {
            event.run_id = self.config.run_id.clone();
        }

        let mut buffer = self.lock();
        if buffer.closed {
            debug!("event {:?} recorded after shutdown; dropped", event.kind);
            return false;
        }
        buffer.events.push(event);

        if buffer.events.len() >= self.config.batch_size {
            if let Err(e) = self.flush_locked(&mut buffer) {
                error!("telemetry batch lost: {}", e);
            }
        }
        true
    }

    /// Deliver everything buffered. Returns the number of events sent.
    pub fn flush(&self) -> Result<usize> {
        let mut buffer = self.lock();
        self.flush_locked(&mut buffer)
    }

    /// Final flush; later records are refused.
    pub fn shutdown(&self) -> Result<usize> {
        let mut buffer = self.lock();
        let flushed = self.flush_locked(&mut buffer);
        buffer.events.clear();
        buffer.closed = true;
        info!("telemetry agent shut down");
        flushed
    }

    pub fn pending(&self) -> usize {
        self.lock().events.len()
    }

    fn flush_locked(&self, buffer: &mut Buffer) -> Result<usize> {
        if buffer.events.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut buffer.events);
        let body = to_ndjson(&batch)?;

        self.sink.deliver(&self.config.ingest_url, &body)?;
        debug!(
            "delivered {} events ({} bytes) to {}",
            batch.len(),
            body.len(),
            self.config.ingest_url
        );
        Ok(batch.len())
    }
}
