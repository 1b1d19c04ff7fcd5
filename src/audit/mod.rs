pub mod collector;
pub mod events;

use crate::config::types::LoggingConfig;
use collector::CollectorSink;
use events::AuditEvent;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const AUDIT_CHANNEL_CAPACITY: usize = 10_000;
const RECENT_EVENTS_CAPACITY: usize = 100;

/// Where audit events go once dequeued.
#[derive(Debug, Clone, Default)]
pub struct AuditSettings {
    pub log_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_files: u32,
    pub console: bool,
    pub collector_url: Option<String>,
}

impl AuditSettings {
    pub fn from_config(logging: &LoggingConfig) -> Self {
        Self {
            log_path: logging.audit_log_path.clone(),
            max_size_bytes: logging.audit_max_size_mb.saturating_mul(1024 * 1024),
            max_files: logging.audit_max_files,
            console: logging.audit_console,
            collector_url: logging.collector_url.clone(),
        }
    }
}

/// Asynchronous audit logger.
///
/// `record` never blocks: events go through a bounded queue to a single
/// writer task. When the queue is full the event is dropped and counted.
pub struct AuditLogger {
    sender: mpsc::Sender<AuditEvent>,
    dropped_count: AtomicU64,
    dropped_metric: std::sync::OnceLock<prometheus_client::metrics::counter::Counter>,
    recent_events: Arc<Mutex<VecDeque<AuditEvent>>>,
}

impl AuditLogger {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn new(settings: AuditSettings) -> Self {
        let (sender, receiver) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
        tokio::spawn(audit_writer_task(receiver, settings));
        Self::from_sender(sender)
    }

    /// Logger whose events are silently discarded (no runtime required).
    pub fn new_noop() -> Self {
        let (sender, _receiver) = mpsc::channel(1);
        Self::from_sender(sender)
    }

    /// Logger backed by a caller-owned queue of the given capacity, for
    /// inspecting emitted events directly.
    pub fn with_receiver(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::from_sender(sender), receiver)
    }

    fn from_sender(sender: mpsc::Sender<AuditEvent>) -> Self {
        Self {
            sender,
            dropped_count: AtomicU64::new(0),
            dropped_metric: std::sync::OnceLock::new(),
            recent_events: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAPACITY))),
        }
    }

    /// Wire the Prometheus counter for dropped audit events.
    pub fn set_dropped_metric(&self, counter: prometheus_client::metrics::counter::Counter) {
        let _ = self.dropped_metric.set(counter);
    }

    /// Number of audit events dropped due to queue overflow
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Queue an event for the sinks. Never blocks and never fails.
    pub fn record(&self, event: AuditEvent) {
        {
            let mut buf = self
                .recent_events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if buf.len() >= RECENT_EVENTS_CAPACITY {
                buf.pop_front();
            }
            buf.push_back(event.clone());
        }

        if let Err(e) = self.sender.try_send(event) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            self.count_drop(reason);
        }
    }

    fn count_drop(&self, reason: &str) {
        let dropped = self.dropped_count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(counter) = self.dropped_metric.get() {
            counter.inc();
        }
        if dropped % 100 == 1 {
            warn!(
                total_dropped = dropped,
                reason, "Audit events being dropped"
            );
        }
    }

    /// Return the most recent audit events (up to `max`), newest last.
    pub fn recent_events(&self, max: usize) -> Vec<AuditEvent> {
        let buf = self
            .recent_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = buf.len().saturating_sub(max);
        buf.iter().skip(skip).cloned().collect()
    }
}

async fn open_append(path: &std::path::Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn audit_writer_task(mut receiver: mpsc::Receiver<AuditEvent>, settings: AuditSettings) {
    let log_path = settings.log_path.clone();
    let mut file = if let Some(path) = &log_path {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match open_append(path).await {
            Ok(f) => Some(f),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to open audit log");
                None
            }
        }
    } else {
        None
    };

    let mut current_size: u64 = match (&log_path, &file) {
        (Some(path), Some(_)) => tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .unwrap_or(0),
        _ => 0,
    };

    let collector = settings.collector_url.as_deref().map(CollectorSink::new);
    if let Some(ref c) = collector {
        info!(url = %c.url(), "Forwarding audit events to collector");
    }

    while let Some(event) = receiver.recv().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize audit event");
                continue;
            }
        };

        if settings.console {
            info!(
                target: "sshlure::audit",
                event_type = event.event_type(),
                conn_id = event.conn_id().unwrap_or("-"),
                "{}",
                json
            );
        } else {
            debug!(event = %json, "Audit event");
        }

        if let Some(ref c) = collector {
            c.dispatch(&event);
        }

        let Some(ref mut f) = file else {
            continue;
        };
        let line = format!("{}\n", json);
        if let Err(e) = f.write_all(line.as_bytes()).await {
            error!(error = %e, "Failed to write audit log");
            continue;
        }
        if let Err(e) = f.flush().await {
            error!(error = %e, "Failed to flush audit log");
        }
        current_size += line.len() as u64;

        if settings.max_size_bytes > 0 && current_size >= settings.max_size_bytes {
            if let Some(ref path) = log_path {
                drop(file.take());
                rotate_audit_files(path, settings.max_files).await;
                match open_append(path).await {
                    Ok(new_file) => {
                        file = Some(new_file);
                        current_size = 0;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to reopen audit log after rotation");
                    }
                }
            }
        }
    }
}

/// Rotate audit log files: audit.jsonl -> audit.jsonl.1, audit.jsonl.1 -> audit.jsonl.2, etc.
/// Files beyond `max_files` are overwritten by the shift.
pub async fn rotate_audit_files(path: &std::path::Path, max_files: u32) {
    if max_files == 0 {
        if let Err(e) = tokio::fs::remove_file(path).await {
            error!(error = %e, "Failed to truncate audit log");
        }
        return;
    }
    for i in (1..max_files).rev() {
        let from = format!("{}.{}", path.display(), i);
        let to = format!("{}.{}", path.display(), i + 1);
        let _ = tokio::fs::rename(&from, &to).await;
    }
    let rotated = format!("{}.1", path.display());
    if let Err(e) = tokio::fs::rename(path, &rotated).await {
        error!(error = %e, "Failed to rotate audit log");
    }
}
