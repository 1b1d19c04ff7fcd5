//! Shared test utilities for unit tests.
//!
//! Provides snapshot and channel-context builders so each test file does not
//! repeat the setup. Usage: add `mod test_support;` at the top of the file.

#![allow(dead_code)]

use sshlure::audit::events::AuditEvent;
use sshlure::audit::AuditLogger;
use sshlure::channel::ChannelContext;
use sshlure::config::Snapshot;
use sshlure::metrics::MetricsRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Build a snapshot from TOML text. Host keys are generated in a throwaway
/// data directory; the keys stay loaded after it is removed.
pub fn snapshot(toml: &str) -> Arc<Snapshot> {
    let dir = tempfile::tempdir().unwrap();
    Arc::new(Snapshot::build(toml, dir.path()).unwrap())
}

/// Audit logger whose events can be read back by the test.
pub fn recording_audit() -> (Arc<AuditLogger>, mpsc::Receiver<AuditEvent>) {
    let (logger, rx) = AuditLogger::with_receiver(4096);
    (Arc::new(logger), rx)
}

/// Everything queued so far, oldest first.
pub fn drain(rx: &mut mpsc::Receiver<AuditEvent>) -> Vec<AuditEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Serialized form of each event, for field assertions.
pub fn as_json(events: &[AuditEvent]) -> Vec<serde_json::Value> {
    events
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect()
}

pub fn of_type<'a>(events: &'a [AuditEvent], event_type: &str) -> Vec<&'a AuditEvent> {
    events
        .iter()
        .filter(|e| e.event_type() == event_type)
        .collect()
}

pub struct ChannelHarness {
    pub ctx: ChannelContext,
    pub audit_rx: mpsc::Receiver<AuditEvent>,
    pub metrics: Arc<MetricsRegistry>,
}

impl ChannelHarness {
    pub fn events(&mut self) -> Vec<AuditEvent> {
        drain(&mut self.audit_rx)
    }
}

pub fn channel_harness(toml: &str, username: &str) -> ChannelHarness {
    let (audit, audit_rx) = recording_audit();
    let metrics = Arc::new(MetricsRegistry::new());
    let ctx = ChannelContext {
        conn_id: "0a1b2c3d".to_string(),
        channel_id: 0,
        username: username.to_string(),
        snapshot: snapshot(toml),
        audit,
        metrics: metrics.clone(),
    };
    ChannelHarness {
        ctx,
        audit_rx,
        metrics,
    }
}
