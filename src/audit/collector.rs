use super::events::AuditEvent;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Maximum concurrent collector deliveries
const MAX_CONCURRENT_DELIVERIES: usize = 32;
const MAX_RETRIES: u32 = 2;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("collector returned HTTP {0}")]
    Status(u16),
}

/// Forwards audit events to a remote HTTP collector as JSON.
///
/// Delivery is fire-and-forget: each event is posted from its own task,
/// concurrency is bounded by a semaphore, and failures are only logged.
pub struct CollectorSink {
    url: String,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl CollectorSink {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.to_string(),
            client,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dispatch(&self, event: &AuditEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit event for collector");
                return;
            }
        };
        let event_type = event.event_type();

        // Saturated collector: drop rather than queue unbounded tasks.
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                debug!(url = %self.url, event = event_type, "Collector busy, dropping delivery");
                return;
            }
        };

        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let mut attempt = 0u32;
            loop {
                match deliver(&client, &url, &payload).await {
                    Ok(()) => {
                        debug!(url = %url, event = event_type, attempt, "Audit event delivered");
                        return;
                    }
                    Err(e) => {
                        if attempt >= MAX_RETRIES {
                            warn!(url = %url, error = %e, attempts = attempt + 1, "Collector delivery failed after retries");
                            return;
                        }
                        let delay_ms = RETRY_DELAY_MS * 2u64.pow(attempt);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                    }
                }
            }
        });
    }
}

async fn deliver(
    client: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
) -> Result<(), SinkError> {
    let response = client.post(url).json(payload).send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(SinkError::Status(status.as_u16()))
    }
}
