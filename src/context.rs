use crate::audit::AuditLogger;
use crate::config::ConfigStore;
use crate::metrics::MetricsRegistry;
use std::sync::Arc;

/// Shared application context, replacing scattered Arc parameters
pub struct AppContext {
    pub store: Arc<ConfigStore>,
    pub audit: Arc<AuditLogger>,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppContext {
    pub fn new(
        store: Arc<ConfigStore>,
        audit: Arc<AuditLogger>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            audit,
            metrics,
        }
    }
}
