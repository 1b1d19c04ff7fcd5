pub mod collectors;
pub mod server;

use collectors::{
    AuthLabel, ChannelOpenLabel, CommandLabel, ForwardLabel, OutcomeLabel, ReasonLabel,
    RequestLabel, SubsystemLabel,
};
use dashmap::DashSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label value used once a free-form label hits its cardinality cap.
pub const OTHER_LABEL: &str = "_other";

/// Constructor for connection duration histograms.
/// Covers port scanners (sub-second) up to the default one hour session cap.
#[derive(Clone)]
pub struct ConnectionDurationHistogramBuilder;

impl MetricConstructor<Histogram> for ConnectionDurationHistogramBuilder {
    fn new_metric(&self) -> Histogram {
        Histogram::new([
            0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0,
        ])
    }
}

pub fn outcome(accepted: bool) -> &'static str {
    if accepted {
        "accepted"
    } else {
        "rejected"
    }
}

/// Centralized metrics registry with cardinality protection
pub struct MetricsRegistry {
    pub registry: Registry,
    pub connections_total: Counter,
    pub connections_active: Gauge,
    pub auth_attempts_total: Family<AuthLabel, Counter>,
    pub channels_opened_total: Family<ChannelOpenLabel, Counter>,
    pub channel_requests_total: Family<RequestLabel, Counter>,
    pub commands_total: Family<CommandLabel, Counter>,
    pub subsystem_requests_total: Family<SubsystemLabel, Counter>,
    pub forward_requests_total: Family<ForwardLabel, Counter>,
    pub connection_duration_seconds:
        Family<ReasonLabel, Histogram, ConnectionDurationHistogramBuilder>,
    pub config_reloads_total: Family<OutcomeLabel, Counter>,
    pub audit_events_dropped: Counter,
    pub cardinality_capped_total: Counter,
    /// Peer-chosen label values seen so far (subsystem names, request types)
    known_labels: DashSet<String>,
    max_labels: u32,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_max_labels(100)
    }

    pub fn with_max_labels(max_labels: u32) -> Self {
        let mut registry = Registry::default();

        let connections_total = Counter::default();
        registry.register(
            "sshlure_connections",
            "Total accepted TCP connections since start",
            connections_total.clone(),
        );

        let connections_active = Gauge::default();
        registry.register(
            "sshlure_connections_active",
            "Currently open connections",
            connections_active.clone(),
        );

        let auth_attempts_total = Family::<AuthLabel, Counter>::default();
        registry.register(
            "sshlure_auth_attempts",
            "Authentication attempts by method and outcome",
            auth_attempts_total.clone(),
        );

        let channels_opened_total = Family::<ChannelOpenLabel, Counter>::default();
        registry.register(
            "sshlure_channel_opens",
            "Channel open requests by type and outcome",
            channels_opened_total.clone(),
        );

        let channel_requests_total = Family::<RequestLabel, Counter>::default();
        registry.register(
            "sshlure_channel_requests",
            "Channel requests by type and outcome",
            channel_requests_total.clone(),
        );

        let commands_total = Family::<CommandLabel, Counter>::default();
        registry.register(
            "sshlure_commands",
            "Fabricated command executions by kind (exec/shell) and resolution",
            commands_total.clone(),
        );

        let subsystem_requests_total = Family::<SubsystemLabel, Counter>::default();
        registry.register(
            "sshlure_subsystem_requests",
            "Subsystem requests by name and outcome",
            subsystem_requests_total.clone(),
        );

        let forward_requests_total = Family::<ForwardLabel, Counter>::default();
        registry.register(
            "sshlure_forward_requests",
            "Port forwarding requests by kind and outcome",
            forward_requests_total.clone(),
        );

        let connection_duration_seconds = Family::<
            ReasonLabel,
            Histogram,
            ConnectionDurationHistogramBuilder,
        >::new_with_constructor(
            ConnectionDurationHistogramBuilder
        );
        registry.register(
            "sshlure_connection_duration_seconds",
            "Connection duration in seconds by disconnect reason",
            connection_duration_seconds.clone(),
        );

        let config_reloads_total = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "sshlure_config_reloads",
            "Configuration reloads by outcome",
            config_reloads_total.clone(),
        );

        let audit_events_dropped = Counter::default();
        registry.register(
            "sshlure_audit_events_dropped",
            "Audit events dropped due to queue overflow",
            audit_events_dropped.clone(),
        );

        let cardinality_capped_total = Counter::default();
        registry.register(
            "sshlure_metrics_cardinality_capped",
            "Times a metric label was aggregated under _other due to cardinality cap",
            cardinality_capped_total.clone(),
        );

        Self {
            registry,
            connections_total,
            connections_active,
            auth_attempts_total,
            channels_opened_total,
            channel_requests_total,
            commands_total,
            subsystem_requests_total,
            forward_requests_total,
            connection_duration_seconds,
            config_reloads_total,
            audit_events_dropped,
            cardinality_capped_total,
            known_labels: DashSet::new(),
            max_labels,
        }
    }

    /// Resolve a peer-controlled label value, capping cardinality at max_labels.
    /// Returns "_other" if the cap is exceeded for a previously unseen value.
    fn resolve_label(&self, value: &str) -> String {
        if self.known_labels.contains(value) {
            return value.to_string();
        }
        if (self.known_labels.len() as u32) < self.max_labels {
            let owned = value.to_string();
            self.known_labels.insert(owned.clone());
            return owned;
        }
        self.cardinality_capped_total.inc();
        OTHER_LABEL.to_string()
    }

    pub fn record_connection_opened(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self, reason: &str, duration_secs: f64) {
        self.connections_active.dec();
        self.connection_duration_seconds
            .get_or_create(&ReasonLabel {
                reason: reason.to_string(),
            })
            .observe(duration_secs);
    }

    pub fn record_auth_attempt(&self, method: &str, accepted: bool) {
        self.auth_attempts_total
            .get_or_create(&AuthLabel {
                method: method.to_string(),
                outcome: outcome(accepted).to_string(),
            })
            .inc();
    }

    pub fn record_channel_open(&self, channel_type: &str, accepted: bool) {
        self.channels_opened_total
            .get_or_create(&ChannelOpenLabel {
                channel_type: channel_type.to_string(),
                outcome: outcome(accepted).to_string(),
            })
            .inc();
    }

    pub fn record_channel_request(&self, request_type: &str, accepted: bool) {
        let label = self.resolve_label(request_type);
        self.channel_requests_total
            .get_or_create(&RequestLabel {
                request_type: label,
                outcome: outcome(accepted).to_string(),
            })
            .inc();
    }

    pub fn record_command(&self, kind: &str, resolution: &str) {
        self.commands_total
            .get_or_create(&CommandLabel {
                kind: kind.to_string(),
                resolution: resolution.to_string(),
            })
            .inc();
    }

    pub fn record_subsystem(&self, name: &str, accepted: bool) {
        let label = self.resolve_label(name);
        self.subsystem_requests_total
            .get_or_create(&SubsystemLabel {
                name: label,
                outcome: outcome(accepted).to_string(),
            })
            .inc();
    }

    pub fn record_forward(&self, kind: &str, accepted: bool) {
        self.forward_requests_total
            .get_or_create(&ForwardLabel {
                kind: kind.to_string(),
                outcome: outcome(accepted).to_string(),
            })
            .inc();
    }

    pub fn record_config_reload(&self, success: bool) {
        self.config_reloads_total
            .get_or_create(&OutcomeLabel {
                outcome: if success { "success" } else { "failure" }.to_string(),
            })
            .inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
