use sshlure::metrics::{outcome, MetricsRegistry, OTHER_LABEL};

fn render(metrics: &MetricsRegistry) -> String {
    metrics.encode_text().unwrap()
}

// ---------------------------------------------------------------------------
// Creating a registry
// ---------------------------------------------------------------------------

#[test]
fn default_impl_same_as_new() {
    let m1 = MetricsRegistry::new();
    let m2 = MetricsRegistry::default();
    for i in 0..100 {
        m1.record_subsystem(&format!("s{i}"), false);
        m2.record_subsystem(&format!("s{i}"), false);
    }
    assert_eq!(m1.cardinality_capped_total.get(), 0);
    assert_eq!(m2.cardinality_capped_total.get(), 0);

    m1.record_subsystem("overflow", false);
    m2.record_subsystem("overflow", false);
    assert_eq!(m1.cardinality_capped_total.get(), 1);
    assert_eq!(m2.cardinality_capped_total.get(), 1);
}

#[test]
fn outcome_labels() {
    assert_eq!(outcome(true), "accepted");
    assert_eq!(outcome(false), "rejected");
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[test]
fn connection_open_and_close() {
    let metrics = MetricsRegistry::new();
    metrics.record_connection_opened();
    metrics.record_connection_opened();
    assert_eq!(metrics.connections_total.get(), 2);
    assert_eq!(metrics.connections_active.get(), 2);

    metrics.record_connection_closed("closed", 1.5);
    assert_eq!(metrics.connections_total.get(), 2);
    assert_eq!(metrics.connections_active.get(), 1);

    let text = render(&metrics);
    assert!(text.contains("sshlure_connection_duration_seconds_count{reason=\"closed\"} 1"));
}

// ---------------------------------------------------------------------------
// Labelled counters
// ---------------------------------------------------------------------------

#[test]
fn auth_attempts_by_method_and_outcome() {
    let metrics = MetricsRegistry::new();
    metrics.record_auth_attempt("password", false);
    metrics.record_auth_attempt("password", false);
    metrics.record_auth_attempt("publickey", true);

    let text = render(&metrics);
    assert!(text.contains(
        "sshlure_auth_attempts_total{method=\"password\",outcome=\"rejected\"} 2"
    ));
    assert!(text.contains(
        "sshlure_auth_attempts_total{method=\"publickey\",outcome=\"accepted\"} 1"
    ));
}

#[test]
fn channel_and_forward_counters() {
    let metrics = MetricsRegistry::new();
    metrics.record_channel_open("session", true);
    metrics.record_channel_open("direct-tcpip", false);
    metrics.record_forward("tcpip-forward", true);
    metrics.record_command("exec", "not_found");

    let text = render(&metrics);
    assert!(text.contains(
        "sshlure_channel_opens_total{channel_type=\"session\",outcome=\"accepted\"} 1"
    ));
    assert!(text.contains(
        "sshlure_channel_opens_total{channel_type=\"direct-tcpip\",outcome=\"rejected\"} 1"
    ));
    assert!(text.contains(
        "sshlure_forward_requests_total{kind=\"tcpip-forward\",outcome=\"accepted\"} 1"
    ));
    assert!(text.contains("sshlure_commands_total{kind=\"exec\",resolution=\"not_found\"} 1"));
}

#[test]
fn config_reload_outcomes() {
    let metrics = MetricsRegistry::new();
    metrics.record_config_reload(true);
    metrics.record_config_reload(false);
    metrics.record_config_reload(false);
    let text = render(&metrics);
    assert!(text.contains("sshlure_config_reloads_total{outcome=\"success\"} 1"));
    assert!(text.contains("sshlure_config_reloads_total{outcome=\"failure\"} 2"));
}

#[test]
fn audit_dropped_counter_exposed() {
    let metrics = MetricsRegistry::new();
    metrics.audit_events_dropped.inc();
    assert!(render(&metrics).contains("sshlure_audit_events_dropped_total 1"));
}

// ---------------------------------------------------------------------------
// Cardinality protection
// ---------------------------------------------------------------------------

#[test]
fn peer_chosen_labels_capped() {
    let metrics = MetricsRegistry::with_max_labels(2);
    metrics.record_channel_request("pty-req", true);
    metrics.record_channel_request("env", true);
    metrics.record_channel_request("made-up-request@evil", false);
    metrics.record_subsystem("another-one", false);

    assert_eq!(metrics.cardinality_capped_total.get(), 2);
    let text = render(&metrics);
    assert!(text.contains(&format!(
        "sshlure_channel_requests_total{{request_type=\"{OTHER_LABEL}\",outcome=\"rejected\"}} 1"
    )));
    assert!(!text.contains("made-up-request@evil"));
}

#[test]
fn known_label_not_capped_again() {
    let metrics = MetricsRegistry::with_max_labels(1);
    metrics.record_channel_request("shell", true);
    metrics.record_channel_request("shell", false);
    assert_eq!(metrics.cardinality_capped_total.get(), 0);
}
