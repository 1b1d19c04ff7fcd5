use crate::audit::events::AuditEvent;
use crate::audit::{AuditLogger, AuditSettings};
use crate::config::{self, ConfigError, ConfigStore, Snapshot};
use crate::context::AppContext;
use crate::metrics::MetricsRegistry;
use crate::ssh::handler::SshHandler;
use crate::ssh::session::ConnectionInfo;
use crate::ssh::stream::AbortableStream;
use crate::utils::generate_correlation_id;

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long a connection gets to wind down after we ask it to disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Main server orchestrator.
///
/// Binds every listen address, serves until SIGTERM / ctrl-c, and reloads the
/// config file on SIGHUP.
pub async fn run(store: Arc<ConfigStore>, config_path: Option<PathBuf>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let server = start(store, shutdown.clone()).await?;

    let ctx = server.ctx.clone();
    tokio::spawn(handle_signals(ctx, config_path, shutdown.clone()));

    shutdown.cancelled().await;
    server.drain().await;
    Ok(())
}

/// A started server: listeners bound, accept loops running.
pub struct RunningServer {
    pub ctx: Arc<AppContext>,
    pub local_addrs: Vec<SocketAddr>,
    pub metrics_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    shutdown_timeout: Duration,
}

impl RunningServer {
    /// Stop accepting and wait (bounded by `server.shutdown_timeout`) for live
    /// connections to close.
    pub async fn drain(self) {
        self.shutdown.cancel();
        self.tracker.close();
        info!(
            timeout_secs = self.shutdown_timeout.as_secs(),
            active = self.tracker.len(),
            "Initiating graceful shutdown"
        );
        if tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                active = self.tracker.len(),
                "Shutdown timeout reached, forcing exit"
            );
        } else {
            info!("Graceful shutdown complete");
        }
    }
}

/// Set up shared services and bind every listener. A bind failure is fatal.
pub async fn start(store: Arc<ConfigStore>, shutdown: CancellationToken) -> Result<RunningServer> {
    let snapshot = store.current();
    let logging = &snapshot.config.logging;

    let metrics = Arc::new(MetricsRegistry::new());
    let audit = Arc::new(AuditLogger::new(AuditSettings::from_config(logging)));
    // Wire the audit dropped counter to the Prometheus metric
    audit.set_dropped_metric(metrics.audit_events_dropped.clone());

    let ctx = Arc::new(AppContext::new(store.clone(), audit, metrics.clone()));
    let tracker = TaskTracker::new();

    let mut listeners = Vec::with_capacity(snapshot.listen_addresses.len());
    for addr in &snapshot.listen_addresses {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        listeners.push(listener);
    }

    // Metrics server: advisory, a bind failure only disables it
    let mut metrics_addr = None;
    if let Some(listen) = &logging.metrics_address {
        match TcpListener::bind(listen).await {
            Ok(listener) => {
                metrics_addr = listener.local_addr().ok();
                let metrics = metrics.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        crate::metrics::server::serve_metrics(listener, metrics, shutdown).await
                    {
                        error!(error = %e, "Metrics server error");
                    }
                });
            }
            Err(e) => {
                warn!(addr = %listen, error = %e, "Metrics server disabled: bind failed");
            }
        }
    }

    let mut local_addrs = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "SSH server listening");
        local_addrs.push(addr);
        let span = info_span!("accept", addr = %addr);
        tokio::spawn(
            serve_listener(listener, ctx.clone(), shutdown.clone(), tracker.clone())
                .instrument(span),
        );
    }

    Ok(RunningServer {
        ctx,
        local_addrs,
        metrics_addr,
        shutdown,
        tracker,
        shutdown_timeout: Duration::from_secs(snapshot.config.server.shutdown_timeout),
    })
}

/// Accept loop for one listen address. Never waits on a handshake; the
/// listener is dropped as soon as shutdown starts.
pub async fn serve_listener(
    listener: TcpListener,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(serve_connection(stream, peer, ctx.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    // Back off briefly so fd exhaustion does not spin the loop.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    drop(listener);
    debug!("Listener closed");
}

/// Own one accepted socket from handshake to disconnect record.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
) {
    let snapshot = ctx.store.current();
    let local = stream.local_addr().unwrap_or(peer);
    let _ = stream.set_nodelay(true);

    let info = Arc::new(ConnectionInfo::new(generate_correlation_id(), peer));
    let span = info_span!("conn", conn_id = %info.conn_id, peer = %peer);

    async move {
        info!("New SSH connection");
        ctx.audit
            .record(AuditEvent::connection_new(&info.conn_id, &peer, &local));
        ctx.metrics.record_connection_opened();

        let conn_cancel = shutdown.child_token();
        let handler = SshHandler::new(
            ctx.clone(),
            snapshot.clone(),
            info.clone(),
            conn_cancel.clone(),
        );
        let reason = drive_session(stream, handler, &snapshot, &info, &shutdown).await;
        conn_cancel.cancel();

        let reason = info.close_reason().unwrap_or(reason);
        let duration = info.started.elapsed();
        ctx.audit.record(AuditEvent::disconnect(
            &info.conn_id,
            &peer,
            info.username().map(str::to_string),
            reason,
            duration.as_millis() as u64,
        ));
        ctx.metrics
            .record_connection_closed(reason, duration.as_secs_f64());
        info!(
            reason,
            user = ?info.username(),
            duration_ms = duration.as_millis() as u64,
            "SSH connection closed"
        );
    }
    .instrument(span)
    .await
}

/// Run the transport until it ends on its own or a limit fires. Returns the
/// disconnect reason.
async fn drive_session(
    stream: TcpStream,
    handler: SshHandler,
    snapshot: &Snapshot,
    info: &ConnectionInfo,
    shutdown: &CancellationToken,
) -> &'static str {
    let server = &snapshot.config.server;

    // The session loop runs in its own task; cutting the socket is the only
    // way to stop it once a polite disconnect has failed.
    let abort = CancellationToken::new();
    let _abort_on_exit = abort.clone().drop_guard();
    let stream = AbortableStream::new(stream, abort.clone());

    let running = tokio::select! {
        started = russh::server::run_stream(snapshot.ssh.clone(), stream, handler) => started,
        _ = shutdown.cancelled() => return "shutdown",
    };
    let running = match running {
        Ok(running) => running,
        Err(e) => {
            debug!(error = %e, "SSH handshake failed");
            return "error";
        }
    };
    let handle = running.handle();
    tokio::pin!(running);

    let session_deadline = optional_deadline(server.max_session_duration);
    let auth_deadline = async {
        tokio::time::sleep(Duration::from_secs(server.auth_timeout.clamp(10, 600))).await;
        if info.is_authenticated() {
            std::future::pending::<()>().await;
        }
    };

    let reason = tokio::select! {
        result = running.as_mut() => {
            return match result {
                Ok(()) => "closed",
                Err(e) => {
                    debug!(error = %e, "SSH session ended with error");
                    "error"
                }
            };
        }
        _ = session_deadline => "max_session_duration",
        _ = auth_deadline => "auth_timeout",
        _ = shutdown.cancelled() => "shutdown",
    };

    let _ = handle
        .disconnect(
            russh::Disconnect::ByApplication,
            String::new(),
            "en".to_string(),
        )
        .await;
    if tokio::time::timeout(DISCONNECT_GRACE, running.as_mut())
        .await
        .is_err()
    {
        debug!("Session did not stop within grace period, aborting transport");
        abort.cancel();
        if tokio::time::timeout(DISCONNECT_GRACE, running.as_mut())
            .await
            .is_err()
        {
            warn!("Session task still running after transport abort");
        }
    }
    reason
}

/// Sleep for `secs`, or forever when `secs` is 0.
fn optional_deadline(secs: u64) -> impl Future<Output = ()> {
    async move {
        if secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
    }
}

/// Re-read the config file and publish it. On failure the active snapshot is
/// kept; either way the outcome is audited.
pub fn reload(ctx: &AppContext, config_path: Option<&Path>) -> Result<Arc<Snapshot>, ConfigError> {
    let previous = ctx.store.current();
    let result = config::read_config_text(config_path)
        .and_then(|raw| ctx.store.load(&raw, &previous.data_dir));

    match &result {
        Ok(next) => {
            if next.listen_addresses != previous.listen_addresses {
                warn!(
                    old = ?previous.listen_addresses,
                    new = ?next.listen_addresses,
                    "Listen address changes take effect on restart"
                );
            }
            info!("Configuration reloaded successfully");
            ctx.audit.record(AuditEvent::config_reload(true, None));
        }
        Err(e) => {
            warn!(error = %e, "Failed to reload configuration, keeping previous");
            ctx.audit
                .record(AuditEvent::config_reload(false, Some(e.to_string())));
        }
    }
    ctx.metrics.record_config_reload(result.is_ok());
    result
}

#[cfg(unix)]
async fn handle_signals(
    ctx: Arc<AppContext>,
    config_path: Option<PathBuf>,
    shutdown: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown");
                shutdown.cancel();
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, initiating graceful shutdown");
                shutdown.cancel();
                return;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                let _ = reload(&ctx, config_path.as_deref());
            }
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(
    _ctx: Arc<AppContext>,
    _config_path: Option<PathBuf>,
    shutdown: CancellationToken,
) {
    if tokio::signal::ctrl_c().await.is_ok() {
        shutdown.cancel();
    }
}
