use crate::audit::events::{AuditEvent, PresentedCredential};
use crate::auth::{pubkey, Attempt, AuthPolicy};
use crate::channel::sink::HandleSink;
use crate::channel::task::{run_channel, CHANNEL_QUEUE_CAPACITY};
use crate::channel::{ChannelContext, ChannelEmulator, ChannelEvent, ChannelKind};
use crate::config::types::{DirectTcpipPolicy, RemoteForwardPolicy};
use crate::config::Snapshot;
use crate::context::AppContext;
use crate::ssh::session::{ClientSession, ConnectionInfo, ConnectionState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Port range handed out when a peer asks the server to pick a forward port.
const FABRICATED_PORT_RANGE: std::ops::RangeInclusive<u32> = 32768..=60999;

struct ChannelEntry {
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

/// Per-connection SSH handler
pub struct SshHandler {
    ctx: Arc<AppContext>,
    snapshot: Arc<Snapshot>,
    info: Arc<ConnectionInfo>,
    session_state: ClientSession,
    channels: HashMap<ChannelId, ChannelEntry>,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl SshHandler {
    /// `snapshot` is pinned for the whole connection. Channel tasks are bound
    /// to child tokens of `cancel`.
    pub fn new(
        ctx: Arc<AppContext>,
        snapshot: Arc<Snapshot>,
        info: Arc<ConnectionInfo>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            snapshot,
            info,
            session_state: ClientSession::new(),
            channels: HashMap::new(),
            cancel,
            connected_at: Instant::now(),
        }
    }

    fn conn_id(&self) -> &str {
        &self.info.conn_id
    }

    /// Check if the SSH auth timeout has been exceeded (slow-client DoS protection).
    fn is_auth_timed_out(&self) -> bool {
        if self.session_state.authenticated() {
            return false;
        }
        let timeout_secs = self.snapshot.config.server.auth_timeout.clamp(10, 600);
        self.connected_at.elapsed() > Duration::from_secs(timeout_secs)
    }

    /// Run one authentication attempt through the policy, audit it, and turn
    /// the outcome into a transport reply.
    async fn authenticate(
        &mut self,
        username: &str,
        credential: PresentedCredential,
        attempt: Attempt<'_>,
    ) -> anyhow::Result<Auth> {
        let snapshot = self.snapshot.clone();
        let auth_config = &snapshot.config.auth;

        self.session_state.attempts += 1;
        let attempt_no = self.session_state.attempts;

        if auth_config.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(auth_config.response_delay_ms)).await;
        }

        let timed_out = self.is_auth_timed_out();
        let policy = AuthPolicy::new(auth_config, &snapshot.credentials);
        let accepted = !timed_out && policy.decide(username, attempt, attempt_no).accepted();

        self.ctx.audit.record(AuditEvent::auth_attempt(
            self.conn_id(),
            &self.info.peer,
            username,
            &credential,
            attempt_no,
            accepted,
        ));
        self.ctx
            .metrics
            .record_auth_attempt(credential.method(), accepted);

        if accepted {
            info!(
                conn_id = %self.conn_id(),
                user = %username,
                ip = %self.info.peer.ip(),
                method = credential.method(),
                attempt = attempt_no,
                accepted = true,
                "Auth accepted"
            );
            self.session_state.state = ConnectionState::Authenticated;
            self.session_state.username = Some(username.to_string());
            self.session_state.auth_method = credential.method().to_string();
            if let PresentedCredential::PublicKey { fingerprint, .. } = &credential {
                self.session_state.ssh_key_fingerprint = Some(fingerprint.clone());
            }
            self.info.set_username(username);
            return Ok(Auth::Accept);
        }

        self.session_state.rejected += 1;
        debug!(
            conn_id = %self.conn_id(),
            user = %username,
            method = credential.method(),
            attempt = attempt_no,
            timed_out,
            accepted = false,
            "Auth rejected"
        );

        if policy.tries_exhausted(self.session_state.rejected) {
            warn!(
                conn_id = %self.conn_id(),
                ip = %self.info.peer.ip(),
                rejected = self.session_state.rejected,
                "Max auth tries reached, closing connection"
            );
            self.info.set_close_reason("max_tries");
            anyhow::bail!("authentication attempts exhausted");
        }

        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    /// Whether another channel may be opened right now. Returns the refusal
    /// reason otherwise.
    fn admit_channel(&mut self) -> Result<(), &'static str> {
        if !self.session_state.state.accepts_channels() {
            return Err("not_authenticated");
        }
        self.channels.retain(|_, entry| !entry.tx.is_closed());
        let max = self.snapshot.config.server.max_channels_per_connection;
        if self.channels.len() >= max {
            warn!(
                conn_id = %self.conn_id(),
                max,
                "Max channels per connection exceeded"
            );
            return Err("max_channels");
        }
        Ok(())
    }

    fn audit_channel_open(
        &self,
        channel_id: ChannelId,
        kind: &str,
        accepted: bool,
        target: Option<String>,
        originator: Option<String>,
        reason: Option<&str>,
    ) {
        self.ctx.audit.record(AuditEvent::channel_open(
            self.conn_id(),
            u32::from(channel_id),
            kind,
            accepted,
            target,
            originator,
            reason,
        ));
        self.ctx.metrics.record_channel_open(kind, accepted);
    }

    /// Create the emulator and spawn its task plus a drain for the transport
    /// side of the channel.
    fn spawn_channel(&mut self, channel: Channel<Msg>, kind: ChannelKind, session: &Session) {
        let id = channel.id();
        let channel_id = u32::from(id);
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        let cancel = self.cancel.child_token();

        let ctx = ChannelContext {
            conn_id: self.info.conn_id.clone(),
            channel_id,
            username: self.session_state.username.clone().unwrap_or_default(),
            snapshot: self.snapshot.clone(),
            audit: self.ctx.audit.clone(),
            metrics: self.ctx.metrics.clone(),
        };
        let span = info_span!(
            "channel",
            conn_id = %self.info.conn_id,
            channel = channel_id,
            kind = kind.type_name()
        );
        let emulator = ChannelEmulator::new(ctx, kind);
        let sink = HandleSink::new(session.handle(), id);

        tokio::spawn(run_channel(emulator, rx, sink, cancel.clone()).instrument(span));
        tokio::spawn(drain_channel(channel, cancel.clone()));

        self.channels.insert(id, ChannelEntry { tx, cancel });
        self.session_state.state = ConnectionState::Serving;
    }

    /// Queue an event for a channel task. A full queue closes that channel
    /// only. Returns false when the event could not be delivered.
    fn forward_event(&mut self, id: ChannelId, event: ChannelEvent, session: &mut Session) -> bool {
        let Some(entry) = self.channels.get(&id) else {
            return false;
        };
        match entry.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    conn_id = %self.conn_id(),
                    channel = u32::from(id),
                    "Channel event queue full, closing channel"
                );
                entry.cancel.cancel();
                self.channels.remove(&id);
                let _ = session.close(id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.channels.remove(&id);
                false
            }
        }
    }

    /// Forward a channel request; refuse it when the channel is unknown.
    fn forward_request(&mut self, id: ChannelId, event: ChannelEvent, session: &mut Session) {
        if !self.forward_event(id, event, session) {
            let _ = session.channel_failure(id);
        }
    }

    /// Tear down every channel task. Idempotent.
    pub fn shutdown(&mut self) {
        if self.session_state.state == ConnectionState::Closed {
            return;
        }
        self.session_state.state = ConnectionState::Closing;
        for (_, entry) in self.channels.drain() {
            entry.cancel.cancel();
        }
        self.session_state.state = ConnectionState::Closed;
    }
}

/// Keep the transport side of a channel drained so a peer that floods one
/// channel cannot stall the connection. Payload is handled via callbacks.
async fn drain_channel(mut channel: Channel<Msg>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = channel.wait() => {
                if msg.is_none() {
                    break;
                }
            }
        }
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Test helper methods for inspecting SshHandler internal state.
/// These are always compiled to allow external integration/unit tests in tests/.
impl SshHandler {
    /// Test helper: get current total auth attempts
    pub fn total_auth_attempts(&self) -> u32 {
        self.session_state.attempts
    }

    /// Test helper: get number of live channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Test helper: check if session is authenticated
    pub fn is_authenticated(&self) -> bool {
        self.session_state.authenticated()
    }

    /// Test helper: get the session username
    pub fn session_username(&self) -> Option<&str> {
        self.session_state.username.as_deref()
    }

    /// Test helper: get the auth method
    pub fn auth_method(&self) -> &str {
        &self.session_state.auth_method
    }

    /// Test helper: get the ssh key fingerprint
    pub fn ssh_key_fingerprint(&self) -> Option<&str> {
        self.session_state.ssh_key_fingerprint.as_deref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session_state.state
    }

    /// Test helper: override the connected_at timestamp to simulate auth timeout
    pub fn set_connected_at(&mut self, instant: Instant) {
        self.connected_at = instant;
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        let banner = &self.snapshot.config.server.banner;
        if banner.is_empty() {
            Ok(None)
        } else {
            Ok(Some(banner.clone()))
        }
    }

    /// Clients send "none" first to learn the method list. Unless `no_auth` is
    /// on that request is not an attempt and never counts against `max_tries`.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if !self.snapshot.config.auth.no_auth {
            debug!(conn_id = %self.conn_id(), user = %user, "none method disabled");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }
        self.authenticate(user, PresentedCredential::None, Attempt::None)
            .await
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.authenticate(
            user,
            PresentedCredential::Password(password.to_string()),
            Attempt::Password(password),
        )
        .await
    }

    /// Key offers are always accepted so the client goes on to sign; only the
    /// signed attempt is audited and decided.
    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.snapshot.config.auth.public_key_auth {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let credential = PresentedCredential::PublicKey {
            fingerprint: pubkey::fingerprint(public_key),
            algorithm: pubkey::algorithm_name(public_key),
        };
        self.authenticate(user, credential, Attempt::PublicKey(public_key))
            .await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        if let Err(reason) = self.admit_channel() {
            self.audit_channel_open(id, "session", false, None, None, Some(reason));
            return Ok(false);
        }
        self.audit_channel_open(id, "session", true, None, None, None);
        self.spawn_channel(channel, ChannelKind::Session, session);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let target = format!("{}:{}", host_to_connect, port_to_connect);
        let originator = format!("{}:{}", originator_address, originator_port);

        if let Err(reason) = self.admit_channel() {
            self.audit_channel_open(
                id,
                "direct-tcpip",
                false,
                Some(target),
                Some(originator),
                Some(reason),
            );
            return Ok(false);
        }

        let accepted =
            self.snapshot.config.forwarding.direct_tcpip == DirectTcpipPolicy::Fabricate;
        self.ctx.audit.record(AuditEvent::forward_request(
            self.conn_id(),
            "direct-tcpip",
            host_to_connect,
            port_to_connect,
            accepted,
        ));
        self.ctx.metrics.record_forward("direct-tcpip", accepted);

        debug!(
            conn_id = %self.conn_id(),
            target = %target,
            originator = %originator,
            accepted,
            "direct-tcpip channel open"
        );

        if !accepted {
            self.audit_channel_open(
                id,
                "direct-tcpip",
                false,
                Some(target),
                Some(originator.clone()),
                Some("administratively_prohibited"),
            );
            return Ok(false);
        }

        self.audit_channel_open(
            id,
            "direct-tcpip",
            true,
            Some(target),
            Some(originator.clone()),
            None,
        );
        let kind = ChannelKind::DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator,
        };
        self.spawn_channel(channel, kind, session);
        Ok(true)
    }

    /// Clients have no business opening forwarded-tcpip channels.
    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.audit_channel_open(
            channel.id(),
            "forwarded-tcpip",
            false,
            Some(format!("{}:{}", host_to_connect, port_to_connect)),
            Some(format!("{}:{}", originator_address, originator_port)),
            Some("unsupported"),
        );
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.audit_channel_open(
            channel.id(),
            "x11",
            false,
            None,
            Some(format!("{}:{}", originator_address, originator_port)),
            Some("unsupported"),
        );
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let event = ChannelEvent::PtyRequest {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        };
        self.forward_request(channel, event, session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let event = ChannelEvent::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.forward_request(channel, event, session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let event = ChannelEvent::WindowChange {
            cols: col_width,
            rows: row_height,
        };
        self.forward_event(channel, event, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelEvent::Shell, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelEvent::Exec(data.to_vec()), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelEvent::Subsystem(name.to_string()), session);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelEvent::X11Request, session);
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward_event(channel, ChannelEvent::AgentRequest, session);
        Ok(false)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_event(channel, ChannelEvent::Data(data.to_vec()), session);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_event(channel, ChannelEvent::Eof, session);
        Ok(())
    }

    /// A close for an unknown or already-closed channel is a no-op.
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_event(channel, ChannelEvent::Close, session);
        self.channels.remove(&channel);
        Ok(())
    }

    /// Acknowledge remote forwarding without binding anything.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let accepted = self.session_state.authenticated()
            && self.snapshot.config.forwarding.remote_forward == RemoteForwardPolicy::Acknowledge;
        if accepted && *port == 0 {
            *port = rand::thread_rng().gen_range(FABRICATED_PORT_RANGE);
        }
        self.ctx.audit.record(AuditEvent::forward_request(
            self.conn_id(),
            "tcpip-forward",
            address,
            *port,
            accepted,
        ));
        self.ctx.metrics.record_forward("tcpip-forward", accepted);
        Ok(accepted)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let accepted = self.session_state.authenticated();
        self.ctx.audit.record(AuditEvent::forward_request(
            self.conn_id(),
            "cancel-tcpip-forward",
            address,
            port,
            accepted,
        ));
        self.ctx
            .metrics
            .record_forward("cancel-tcpip-forward", accepted);
        Ok(accepted)
    }
}
