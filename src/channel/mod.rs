//! Per-channel state machine.
//!
//! A `ChannelEmulator` turns SSH channel callbacks into protocol replies. It
//! never touches the network itself: `handle` returns the actions to send and
//! the channel task applies them through a [`sink::ChannelSink`]. Audit events
//! are recorded inside `handle`, so they always precede the reply.

pub mod forward;
pub mod sink;
pub mod task;

use crate::audit::events::AuditEvent;
use crate::audit::AuditLogger;
use crate::config::Snapshot;
use crate::metrics::MetricsRegistry;
use crate::shell::sftp::SftpServer;
use crate::shell::terminal::{LineEditor, LineEvent};
use crate::shell::{CommandOutput, Resolution, Shell};
use forward::ForwardCapture;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Environment variables recorded per channel before `env` is refused.
pub const MAX_ENV_VARS: usize = 64;

/// Everything a channel needs from its connection, cloned once at open time.
#[derive(Clone)]
pub struct ChannelContext {
    pub conn_id: String,
    pub channel_id: u32,
    pub username: String,
    pub snapshot: Arc<Snapshot>,
    pub audit: Arc<AuditLogger>,
    pub metrics: Arc<MetricsRegistry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        originator: String,
    },
}

impl ChannelKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// Input to the emulator, in the order the peer sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    PtyRequest { term: String, cols: u32, rows: u32 },
    Env { name: String, value: String },
    WindowChange { cols: u32, rows: u32 },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    X11Request,
    AgentRequest,
    Data(Vec<u8>),
    Eof,
    Close,
}

/// Output of the emulator: one SSH message to send on this channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    Success,
    Failure,
    Data(Vec<u8>),
    /// stderr
    ExtendedData(Vec<u8>),
    ExitStatus(u32),
    Eof,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveMode {
    Shell,
    Exec,
    Sftp,
    /// An allowed subsystem without a fabricated implementation: input is
    /// swallowed.
    Subsystem,
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opened,
    AwaitingRequest,
    Active(ActiveMode),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyInfo {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

pub struct ChannelEmulator {
    ctx: ChannelContext,
    kind: ChannelKind,
    state: ChannelState,
    pty: Option<PtyInfo>,
    env: Vec<(String, String)>,
    shell: Option<Shell>,
    editor: LineEditor,
    sftp: Option<SftpServer>,
    forward: Option<ForwardCapture>,
    bytes_received: u64,
    close_sent: bool,
}

impl ChannelEmulator {
    pub fn new(ctx: ChannelContext, kind: ChannelKind) -> Self {
        let max_line = ctx.snapshot.config.shell.max_line_length;
        Self {
            ctx,
            kind,
            state: ChannelState::Opened,
            pty: None,
            env: Vec::new(),
            shell: None,
            editor: LineEditor::new(false, max_line),
            sftp: None,
            forward: None,
            bytes_received: 0,
            close_sent: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn pty(&self) -> Option<&PtyInfo> {
        self.pty.as_ref()
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Leave `Opened`. Returns what to send right after the open confirmation.
    pub fn start(&mut self) -> Vec<ChannelAction> {
        if self.state != ChannelState::Opened {
            return Vec::new();
        }
        match &self.kind {
            ChannelKind::Session => {
                self.state = ChannelState::AwaitingRequest;
                Vec::new()
            }
            ChannelKind::DirectTcpip { port, .. } => {
                let forwarding = &self.ctx.snapshot.config.forwarding;
                let mut capture = ForwardCapture::new(
                    forwarding.service_response(*port),
                    forwarding.max_capture_bytes,
                );
                let mut actions = Vec::new();
                if let Some(response) = capture.take_response() {
                    actions.push(ChannelAction::Data(response));
                }
                self.forward = Some(capture);
                self.state = ChannelState::Active(ActiveMode::Forward);
                actions
            }
        }
    }

    /// Process one event. Events after `Closed` are ignored.
    pub fn handle(&mut self, event: ChannelEvent) -> Vec<ChannelAction> {
        if self.is_closed() {
            return Vec::new();
        }
        if self.state == ChannelState::Opened {
            let mut actions = self.start();
            actions.extend(self.dispatch(event));
            return actions;
        }
        self.dispatch(event)
    }

    /// Mark the channel closed without sending anything. Used when the
    /// connection is torn down under the channel.
    pub fn abort(&mut self) {
        if !self.is_closed() {
            self.mark_closed();
        }
    }

    fn dispatch(&mut self, event: ChannelEvent) -> Vec<ChannelAction> {
        match event {
            ChannelEvent::PtyRequest { term, cols, rows } => self.on_pty(term, cols, rows),
            ChannelEvent::Env { name, value } => self.on_env(name, value),
            ChannelEvent::WindowChange { cols, rows } => self.on_window_change(cols, rows),
            ChannelEvent::Shell => self.on_shell(),
            ChannelEvent::Exec(command) => self.on_exec(&command),
            ChannelEvent::Subsystem(name) => self.on_subsystem(&name),
            ChannelEvent::X11Request => {
                self.audit_request("x11-req", false, serde_json::Value::Null);
                vec![ChannelAction::Failure]
            }
            // The transport answers agent requests itself from the handler's
            // return value; only the audit happens here.
            ChannelEvent::AgentRequest => {
                self.audit_request("auth-agent-req", false, serde_json::Value::Null);
                Vec::new()
            }
            ChannelEvent::Data(bytes) => self.on_data(&bytes),
            ChannelEvent::Eof => self.on_eof(),
            ChannelEvent::Close => self.on_close(),
        }
    }

    fn is_session(&self) -> bool {
        self.kind == ChannelKind::Session
    }

    fn audit_request(&self, request_type: &str, accepted: bool, payload: serde_json::Value) {
        self.ctx.audit.record(AuditEvent::channel_request(
            &self.ctx.conn_id,
            self.ctx.channel_id,
            request_type,
            accepted,
            payload,
        ));
        self.ctx.metrics.record_channel_request(request_type, accepted);
    }

    fn reply(accepted: bool) -> Vec<ChannelAction> {
        if accepted {
            vec![ChannelAction::Success]
        } else {
            vec![ChannelAction::Failure]
        }
    }

    fn on_pty(&mut self, term: String, cols: u32, rows: u32) -> Vec<ChannelAction> {
        let accepted = self.is_session();
        self.audit_request(
            "pty-req",
            accepted,
            json!({ "term": term, "cols": cols, "rows": rows }),
        );
        if accepted {
            self.pty = Some(PtyInfo { term, cols, rows });
            self.editor.set_echo(true);
        }
        Self::reply(accepted)
    }

    fn on_env(&mut self, name: String, value: String) -> Vec<ChannelAction> {
        let accepted = self.is_session() && self.env.len() < MAX_ENV_VARS;
        self.audit_request("env", accepted, json!({ "name": name, "value": value }));
        if accepted {
            self.env.push((name, value));
        }
        Self::reply(accepted)
    }

    fn on_window_change(&mut self, cols: u32, rows: u32) -> Vec<ChannelAction> {
        let accepted = self.pty.is_some();
        self.audit_request("window-change", accepted, json!({ "cols": cols, "rows": rows }));
        if let Some(pty) = self.pty.as_mut() {
            pty.cols = cols;
            pty.rows = rows;
        }
        // window-change never wants a reply
        Vec::new()
    }

    fn can_start_program(&self) -> bool {
        self.is_session() && self.state == ChannelState::AwaitingRequest
    }

    fn on_shell(&mut self) -> Vec<ChannelAction> {
        let accepted = self.can_start_program();
        self.audit_request("shell", accepted, serde_json::Value::Null);
        if !accepted {
            return vec![ChannelAction::Failure];
        }
        let shell = Shell::new(&self.ctx.snapshot.config.shell, &self.ctx.username);
        let mut actions = vec![ChannelAction::Success];
        if self.pty.is_some() {
            actions.push(ChannelAction::Data(shell.prompt().into_bytes()));
        }
        self.shell = Some(shell);
        self.state = ChannelState::Active(ActiveMode::Shell);
        actions
    }

    fn on_exec(&mut self, raw: &[u8]) -> Vec<ChannelAction> {
        let command = String::from_utf8_lossy(raw).into_owned();
        if !self.can_start_program() {
            self.audit_request("exec", false, json!({ "command": command }));
            return vec![ChannelAction::Failure];
        }
        self.ctx.metrics.record_channel_request("exec", true);
        self.state = ChannelState::Active(ActiveMode::Exec);

        let shell = Shell::new(&self.ctx.snapshot.config.shell, &self.ctx.username);
        let output = shell.run_line(&command);
        self.ctx.audit.record(AuditEvent::exec_request(
            &self.ctx.conn_id,
            self.ctx.channel_id,
            &command,
            output.matched_rule.clone(),
            output.exit_status,
        ));
        self.ctx
            .metrics
            .record_command("exec", output.resolution.as_str());
        debug!(
            conn_id = %self.ctx.conn_id,
            channel = self.ctx.channel_id,
            command = %command,
            resolution = output.resolution.as_str(),
            "exec"
        );

        let mut actions = vec![ChannelAction::Success];
        self.push_output(&mut actions, &output);
        self.finish(&mut actions, output.exit_status);
        actions
    }

    fn on_subsystem(&mut self, name: &str) -> Vec<ChannelAction> {
        let allowed = self
            .ctx
            .snapshot
            .config
            .subsystems
            .allowed
            .iter()
            .any(|s| s == name);
        let accepted = allowed && self.can_start_program();
        self.ctx.audit.record(AuditEvent::subsystem_request(
            &self.ctx.conn_id,
            self.ctx.channel_id,
            name,
            accepted,
        ));
        self.ctx.metrics.record_subsystem(name, accepted);
        if !accepted {
            return vec![ChannelAction::Failure];
        }
        if name == "sftp" {
            self.sftp = Some(SftpServer::new());
            self.state = ChannelState::Active(ActiveMode::Sftp);
        } else {
            self.state = ChannelState::Active(ActiveMode::Subsystem);
        }
        vec![ChannelAction::Success]
    }

    fn on_data(&mut self, bytes: &[u8]) -> Vec<ChannelAction> {
        self.bytes_received += bytes.len() as u64;
        match self.state {
            ChannelState::Active(ActiveMode::Shell) => self.shell_input(bytes),
            ChannelState::Active(ActiveMode::Sftp) => self.sftp_input(bytes),
            ChannelState::Active(ActiveMode::Forward) => {
                if let Some(sample) = self.forward.as_mut().and_then(|f| f.capture(bytes)) {
                    self.ctx.audit.record(AuditEvent::channel_data(
                        &self.ctx.conn_id,
                        self.ctx.channel_id,
                        &sample.bytes,
                        sample.truncated,
                    ));
                }
                Vec::new()
            }
            // Input before a program was started, after exec, or for an
            // opaque subsystem goes nowhere.
            _ => Vec::new(),
        }
    }

    fn shell_input(&mut self, bytes: &[u8]) -> Vec<ChannelAction> {
        let (echo, events) = self.editor.feed(bytes);
        let mut actions = Vec::new();
        if !echo.is_empty() {
            actions.push(ChannelAction::Data(echo));
        }
        for event in events {
            match event {
                LineEvent::Line(line) => {
                    self.run_shell_line(&line, &mut actions);
                }
                LineEvent::Interrupt => self.push_prompt(&mut actions),
                LineEvent::Eof => self.finish(&mut actions, 0),
            }
            if self.is_closed() {
                break;
            }
        }
        actions
    }

    fn run_shell_line(&mut self, line: &str, actions: &mut Vec<ChannelAction>) {
        let Some(shell) = self.shell.as_ref() else {
            return;
        };
        let output = shell.run_line(line);
        if output.resolution == Resolution::Empty {
            self.push_prompt(actions);
            return;
        }
        self.ctx.audit.record(AuditEvent::shell_input(
            &self.ctx.conn_id,
            self.ctx.channel_id,
            line,
            output.matched_rule.clone(),
            output.exit_status,
        ));
        self.ctx
            .metrics
            .record_command("shell", output.resolution.as_str());

        self.push_output(actions, &output);
        if output.exit_requested {
            self.finish(actions, output.exit_status);
            return;
        }
        if self.ctx.snapshot.config.shell.line_exit_status {
            actions.push(ChannelAction::ExitStatus(output.exit_status));
        }
        self.push_prompt(actions);
    }

    fn sftp_input(&mut self, bytes: &[u8]) -> Vec<ChannelAction> {
        let Some(sftp) = self.sftp.as_mut() else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let batch = sftp.feed(bytes);
        for reply in batch.replies {
            if reply.request.operation != "init" {
                self.ctx.audit.record(AuditEvent::sftp_request(
                    &self.ctx.conn_id,
                    self.ctx.channel_id,
                    reply.request.operation,
                    reply.request.path.clone(),
                ));
            }
            actions.push(ChannelAction::Data(reply.response));
        }
        if let Some(e) = batch.error {
            debug!(
                conn_id = %self.ctx.conn_id,
                channel = self.ctx.channel_id,
                error = %e,
                "sftp stream rejected"
            );
            self.send_close(&mut actions);
        }
        actions
    }

    fn on_eof(&mut self) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        match self.state {
            ChannelState::Active(ActiveMode::Shell)
            | ChannelState::Active(ActiveMode::Sftp)
            | ChannelState::Active(ActiveMode::Subsystem) => self.finish(&mut actions, 0),
            ChannelState::Active(ActiveMode::Forward) => {
                actions.push(ChannelAction::Eof);
                self.send_close(&mut actions);
            }
            // Wait for the peer's close.
            _ => {}
        }
        actions
    }

    fn on_close(&mut self) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        self.send_close(&mut actions);
        actions
    }

    /// exit-status, eof, close.
    fn finish(&mut self, actions: &mut Vec<ChannelAction>, exit_status: u32) {
        actions.push(ChannelAction::ExitStatus(exit_status));
        actions.push(ChannelAction::Eof);
        self.send_close(actions);
    }

    fn send_close(&mut self, actions: &mut Vec<ChannelAction>) {
        if !self.close_sent {
            self.close_sent = true;
            actions.push(ChannelAction::Close);
        }
        self.mark_closed();
    }

    fn mark_closed(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = ChannelState::Closed;
        self.ctx.audit.record(AuditEvent::channel_close(
            &self.ctx.conn_id,
            self.ctx.channel_id,
            self.bytes_received,
        ));
    }

    fn push_prompt(&self, actions: &mut Vec<ChannelAction>) {
        if self.pty.is_none() {
            return;
        }
        if let Some(shell) = self.shell.as_ref() {
            actions.push(ChannelAction::Data(shell.prompt().into_bytes()));
        }
    }

    /// With a pty everything goes to the data stream with CRLF line endings;
    /// without one stderr goes to extended data.
    fn push_output(&self, actions: &mut Vec<ChannelAction>, output: &CommandOutput) {
        if self.pty.is_some() {
            let mut text = output.stdout.clone();
            text.push_str(&output.stderr);
            if !text.is_empty() {
                actions.push(ChannelAction::Data(to_crlf(&text)));
            }
            return;
        }
        if !output.stdout.is_empty() {
            actions.push(ChannelAction::Data(output.stdout.as_bytes().to_vec()));
        }
        if !output.stderr.is_empty() {
            actions.push(ChannelAction::ExtendedData(output.stderr.as_bytes().to_vec()));
        }
    }
}

/// Convert bare `\n` to `\r\n`, leaving existing `\r\n` alone.
pub fn to_crlf(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 8);
    let mut prev = 0u8;
    for &b in text.as_bytes() {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}
