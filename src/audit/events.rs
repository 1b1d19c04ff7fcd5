use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    #[serde(rename = "connection.new")]
    ConnectionNew {
        timestamp: DateTime<Utc>,
        conn_id: String,
        source_ip: String,
        source_port: u16,
        local_addr: String,
    },
    #[serde(rename = "auth.attempt")]
    AuthAttempt {
        timestamp: DateTime<Utc>,
        conn_id: String,
        source_ip: String,
        username: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_fingerprint: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_algorithm: Option<String>,
        attempt: u32,
        accepted: bool,
    },
    #[serde(rename = "channel.open")]
    ChannelOpen {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        channel_type: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        originator: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "channel.request")]
    ChannelRequest {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        request_type: String,
        accepted: bool,
        #[serde(skip_serializing_if = "serde_json::Value::is_null")]
        payload: serde_json::Value,
    },
    #[serde(rename = "exec.request")]
    ExecRequest {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        matched_rule: Option<String>,
        exit_status: u32,
    },
    #[serde(rename = "shell.input")]
    ShellInput {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        line: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        matched_rule: Option<String>,
        exit_status: u32,
    },
    #[serde(rename = "subsystem.request")]
    SubsystemRequest {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        name: String,
        accepted: bool,
    },
    #[serde(rename = "sftp.request")]
    SftpRequest {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        operation: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    #[serde(rename = "forward.request")]
    ForwardRequest {
        timestamp: DateTime<Utc>,
        conn_id: String,
        kind: String,
        host: String,
        port: u32,
        accepted: bool,
    },
    #[serde(rename = "channel.data")]
    ChannelData {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        /// Lossy UTF-8 rendering of the captured bytes
        payload: String,
        payload_b64: String,
        truncated: bool,
    },
    #[serde(rename = "channel.close")]
    ChannelClose {
        timestamp: DateTime<Utc>,
        conn_id: String,
        channel_id: u32,
        bytes_received: u64,
    },
    #[serde(rename = "disconnect")]
    Disconnect {
        timestamp: DateTime<Utc>,
        conn_id: String,
        source_ip: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        reason: String,
        duration_ms: u64,
    },
    #[serde(rename = "config.reload")]
    ConfigReload {
        timestamp: DateTime<Utc>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Credential presented in an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentedCredential {
    None,
    Password(String),
    PublicKey {
        fingerprint: String,
        algorithm: String,
    },
}

impl PresentedCredential {
    pub fn method(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Password(_) => "password",
            Self::PublicKey { .. } => "publickey",
        }
    }
}

impl AuditEvent {
    pub fn connection_new(conn_id: &str, source: &SocketAddr, local: &SocketAddr) -> Self {
        Self::ConnectionNew {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            source_ip: source.ip().to_string(),
            source_port: source.port(),
            local_addr: local.to_string(),
        }
    }

    pub fn auth_attempt(
        conn_id: &str,
        source: &SocketAddr,
        username: &str,
        credential: &PresentedCredential,
        attempt: u32,
        accepted: bool,
    ) -> Self {
        let (password, key_fingerprint, key_algorithm) = match credential {
            PresentedCredential::None => (None, None, None),
            PresentedCredential::Password(p) => (Some(p.clone()), None, None),
            PresentedCredential::PublicKey {
                fingerprint,
                algorithm,
            } => (None, Some(fingerprint.clone()), Some(algorithm.clone())),
        };
        Self::AuthAttempt {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            source_ip: source.ip().to_string(),
            username: username.to_string(),
            method: credential.method().to_string(),
            password,
            key_fingerprint,
            key_algorithm,
            attempt,
            accepted,
        }
    }

    pub fn channel_open(
        conn_id: &str,
        channel_id: u32,
        channel_type: &str,
        accepted: bool,
        target: Option<String>,
        originator: Option<String>,
        reason: Option<&str>,
    ) -> Self {
        Self::ChannelOpen {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            channel_type: channel_type.to_string(),
            accepted,
            target,
            originator,
            reason: reason.map(str::to_string),
        }
    }

    pub fn channel_request(
        conn_id: &str,
        channel_id: u32,
        request_type: &str,
        accepted: bool,
        payload: serde_json::Value,
    ) -> Self {
        Self::ChannelRequest {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            request_type: request_type.to_string(),
            accepted,
            payload,
        }
    }

    pub fn exec_request(
        conn_id: &str,
        channel_id: u32,
        command: &str,
        matched_rule: Option<String>,
        exit_status: u32,
    ) -> Self {
        Self::ExecRequest {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            command: command.to_string(),
            matched_rule,
            exit_status,
        }
    }

    pub fn shell_input(
        conn_id: &str,
        channel_id: u32,
        line: &str,
        matched_rule: Option<String>,
        exit_status: u32,
    ) -> Self {
        Self::ShellInput {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            line: line.to_string(),
            matched_rule,
            exit_status,
        }
    }

    pub fn subsystem_request(conn_id: &str, channel_id: u32, name: &str, accepted: bool) -> Self {
        Self::SubsystemRequest {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            name: name.to_string(),
            accepted,
        }
    }

    pub fn sftp_request(
        conn_id: &str,
        channel_id: u32,
        operation: &str,
        path: Option<String>,
    ) -> Self {
        Self::SftpRequest {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            operation: operation.to_string(),
            path,
        }
    }

    pub fn forward_request(conn_id: &str, kind: &str, host: &str, port: u32, accepted: bool) -> Self {
        Self::ForwardRequest {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            kind: kind.to_string(),
            host: host.to_string(),
            port,
            accepted,
        }
    }

    pub fn channel_data(conn_id: &str, channel_id: u32, sample: &[u8], truncated: bool) -> Self {
        use base64::Engine;
        Self::ChannelData {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            payload: String::from_utf8_lossy(sample).into_owned(),
            payload_b64: base64::engine::general_purpose::STANDARD.encode(sample),
            truncated,
        }
    }

    pub fn channel_close(conn_id: &str, channel_id: u32, bytes_received: u64) -> Self {
        Self::ChannelClose {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            channel_id,
            bytes_received,
        }
    }

    pub fn disconnect(
        conn_id: &str,
        source: &SocketAddr,
        username: Option<String>,
        reason: &str,
        duration_ms: u64,
    ) -> Self {
        Self::Disconnect {
            timestamp: Utc::now(),
            conn_id: conn_id.to_string(),
            source_ip: source.ip().to_string(),
            username,
            reason: reason.to_string(),
            duration_ms,
        }
    }

    pub fn config_reload(success: bool, error: Option<String>) -> Self {
        Self::ConfigReload {
            timestamp: Utc::now(),
            success,
            error,
        }
    }

    /// Returns the event type string used for routing and metrics labels.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionNew { .. } => "connection.new",
            Self::AuthAttempt { .. } => "auth.attempt",
            Self::ChannelOpen { .. } => "channel.open",
            Self::ChannelRequest { .. } => "channel.request",
            Self::ExecRequest { .. } => "exec.request",
            Self::ShellInput { .. } => "shell.input",
            Self::SubsystemRequest { .. } => "subsystem.request",
            Self::SftpRequest { .. } => "sftp.request",
            Self::ForwardRequest { .. } => "forward.request",
            Self::ChannelData { .. } => "channel.data",
            Self::ChannelClose { .. } => "channel.close",
            Self::Disconnect { .. } => "disconnect",
            Self::ConfigReload { .. } => "config.reload",
        }
    }

    /// Connection this event belongs to, if any.
    pub fn conn_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionNew { conn_id, .. }
            | Self::AuthAttempt { conn_id, .. }
            | Self::ChannelOpen { conn_id, .. }
            | Self::ChannelRequest { conn_id, .. }
            | Self::ExecRequest { conn_id, .. }
            | Self::ShellInput { conn_id, .. }
            | Self::SubsystemRequest { conn_id, .. }
            | Self::SftpRequest { conn_id, .. }
            | Self::ForwardRequest { conn_id, .. }
            | Self::ChannelData { conn_id, .. }
            | Self::ChannelClose { conn_id, .. }
            | Self::Disconnect { conn_id, .. } => Some(conn_id),
            Self::ConfigReload { .. } => None,
        }
    }
}
