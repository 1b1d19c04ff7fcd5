use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Log level enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log format enum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// How authentication attempts are answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPolicyKind {
    /// Every attempt with an enabled method succeeds.
    #[default]
    AcceptAll,
    /// Every attempt fails.
    AcceptNone,
    /// Only attempts matching `[[auth.credentials]]` succeed.
    Credentials,
    /// The first `accept_after` attempts fail, the next one succeeds.
    DelayThenAccept,
}

impl fmt::Display for AuthPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPolicyKind::AcceptAll => write!(f, "accept-all"),
            AuthPolicyKind::AcceptNone => write!(f, "accept-none"),
            AuthPolicyKind::Credentials => write!(f, "credentials"),
            AuthPolicyKind::DelayThenAccept => write!(f, "delay-then-accept"),
        }
    }
}

/// Command table matching precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    /// The longest entry whose tokens prefix the command line wins.
    #[default]
    LongestPrefix,
    /// Only an entry equal to the whole (whitespace-normalized) line matches.
    Exact,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::LongestPrefix => write!(f, "longest-prefix"),
            MatchMode::Exact => write!(f, "exact"),
        }
    }
}

/// Policy for client-requested outbound (`direct-tcpip`) channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectTcpipPolicy {
    /// Reply open-failure (administratively prohibited).
    #[default]
    Reject,
    /// Accept the channel and play a fabricated peer. No socket is opened.
    Fabricate,
}

/// Policy for `tcpip-forward` global requests (ssh -R).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteForwardPolicy {
    /// Reply success without binding anything.
    #[default]
    Acknowledge,
    Reject,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub shell: ShellConfig,
    pub subsystems: SubsystemConfig,
    pub forwarding: ForwardingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Single listen address, kept for older config files.
    pub listen_address: String,
    /// Takes precedence over `listen_address` when non-empty.
    pub listen_addresses: Vec<String>,
    /// Host key files. Relative paths are resolved against the data directory.
    pub host_keys: Vec<PathBuf>,
    pub server_id: String,
    /// Pre-authentication banner; empty disables it.
    pub banner: String,
    /// Seconds without traffic before the transport is closed (0 = disabled).
    pub idle_timeout: u64,
    /// Hard cap on a connection's lifetime in seconds (0 = disabled).
    pub max_session_duration: u64,
    /// Seconds allowed to complete authentication. Range: 10-600.
    pub auth_timeout: u64,
    pub max_channels_per_connection: usize,
    pub keepalive_interval_secs: u64,
    pub keepalive_max: u32,
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:2022".to_string(),
            listen_addresses: Vec::new(),
            host_keys: vec![PathBuf::from("host_ed25519_key")],
            server_id: "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6".to_string(),
            banner: String::new(),
            idle_timeout: 600,
            max_session_duration: 3600,
            auth_timeout: 60,
            max_channels_per_connection: 10,
            keepalive_interval_secs: 15,
            keepalive_max: 3,
            shutdown_timeout: 5,
        }
    }
}

impl ServerConfig {
    /// Effective listen addresses: `listen_addresses` when set, otherwise the
    /// legacy `listen_address` as a single entry.
    pub fn resolved_listen_addresses(&self) -> Vec<String> {
        if self.listen_addresses.is_empty() {
            vec![self.listen_address.clone()]
        } else {
            self.listen_addresses.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub policy: AuthPolicyKind,
    /// Rejected attempts before the connection is dropped (0 = unlimited).
    pub max_tries: u32,
    /// Rejections before acceptance under `delay-then-accept`.
    pub accept_after: u32,
    pub response_delay_ms: u64,
    pub no_auth: bool,
    pub password_auth: bool,
    pub public_key_auth: bool,
    pub credentials: Vec<CredentialConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            policy: AuthPolicyKind::AcceptAll,
            max_tries: 0,
            accept_after: 2,
            response_delay_ms: 0,
            no_auth: false,
            password_auth: true,
            public_key_auth: true,
            credentials: Vec::new(),
        }
    }
}

/// One accepted credential. A missing password or key matches any value
/// presented for that method.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CredentialConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// OpenSSH authorized_keys line.
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShellConfig {
    pub hostname: String,
    pub match_mode: MatchMode,
    pub not_found_exit_status: u32,
    /// Report an exit-status after every interactive line.
    pub line_exit_status: bool,
    pub max_line_length: usize,
    pub commands: Vec<CommandConfig>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            hostname: "server".to_string(),
            match_mode: MatchMode::LongestPrefix,
            not_found_exit_status: 127,
            line_exit_status: true,
            max_line_length: 4096,
            commands: Vec::new(),
        }
    }
}

/// Fabricated response for a command-line prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandConfig {
    pub prefix: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_status: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubsystemConfig {
    pub allowed: Vec<String>,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        Self {
            allowed: vec!["sftp".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    pub direct_tcpip: DirectTcpipPolicy,
    pub remote_forward: RemoteForwardPolicy,
    /// Bytes of forwarded payload copied into audit events per channel.
    pub max_capture_bytes: usize,
    pub services: Vec<ServiceConfig>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            direct_tcpip: DirectTcpipPolicy::Reject,
            remote_forward: RemoteForwardPolicy::Acknowledge,
            max_capture_bytes: 1024,
            services: Vec::new(),
        }
    }
}

impl ForwardingConfig {
    pub fn service_response(&self, port: u32) -> Option<&str> {
        self.services
            .iter()
            .find(|s| u32::from(s.port) == port)
            .map(|s| s.response.as_str())
    }
}

/// Fabricated peer behind a forwarded port.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub port: u16,
    #[serde(default)]
    pub response: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub audit_log_path: Option<PathBuf>,
    pub audit_max_size_mb: u64,
    pub audit_max_files: u32,
    /// Emit every audit event through the tracing subscriber.
    pub audit_console: bool,
    /// HTTP endpoint receiving audit events as JSON.
    pub collector_url: Option<String>,
    /// Serve Prometheus metrics on this address when set.
    pub metrics_address: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            audit_log_path: None,
            audit_max_size_mb: 100,
            audit_max_files: 5,
            audit_console: true,
            collector_url: None,
            metrics_address: None,
        }
    }
}
