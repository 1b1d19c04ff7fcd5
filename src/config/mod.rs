pub mod types;

use crate::auth::Credentials;
use crate::ssh::keys;
use russh::keys::PrivateKey;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use types::{AppConfig, AuthPolicyKind};

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: usize = 1_048_576;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config text too large: {0} bytes (max {max} bytes)", max = MAX_CONFIG_SIZE)]
    TooLarge(usize),
    #[error("parsing TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("data directory {}: {source}", .path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("host key {}: {reason}", .path.display())]
    HostKey { path: PathBuf, reason: String },
    #[error("reading config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Parse and validate configuration text. Empty text yields all defaults.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    if content.len() > MAX_CONFIG_SIZE {
        return Err(ConfigError::TooLarge(content.len()));
    }
    let config: AppConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Read a config file. A missing path means "no config file": empty text.
pub fn read_config_text(path: Option<&Path>) -> Result<String, ConfigError> {
    match path {
        None => Ok(String::new()),
        Some(path) => std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server(config)?;
    validate_auth(config)?;
    validate_shell(config)?;
    Ok(())
}

fn validate_server(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    for addr in server.resolved_listen_addresses() {
        validate_listen_address(&addr)?;
    }
    if !server.server_id.starts_with("SSH-2.0-") {
        return Err(invalid(format!(
            "server.server_id must start with 'SSH-2.0-' (got '{}')",
            server.server_id
        )));
    }
    if server.server_id.contains('\r') || server.server_id.contains('\n') {
        return Err(invalid("server.server_id must be a single line"));
    }
    if server.max_channels_per_connection == 0 {
        return Err(invalid("server.max_channels_per_connection must be >= 1"));
    }
    if server.host_keys.is_empty() {
        return Err(invalid("server.host_keys must list at least one key"));
    }
    Ok(())
}

fn validate_listen_address(addr: &str) -> Result<(), ConfigError> {
    if addr.trim().is_empty() {
        return Err(invalid("listen address must not be empty"));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid(format!("listen address '{addr}' is missing a port")))?;
    if host.is_empty() {
        return Err(invalid(format!("listen address '{addr}' is missing a host")));
    }
    port.parse::<u16>()
        .map_err(|_| invalid(format!("listen address '{addr}' has an invalid port")))?;
    Ok(())
}

fn validate_auth(config: &AppConfig) -> Result<(), ConfigError> {
    let auth = &config.auth;
    if auth.policy == AuthPolicyKind::Credentials && auth.credentials.is_empty() {
        return Err(invalid(
            "auth.policy = \"credentials\" requires at least one [[auth.credentials]] entry",
        ));
    }
    for cred in &auth.credentials {
        if cred.username.is_empty() {
            return Err(invalid("auth.credentials entry has empty username"));
        }
    }
    if !auth.password_auth && !auth.public_key_auth && !auth.no_auth {
        return Err(invalid("at least one authentication method must be enabled"));
    }
    Ok(())
}

fn validate_shell(config: &AppConfig) -> Result<(), ConfigError> {
    for (i, cmd) in config.shell.commands.iter().enumerate() {
        if cmd.prefix.trim().is_empty() {
            return Err(invalid(format!("shell.commands[{i}] has an empty prefix")));
        }
    }
    if config.shell.max_line_length == 0 {
        return Err(invalid("shell.max_line_length must be > 0"));
    }
    Ok(())
}

/// Immutable, fully-resolved configuration.
///
/// Built off to the side and published whole; connections pin the snapshot
/// current at their accept time.
#[derive(Debug)]
pub struct Snapshot {
    pub config: AppConfig,
    pub listen_addresses: Vec<String>,
    pub credentials: Credentials,
    pub ssh: Arc<russh::server::Config>,
    pub data_dir: PathBuf,
}

impl Snapshot {
    /// Parse, validate, resolve host key paths against `data_dir`, load or
    /// generate host keys, and build the transport config.
    pub fn build(raw: &str, data_dir: &Path) -> Result<Self, ConfigError> {
        let config = parse_config(raw)?;
        Self::from_config(config, data_dir)
    }

    pub fn from_config(config: AppConfig, data_dir: &Path) -> Result<Self, ConfigError> {
        validate_config(&config)?;
        std::fs::create_dir_all(data_dir).map_err(|source| ConfigError::DataDir {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let mut host_keys = Vec::with_capacity(config.server.host_keys.len());
        for path in &config.server.host_keys {
            let path = resolve_path(data_dir, path);
            let key = keys::load_or_generate_host_key(&path).map_err(|e| {
                ConfigError::HostKey {
                    path: path.clone(),
                    reason: format!("{e:#}"),
                }
            })?;
            host_keys.push(key);
        }

        let credentials =
            Credentials::from_config(&config.auth.credentials).map_err(|e| invalid(e.to_string()))?;
        let ssh = Arc::new(build_ssh_config(&config, host_keys));
        let listen_addresses = config.server.resolved_listen_addresses();

        Ok(Self {
            config,
            listen_addresses,
            credentials,
            ssh,
            data_dir: data_dir.to_path_buf(),
        })
    }
}

/// Relative paths resolve against the data directory.
pub fn resolve_path(data_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

fn build_ssh_config(config: &AppConfig, host_keys: Vec<PrivateKey>) -> russh::server::Config {
    let server = &config.server;
    let auth = &config.auth;

    let mut ssh_config = russh::server::Config::default();
    ssh_config.keys = host_keys;
    ssh_config.server_id = russh::SshId::Standard(server.server_id.clone());
    // Reply pacing is applied by the handler through `auth.response_delay_ms`.
    ssh_config.auth_rejection_time = Duration::ZERO;
    ssh_config.auth_rejection_time_initial = Some(Duration::ZERO);
    ssh_config.max_auth_attempts = if auth.max_tries > 0 {
        auth.max_tries as usize + 1
    } else {
        usize::MAX
    };

    let mut methods = Vec::new();
    if auth.password_auth {
        methods.push(russh::MethodKind::Password);
    }
    if auth.public_key_auth {
        methods.push(russh::MethodKind::PublicKey);
    }
    if auth.no_auth {
        methods.push(russh::MethodKind::None);
    }
    ssh_config.methods = russh::MethodSet::from(methods.as_slice());

    if server.idle_timeout > 0 {
        ssh_config.inactivity_timeout = Some(Duration::from_secs(server.idle_timeout));
    }

    // keepalive@openssh.com requests detect dead peers; unanswered ones close the link.
    if server.keepalive_interval_secs > 0 {
        ssh_config.keepalive_interval = Some(Duration::from_secs(server.keepalive_interval_secs));
        ssh_config.keepalive_max = server.keepalive_max as usize;
    }

    ssh_config
}

/// Process-wide holder of the current snapshot.
///
/// Readers clone the `Arc` once; reload swaps it under a write lock held only
/// for the pointer store.
pub struct ConfigStore {
    current: RwLock<Arc<Snapshot>>,
}

impl ConfigStore {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Initial load. Failure here is a startup error.
    pub fn from_text(raw: &str, data_dir: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(Snapshot::build(raw, data_dir)?))
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Build a new snapshot and publish it. On error the active snapshot is
    /// left untouched.
    pub fn load(&self, raw: &str, data_dir: &Path) -> Result<Arc<Snapshot>, ConfigError> {
        let next = Arc::new(Snapshot::build(raw, data_dir)?);
        self.publish(next.clone());
        Ok(next)
    }

    fn publish(&self, next: Arc<Snapshot>) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
    }
}
