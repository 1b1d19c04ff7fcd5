use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Lifecycle of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticating,
    Authenticated,
    /// At least one channel has been opened.
    Serving,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Serving => "serving",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn accepts_channels(self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticated | ConnectionState::Serving
        )
    }
}

/// Per-client session state tracking
#[derive(Debug)]
pub struct ClientSession {
    pub state: ConnectionState,
    pub username: Option<String>,
    pub auth_method: String,
    pub ssh_key_fingerprint: Option<String>,
    /// Every auth callback, accepted or not.
    pub attempts: u32,
    pub rejected: u32,
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Authenticating,
            username: None,
            auth_method: String::new(),
            ssh_key_fingerprint: None,
            attempts: 0,
            rejected: 0,
        }
    }

    pub fn authenticated(&self) -> bool {
        !matches!(self.state, ConnectionState::Authenticating)
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Facts about a connection shared between its handler and the task running
/// it, so the disconnect record can be written after the handler is gone.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub conn_id: String,
    pub peer: SocketAddr,
    pub started: Instant,
    username: OnceLock<String>,
    close_reason: Mutex<Option<&'static str>>,
}

impl ConnectionInfo {
    pub fn new(conn_id: String, peer: SocketAddr) -> Self {
        Self {
            conn_id,
            peer,
            started: Instant::now(),
            username: OnceLock::new(),
            close_reason: Mutex::new(None),
        }
    }

    /// Record the authenticated user. Only the first call has an effect.
    pub fn set_username(&self, username: &str) {
        let _ = self.username.set(username.to_string());
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.get().is_some()
    }

    /// Remember why the connection is ending. The first reason wins.
    pub fn set_close_reason(&self, reason: &'static str) {
        let mut guard = self.close_reason.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        *self.close_reason.lock().unwrap_or_else(|p| p.into_inner())
    }
}
