pub mod pubkey;

use crate::config::types::{AuthConfig, AuthPolicyKind, CredentialConfig};
use anyhow::{Context, Result};
use russh::keys::PublicKey;
use sha2::{Digest, Sha256};

/// What the peer presented, as seen by the policy.
#[derive(Debug, Clone, Copy)]
pub enum Attempt<'a> {
    None,
    Password(&'a str),
    PublicKey(&'a PublicKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
}

impl AuthDecision {
    pub fn accepted(self) -> bool {
        self == AuthDecision::Accept
    }
}

/// One configured credential with its key pre-parsed.
#[derive(Debug, Clone)]
struct Credential {
    username: String,
    password_digest: Option<[u8; 32]>,
    public_key: Option<PublicKey>,
}

/// Accepted credentials, parsed once per config snapshot.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    entries: Vec<Credential>,
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

impl Credentials {
    pub fn from_config(entries: &[CredentialConfig]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(entries.len());
        for entry in entries {
            let public_key = match entry.public_key.as_deref().map(str::trim) {
                Some(line) if !line.is_empty() => Some(
                    pubkey::parse_authorized_key(line)
                        .with_context(|| format!("credential for user '{}'", entry.username))?,
                ),
                _ => None,
            };
            parsed.push(Credential {
                username: entry.username.clone(),
                password_digest: entry
                    .password
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .map(digest),
                public_key,
            });
        }
        Ok(Self { entries: parsed })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A credential field left empty matches any presented value.
    pub fn matches(&self, username: &str, attempt: Attempt<'_>) -> bool {
        self.entries
            .iter()
            .filter(|c| c.username == username)
            .any(|c| match attempt {
                Attempt::None => c.password_digest.is_none() && c.public_key.is_none(),
                Attempt::Password(password) => match &c.password_digest {
                    // Compare digests so the comparison does not depend on password length.
                    Some(expected) => *expected == digest(password),
                    None => true,
                },
                Attempt::PublicKey(key) => match &c.public_key {
                    Some(expected) => expected == key,
                    None => true,
                },
            })
    }
}

/// Authentication policy for one config snapshot.
pub struct AuthPolicy<'a> {
    config: &'a AuthConfig,
    credentials: &'a Credentials,
}

impl<'a> AuthPolicy<'a> {
    pub fn new(config: &'a AuthConfig, credentials: &'a Credentials) -> Self {
        Self {
            config,
            credentials,
        }
    }

    fn method_enabled(&self, attempt: &Attempt<'_>) -> bool {
        match attempt {
            Attempt::None => self.config.no_auth,
            Attempt::Password(_) => self.config.password_auth,
            Attempt::PublicKey(_) => self.config.public_key_auth,
        }
    }

    /// Decide one attempt. `attempt_no` is 1-based and counts every attempt
    /// on the connection regardless of method.
    pub fn decide(&self, username: &str, attempt: Attempt<'_>, attempt_no: u32) -> AuthDecision {
        if !self.method_enabled(&attempt) {
            return AuthDecision::Reject;
        }
        let accept = match self.config.policy {
            AuthPolicyKind::AcceptAll => true,
            AuthPolicyKind::AcceptNone => false,
            AuthPolicyKind::Credentials => self.credentials.matches(username, attempt),
            AuthPolicyKind::DelayThenAccept => attempt_no > self.config.accept_after,
        };
        if accept {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject
        }
    }

    /// True once `rejected` failed attempts exhaust `max_tries`.
    pub fn tries_exhausted(&self, rejected: u32) -> bool {
        self.config.max_tries > 0 && rejected >= self.config.max_tries
    }
}
