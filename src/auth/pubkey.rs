use anyhow::Result;
use russh::keys::{HashAlg, PublicKey};

/// Parse an OpenSSH authorized_keys line (`<type> <base64> [comment]`) into a PublicKey
pub fn parse_authorized_key(line: &str) -> Result<PublicKey> {
    let key = russh::keys::parse_public_key_base64(
        line.split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow::anyhow!("invalid authorized_key format: {}", line))?,
    )
    .map_err(|e| anyhow::anyhow!("failed to parse public key: {}", e))?;
    Ok(key)
}

/// `SHA256:<base64>` fingerprint, as printed by `ssh-keygen -l`.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

pub fn algorithm_name(key: &PublicKey) -> String {
    key.algorithm().as_str().to_string()
}
