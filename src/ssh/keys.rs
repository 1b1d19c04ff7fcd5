use anyhow::{Context, Result};
use russh::keys::ssh_key::EcdsaCurve;
use russh::keys::{Algorithm, HashAlg, PrivateKey};
use std::path::Path;

/// Key algorithm for a generated host key, chosen from the file name
/// (`*ecdsa*` gets NIST P-256, everything else Ed25519).
pub fn algorithm_for_path(path: &Path) -> Algorithm {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.contains("ecdsa") {
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        }
    } else {
        Algorithm::Ed25519
    }
}

/// Load a host key, generating and persisting one if the file does not exist.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        load_host_key(path)
    } else {
        let key = generate_host_key(algorithm_for_path(path))?;
        save_host_key(&key, path)?;
        tracing::info!(
            path = %path.display(),
            fingerprint = %host_key_fingerprint(&key),
            "Generated new host key"
        );
        Ok(key)
    }
}

pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading host key: {}", path.display()))?;
    russh::keys::decode_secret_key(&pem, None)
        .map_err(|e| anyhow::anyhow!("decoding host key {}: {}", path.display(), e))
}

fn generate_host_key(algorithm: Algorithm) -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::rngs::OsRng, algorithm.clone())
        .map_err(|e| anyhow::anyhow!("{} key generation failed: {}", algorithm, e))
}

/// SHA256 fingerprint in the `SHA256:...` form printed by ssh-keygen.
pub fn host_key_fingerprint(key: &PrivateKey) -> String {
    key.public_key().fingerprint(HashAlg::Sha256).to_string()
}

fn save_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory: {}", parent.display()))?;
        }
    }

    let mut buf = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut buf)
        .map_err(|e| anyhow::anyhow!("encoding host key: {}", e))?;

    // Mode is set at creation so the key is never readable by others.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("creating host key file: {}", path.display()))?;
        file.write_all(&buf)
            .with_context(|| format!("writing host key: {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing host key: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, &buf)
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }

    Ok(())
}
