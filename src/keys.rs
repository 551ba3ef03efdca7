//! Host identity key

use anyhow::{Context, Result};
use russh::keys::{Algorithm, PrivateKey};
use std::path::Path;
use tracing::info;

/// Load the host key at `path`, or create a fresh Ed25519 key there.
pub fn load_or_create(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)
            .with_context(|| format!("reading host key: {}", path.display()))?;
        let key = russh::keys::decode_secret_key(&encoded, None)
            .map_err(|e| anyhow::anyhow!("decoding host key {}: {}", path.display(), e))?;
        info!("Host key loaded from {}", path.display());
        return Ok(key);
    }

    let key = generate()?;
    store(&key, path)?;
    info!("Generated new host key at {}", path.display());
    Ok(key)
}

pub fn generate() -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| anyhow::anyhow!("host key generation failed: {}", e))
}

fn store(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory: {}", dir.display()))?;
        }
    }

    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut pem)
        .map_err(|e| anyhow::anyhow!("encoding host key: {}", e))?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    use std::io::Write;
    let mut file = options
        .open(path)
        .with_context(|| format!("creating host key file: {}", path.display()))?;
    file.write_all(&pem)
        .with_context(|| format!("writing host key: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_key_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host.key");

        let first = load_or_create(&path).unwrap();
        assert!(path.exists());
        let second = load_or_create(&path).unwrap();
        assert_eq!(
            first.public_key().to_openssh().unwrap(),
            second.public_key().to_openssh().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.key");
        load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_garbage_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.key");
        std::fs::write(&path, "not a key").unwrap();
        assert!(load_or_create(&path).is_err());
    }
}
