//! Loads or generates the long-lived X25519 keypair that is the device's identity with the
//! controller, persisting it atomically under the state directory.
//!
//! Grounded on the teacher's `bin-shared::device_id`: same "read, fall back to generate and
//! persist" shape, same `atomicwrites` + Unix permission-tightening idiom.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use x25519_dalek::{PublicKey, StaticSecret};

const PRIVATE_KEY_FILE: &str = "private_key";

pub struct KeyPair {
    pub private_key: StaticSecret,
    pub public_key: PublicKey,
}

impl KeyPair {
    fn from_secret(private_key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }
}

pub fn key_path(state_dir: &Path) -> PathBuf {
    state_dir.join(PRIVATE_KEY_FILE)
}

/// Builds a keypair from an explicit base64-encoded private key (`--private-key`), bypassing
/// the on-disk store entirely: an operator who hands us a key owns its lifecycle, not us.
pub fn from_base64(encoded: &str) -> Result<KeyPair> {
    let secret = decode_key(encoded).context("--private-key is not a valid private key")?;
    Ok(KeyPair::from_secret(secret))
}

/// Loads the keypair from `<state_dir>/private_key`, generating and persisting a fresh one if
/// absent. Any failure here is **Fatal** (spec §7): the caller should abort startup.
pub fn load_or_create(state_dir: &Path) -> Result<KeyPair> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let path = key_path(state_dir);

    if let Ok(encoded) = std::fs::read_to_string(&path) {
        let secret = decode_key(encoded.trim())
            .with_context(|| format!("failed to parse private key at {}", path.display()))?;
        return Ok(KeyPair::from_secret(secret));
    }

    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    persist(&path, &secret)?;
    Ok(KeyPair::from_secret(secret))
}

fn decode_key(s: &str) -> Result<StaticSecret> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s)
        .context("private key is not valid base64")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("private key is not 32 bytes"))?;
    Ok(StaticSecret::from(bytes))
}

fn persist(path: &Path, secret: &StaticSecret) -> Result<()> {
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(secret.to_bytes());

    let file = atomicwrites::AtomicFile::new(path, atomicwrites::OverwriteBehavior::AllowOverwrite);
    file.write(|f| std::io::Write::write_all(f, encoded.as_bytes()))
        .context("failed to persist private key")?;

    set_key_permissions(path).context("failed to set private key permissions")?;
    tracing::debug!(path = %path.display(), "generated and persisted new private key");
    Ok(())
}

#[cfg(unix)]
fn set_key_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_key_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_key_if_missing() {
        let dir = tempdir().unwrap();
        let created = load_or_create(dir.path()).unwrap();
        let reloaded = load_or_create(dir.path()).unwrap();

        assert_eq!(created.private_key.to_bytes(), reloaded.private_key.to_bytes());
    }

    #[test]
    #[cfg(unix)]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempdir().unwrap();
        load_or_create(dir.path()).unwrap();

        let perms = std::fs::metadata(key_path(dir.path())).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }

    #[test]
    fn does_not_regenerate_existing_key() {
        let dir = tempdir().unwrap();
        let first = load_or_create(dir.path()).unwrap();
        let second = load_or_create(dir.path()).unwrap();
        let third = load_or_create(dir.path()).unwrap();

        assert_eq!(first.private_key.to_bytes(), second.private_key.to_bytes());
        assert_eq!(second.private_key.to_bytes(), third.private_key.to_bytes());
    }
}
