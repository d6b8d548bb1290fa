//! Local credential cache.
//!
//! Private keys are written to `<root>/<namespace>/<device>.pem` exactly once.
//! Creation is atomic (`create_new`), the file is owner-read-only, and an
//! existing file is never rewritten, even when the record's key has changed.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use deadend_core::DeviceKey;
use tracing::{debug, info};

use crate::{InventoryError, Result};

/// Permission bits of a cached key.
pub const KEY_FILE_MODE: u32 = 0o400;

/// Write-once store of device private keys.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    root: PathBuf,
}

impl CredentialCache {
    /// Cache rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the cache.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the key file for `key`.
    #[must_use]
    pub fn key_path(&self, key: &DeviceKey) -> PathBuf {
        self.root
            .join(key.namespace())
            .join(format!("{}.pem", key.name()))
    }

    /// Write `pem` for `key` unless a key file already exists.
    ///
    /// Returns the path of the key file and whether it was created now.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn ensure_key(&self, key: &DeviceKey, pem: &str) -> Result<(PathBuf, bool)> {
        let path = self.key_path(key);
        let io_err = |source| InventoryError::CredentialFile {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(KEY_FILE_MODE)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(device = %key, path = %path.display(), "Key file already cached");
                return Ok((path, false));
            }
            Err(e) => return Err(io_err(e)),
        };

        file.write_all(pem.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::set_permissions(&path, Permissions::from_mode(KEY_FILE_MODE)).map_err(io_err)?;

        info!(device = %key, path = %path.display(), "Cached device key");
        Ok((path, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::new("fleet-a", "cam-01").unwrap()
    }

    #[test]
    fn key_path_layout() {
        let cache = CredentialCache::new("inv");
        assert_eq!(cache.key_path(&key()), PathBuf::from("inv/fleet-a/cam-01.pem"));
    }

    #[test]
    fn key_is_written_owner_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path());

        let (path, created) = cache.ensure_key(&key(), "-----BEGIN KEY-----\n").unwrap();

        assert!(created);
        assert_eq!(fs::read_to_string(&path).unwrap(), "-----BEGIN KEY-----\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, KEY_FILE_MODE);
    }

    #[test]
    fn second_write_leaves_the_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path());

        let (first, _) = cache.ensure_key(&key(), "original").unwrap();
        let before = fs::metadata(&first).unwrap();
        let (second, created) = cache.ensure_key(&key(), "rotated").unwrap();

        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&second).unwrap(), "original");
        let after = fs::metadata(&second).unwrap();
        assert_eq!(after.permissions().mode(), before.permissions().mode());
        assert_eq!(after.modified().unwrap(), before.modified().unwrap());
    }
}
