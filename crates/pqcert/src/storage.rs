//! Key-value storage for challenge and certificate records
//!
//! Records are opaque byte blobs addressed by `/`-separated keys such as
//! `challenges/<id>` or `certs/<id>`. Every backend writes a record as a
//! single atomic operation, so readers never observe a half-written value.
//!
//! # Directory Structure
//!
//! ```text
//! data-dir/                 (0700)
//! ├── challenges/
//! │   └── <challenge-id>    (0600, JSON)
//! └── certs/
//!     └── <certificate-id>  (0600, JSON)
//! ```

use std::fmt::Debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::error::StorageError;

/// Byte-oriented key-value store with atomic single-key writes
pub trait KvStore: Send + Sync + Debug {
    /// Insert or replace the value at `key`
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Value at `key`, if present
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete `key`. Returns whether this call removed it.
    fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Keys starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Store `value` as JSON under `key`
pub fn put_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(key, &bytes)
}

/// Load and decode the JSON value under `key`
pub fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Reject keys that could escape the store root or collide with temp files
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && !segment.starts_with('.')
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        });

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Split a list prefix into its directory part and the file-name prefix
fn split_prefix(prefix: &str) -> (&str, &str) {
    match prefix.rfind('/') {
        Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
        None => ("", prefix),
    }
}

// =========================================================================
// Filesystem backend
// =========================================================================

/// One file per key below a root directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`
    ///
    /// The root directory is restricted to the owner (0700 on Unix).
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        create_private_dir(root)?;

        info!(storage_path = %root.display(), "Initialized record storage");

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }
}

impl KvStore for FsStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        create_private_dir(&dir)?;
        write_atomic(&path, value, 0o600)?;
        trace!(key = %key, bytes = value.len(), "Stored record");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(key = %key, "Removed record");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let (dir, name_prefix) = split_prefix(prefix);
        let dir_path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir)?
        };

        let entries = match fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(dir_path, e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir_path, e))?;
            let file_type = entry.file_type().map_err(|e| StorageError::io(entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // In-flight temp files
            if name.starts_with('.') || !name.starts_with(name_prefix) {
                continue;
            }
            keys.push(if dir.is_empty() {
                name
            } else {
                format!("{}/{}", dir, name)
            });
        }

        keys.sort();
        Ok(keys)
    }
}

/// Create `dir` and its parents, restricting `dir` to the owner
pub(crate) fn create_private_dir(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| StorageError::io(dir, e))?;
    }

    Ok(())
}

/// Write `contents` to a temp file next to `path`, fsync, then rename over it
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or(Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| StorageError::io(dir, e))?;

    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StorageError::io(tmp.path(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
            .map_err(|e| StorageError::io(tmp.path(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}

// =========================================================================
// In-memory backend
// =========================================================================

/// `DashMap`-backed store; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.entries.remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let (dir, name_prefix) = split_prefix(prefix);
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| {
                let (k_dir, k_name) = split_prefix(k);
                k_dir == dir && k_name.starts_with(name_prefix)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}
