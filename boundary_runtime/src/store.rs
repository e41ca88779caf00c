//! Key-value backends.
//!
//! Values are UTF-8 JSON strings. Every write is all-or-nothing per
//! key: a failed `set_raw` leaves the previous value in place.
//!
//! Quota accounting counts key plus value bytes, the way browser
//! local storage does.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

pub trait KvStore: Send {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_raw(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Check the backend can be reached at all.
    fn probe(&self) -> Result<(), StorageError> {
        self.keys().map(|_| ())
    }
}

impl<S: KvStore + ?Sized> KvStore for Box<S> {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get_raw(key)
    }
    fn set_raw(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set_raw(key, value)
    }
    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
    fn keys(&self) -> Result<Vec<String>, StorageError> {
        (**self).keys()
    }
    fn probe(&self) -> Result<(), StorageError> {
        (**self).probe()
    }
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// Reject the write if replacing `previous` with `value` breaks the quota.
fn check_quota(
    quota: Option<usize>,
    used: usize,
    key: &str,
    previous: Option<usize>,
    value: &str,
) -> Result<(), StorageError> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let available = quota.saturating_sub(used - previous.unwrap_or(0));
    let needed = entry_size(key, value);
    if needed > available {
        return Err(StorageError::Exhausted {
            key: key.to_string(),
            needed,
            available,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory store. Used for tests and as the degraded-mode fallback.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            quota: Some(bytes),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.entries.iter().map(|(k, v)| entry_size(k, v)).sum()
    }
}

impl KvStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set_raw(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let previous = self.entries.get(key).map(|v| entry_size(key, v));
        check_quota(self.quota, self.used_bytes(), key, previous, value)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// One `<key>.json` file per key under a directory.
///
/// Writes go to `<key>.json.tmp`, are fsynced, then renamed over the
/// target, so a crash mid-write never leaves a torn value.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    quota: Option<usize>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| unavailable(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            quota: None,
        })
    }

    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::Serialization {
                key: key.to_string(),
                message: "key must be ASCII alphanumeric, '_' or '-'".to_string(),
            });
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    fn used_bytes(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for key in self.keys()? {
            let path = self.path_for(&key)?;
            let len = fs::metadata(&path).map_err(|e| unavailable(&path, e))?.len();
            total += key.len() + len as usize;
        }
        Ok(total)
    }
}

fn unavailable(path: &Path, err: io::Error) -> StorageError {
    StorageError::Unavailable(format!("{}: {}", path.display(), err))
}

impl KvStore for FileStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(StorageError::Serialization {
                key: key.to_string(),
                message: e.to_string(),
            }),
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    fn set_raw(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if self.quota.is_some() {
            let previous = match fs::metadata(&path) {
                Ok(meta) => Some(key.len() + meta.len() as usize),
                Err(_) => None,
            };
            check_quota(self.quota, self.used_bytes()?, key, previous, value)?;
        }

        let tmp = self.dir.join(format!("{key}.json.tmp"));
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            unavailable(&path, e)
        })
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| unavailable(&self.dir, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| unavailable(&self.dir, e))?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
