//! Persistence Layer — typed get/set over a `KvStore`.
//!
//! Rules:
//!   - One key per collection plus `receipts` and `session`
//!   - `get` never fails: a missing or corrupt value yields the default
//!   - `set` and `write_batch` return `StorageError`, never panic
//!   - A batch is all-or-nothing: on failure every key already written
//!     is restored to its previous raw value
//!   - An unreachable backend degrades to an in-memory store with a
//!     single pending warning, at open or mid-session

use serde::de::DeserializeOwned;
use serde::Serialize;

use boundary_kernel::receipt::Receipt;
use boundary_kernel::state::{DomainData, SessionState, StateStore};

use crate::error::StorageError;
use crate::store::{KvStore, MemoryStore};

pub mod keys {
    pub const REFLECTIONS: &str = "reflections";
    pub const THREADS: &str = "threads";
    pub const IDENTITY_NODES: &str = "identity_nodes";
    pub const WORLD_POSTS: &str = "world_posts";
    pub const CONSTITUTION: &str = "constitution";
    pub const SETTINGS: &str = "settings";
    pub const RECEIPTS: &str = "receipts";
    pub const SESSION: &str = "session";
}

pub struct Persistence {
    backend: Box<dyn KvStore>,
    degraded: bool,
    warning: Option<String>,
}

impl Persistence {
    /// Wrap `backend`, falling back to memory if it cannot be reached.
    pub fn open(backend: Box<dyn KvStore>) -> Self {
        match backend.probe() {
            Ok(()) => Self {
                backend,
                degraded: false,
                warning: None,
            },
            Err(err) => Self::degraded(err),
        }
    }

    /// In-memory persistence that records why the real store was lost.
    pub fn degraded(reason: StorageError) -> Self {
        let mut p = Self {
            backend: Box::new(MemoryStore::new()),
            degraded: false,
            warning: None,
        };
        p.degrade(MemoryStore::new(), &reason);
        p
    }

    /// Replace a backend lost mid-session with memory holding `baseline`,
    /// the raw value of every key as last known.
    pub fn fall_back_to_memory(
        &mut self,
        reason: &StorageError,
        baseline: &[(&str, String)],
    ) -> Result<(), StorageError> {
        let mut memory = MemoryStore::new();
        for (key, raw) in baseline {
            memory.set_raw(key, raw)?;
        }
        self.degrade(memory, reason);
        Ok(())
    }

    fn degrade(&mut self, memory: MemoryStore, reason: &StorageError) {
        self.backend = Box::new(memory);
        if self.degraded {
            return;
        }
        tracing::warn!(error = %reason, "Storage unavailable, continuing in memory only");
        self.degraded = true;
        self.warning = Some(format!(
            "Your data is not being saved on this device ({reason}). Export before closing."
        ));
    }

    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryStore::new()))
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The degraded-mode warning, handed out exactly once.
    pub fn take_warning(&mut self) -> Option<String> {
        self.warning.take()
    }

    /// Typed read with fallback. Missing keys, corrupt values and read
    /// errors all yield `default`; the latter two are logged.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.try_get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                tracing::warn!(key, error = %err, "Falling back to default value");
                default
            }
        }
    }

    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.backend.get_raw(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Serialization {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = encode(key, value)?;
        self.backend.set_raw(key, &raw)
    }

    pub fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.backend.remove(key)
    }

    /// Write every `(key, raw)` pair in order, or none of them.
    pub fn write_batch(&mut self, writes: &[(&str, String)]) -> Result<(), StorageError> {
        let mut touched: Vec<(&str, Option<String>)> = Vec::new();
        for (key, raw) in writes {
            let previous = match self.backend.get_raw(key) {
                Ok(previous) => previous,
                Err(err) => {
                    self.roll_back(touched);
                    return Err(err);
                }
            };
            if let Err(err) = self.backend.set_raw(key, raw) {
                tracing::warn!(key, error = %err, "Batch write failed, rolling back");
                self.roll_back(touched);
                return Err(err);
            }
            touched.push((*key, previous));
        }
        Ok(())
    }

    /// Restore the keys a failed batch touched, newest first.
    fn roll_back(&mut self, touched: Vec<(&str, Option<String>)>) {
        for (key, previous) in touched.into_iter().rev() {
            let restored = match &previous {
                Some(raw) => self.backend.set_raw(key, raw),
                None => self.backend.remove(key),
            };
            if let Err(err) = restored {
                tracing::error!(key, error = %err, "Rollback could not restore key");
            }
        }
    }

    /// Rebuild the State Store from the persisted keys.
    pub fn load_state(&self) -> StateStore {
        let data = DomainData {
            reflections: self.get(keys::REFLECTIONS, Vec::new()),
            threads: self.get(keys::THREADS, Vec::new()),
            identity_nodes: self.get(keys::IDENTITY_NODES, Vec::new()),
            world_posts: self.get(keys::WORLD_POSTS, Vec::new()),
            constitution: self.get(keys::CONSTITUTION, Default::default()),
            settings: self.get(keys::SETTINGS, Default::default()),
        };
        let session: SessionState = self.get(keys::SESSION, SessionState::default());
        StateStore::new(session, data)
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Raw value of every key for `store` and the ledger `receipts`.
pub fn snapshot(
    store: &StateStore,
    receipts: &[Receipt],
) -> Result<Vec<(&'static str, String)>, StorageError> {
    let data = &store.data;
    Ok(vec![
        (keys::RECEIPTS, encode(keys::RECEIPTS, receipts)?),
        (keys::REFLECTIONS, encode(keys::REFLECTIONS, &data.reflections)?),
        (keys::THREADS, encode(keys::THREADS, &data.threads)?),
        (keys::IDENTITY_NODES, encode(keys::IDENTITY_NODES, &data.identity_nodes)?),
        (keys::WORLD_POSTS, encode(keys::WORLD_POSTS, &data.world_posts)?),
        (keys::CONSTITUTION, encode(keys::CONSTITUTION, &data.constitution)?),
        (keys::SETTINGS, encode(keys::SETTINGS, &data.settings)?),
        (keys::SESSION, encode(keys::SESSION, &store.session)?),
    ])
}

/// Raw writes for every key whose value differs between the two stores.
pub fn changed_keys(
    before: &StateStore,
    after: &StateStore,
) -> Result<Vec<(&'static str, String)>, StorageError> {
    let (b, a) = (&before.data, &after.data);
    let mut writes = Vec::new();
    if b.reflections != a.reflections {
        writes.push((keys::REFLECTIONS, encode(keys::REFLECTIONS, &a.reflections)?));
    }
    if b.threads != a.threads {
        writes.push((keys::THREADS, encode(keys::THREADS, &a.threads)?));
    }
    if b.identity_nodes != a.identity_nodes {
        writes.push((keys::IDENTITY_NODES, encode(keys::IDENTITY_NODES, &a.identity_nodes)?));
    }
    if b.world_posts != a.world_posts {
        writes.push((keys::WORLD_POSTS, encode(keys::WORLD_POSTS, &a.world_posts)?));
    }
    if b.constitution != a.constitution {
        writes.push((keys::CONSTITUTION, encode(keys::CONSTITUTION, &a.constitution)?));
    }
    if b.settings != a.settings {
        writes.push((keys::SETTINGS, encode(keys::SETTINGS, &a.settings)?));
    }
    if before.session != after.session {
        writes.push((keys::SESSION, encode(keys::SESSION, &after.session)?));
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use boundary_kernel::domain::{Layer, UserSettings};

    /// Fails every write to one key.
    struct FailOn {
        inner: MemoryStore,
        key: &'static str,
    }

    impl KvStore for FailOn {
        fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_raw(key)
        }
        fn set_raw(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == self.key {
                return Err(StorageError::Exhausted {
                    key: key.to_string(),
                    needed: value.len(),
                    available: 0,
                });
            }
            self.inner.set_raw(key, value)
        }
        fn remove(&mut self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
        fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.inner.keys()
        }
    }

    struct Unreachable;

    impl KvStore for Unreachable {
        fn get_raw(&self, _: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("offline".into()))
        }
        fn set_raw(&mut self, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("offline".into()))
        }
        fn remove(&mut self, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("offline".into()))
        }
        fn keys(&self) -> Result<Vec<String>, StorageError> {
            Err(StorageError::Unavailable("offline".into()))
        }
    }

    #[test]
    fn corrupt_value_falls_back_to_default() {
        let mut backend = MemoryStore::new();
        backend.set_raw(keys::SETTINGS, "{not json").unwrap();
        let p = Persistence::open(Box::new(backend));
        let settings: UserSettings = p.get(keys::SETTINGS, UserSettings::default());
        assert_eq!(settings, UserSettings::default());
        assert!(matches!(
            p.try_get::<UserSettings>(keys::SETTINGS),
            Err(StorageError::Serialization { .. })
        ));
    }

    #[test]
    fn failed_batch_restores_earlier_keys() {
        let mut inner = MemoryStore::new();
        inner.set_raw(keys::THREADS, "[]").unwrap();
        let mut p = Persistence::open(Box::new(FailOn { inner, key: keys::REFLECTIONS }));

        let err = p
            .write_batch(&[
                (keys::THREADS, "[1]".into()),
                (keys::SETTINGS, "{}".into()),
                (keys::REFLECTIONS, "[2]".into()),
            ])
            .unwrap_err();
        assert!(matches!(err, StorageError::Exhausted { .. }));
        assert_eq!(p.backend.get_raw(keys::THREADS).unwrap().as_deref(), Some("[]"));
        assert_eq!(p.backend.get_raw(keys::SETTINGS).unwrap(), None);
    }

    #[test]
    fn fallback_memory_starts_from_baseline_and_warns_once() {
        let mut p = Persistence::in_memory();
        let mut store = StateStore::default();
        store.session.layer = Layer::Builder;
        let baseline = snapshot(&store, &[]).unwrap();

        let lost = StorageError::Unavailable("disk gone".into());
        p.fall_back_to_memory(&lost, &baseline).unwrap();
        assert!(p.is_degraded());
        assert_eq!(p.load_state(), store);
        assert!(p.take_warning().unwrap().contains("disk gone"));

        p.fall_back_to_memory(&lost, &baseline).unwrap();
        assert!(p.take_warning().is_none());
    }

    #[test]
    fn unreachable_backend_degrades_once() {
        let mut p = Persistence::open(Box::new(Unreachable));
        assert!(p.is_degraded());
        assert!(p.take_warning().is_some());
        assert!(p.take_warning().is_none());
        p.set(keys::SETTINGS, &UserSettings::default()).unwrap();
        assert!(p.try_get::<UserSettings>(keys::SETTINGS).unwrap().is_some());
    }

    #[test]
    fn state_round_trips_through_changed_keys() {
        let before = StateStore::default();
        let mut after = before.clone();
        after.session.layer = Layer::Builder;
        after.data.settings.auto_archive = true;

        let writes = changed_keys(&before, &after).unwrap();
        let written: Vec<&str> = writes.iter().map(|(k, _)| *k).collect();
        assert_eq!(written, vec![keys::SETTINGS, keys::SESSION]);

        let mut p = Persistence::in_memory();
        p.write_batch(&writes).unwrap();
        assert_eq!(p.load_state(), after);
        assert!(changed_keys(&after, &after).unwrap().is_empty());
    }
}
