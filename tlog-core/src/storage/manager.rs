//! Uniform get/set/remove over both storage areas
//!
//! Every write lands in an in-memory fallback first, then in the backing area
//! when one is available. Keys whose last write missed the area are read from
//! the mirror; everything else prefers the area. A failed durable write
//! therefore still reads back in this process, old area value or not.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

use super::area::StorageArea;
use super::{is_essential_key, is_recovery_key, KEY_PREFIX};

/// Which area a key lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Shared across tabs, survives reloads
    Durable,
    /// Scoped to the current tab
    Session,
}

/// In-memory copy of one area
#[derive(Debug, Default)]
struct Mirror {
    values: HashMap<String, String>,
    /// Keys whose last write did not reach the backing area
    unsynced: HashSet<String>,
}

/// Storage facade that never fails its caller
pub struct StorageManager {
    durable: Option<Box<dyn StorageArea>>,
    session: Option<Box<dyn StorageArea>>,
    fallback: Mutex<HashMap<StorageKind, Mirror>>,
}

impl StorageManager {
    /// Both areas are optional; a missing area runs on the fallback alone.
    pub fn new(
        durable: Option<Box<dyn StorageArea>>,
        session: Option<Box<dyn StorageArea>>,
    ) -> Self {
        Self {
            durable,
            session,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    /// Manager with no backing areas at all
    pub fn in_memory() -> Self {
        Self::new(None, None)
    }

    fn area(&self, kind: StorageKind) -> Option<&dyn StorageArea> {
        match kind {
            StorageKind::Durable => self.durable.as_deref(),
            StorageKind::Session => self.session.as_deref(),
        }
    }

    /// Whether `kind` has a real backing area
    pub fn is_available(&self, kind: StorageKind) -> bool {
        self.area(kind).is_some()
    }

    fn with_fallback<R>(
        &self,
        kind: StorageKind,
        f: impl FnOnce(&mut Mirror) -> R,
    ) -> R {
        let mut fallback = self
            .fallback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(fallback.entry(kind).or_default())
    }

    pub fn get(&self, kind: StorageKind, key: &str) -> Option<String> {
        let unsynced = self.with_fallback(kind, |m| m.unsynced.contains(key));
        if unsynced {
            return self.with_fallback(kind, |m| m.values.get(key).cloned());
        }

        if let Some(area) = self.area(kind) {
            match area.get(key) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key, error = %e, "Storage read failed, using fallback");
                }
            }
        }

        self.with_fallback(kind, |m| m.values.get(key).cloned())
    }

    /// Write `value`; returns false if only the fallback holds it.
    pub fn set(&self, kind: StorageKind, key: &str, value: &str) -> bool {
        self.with_fallback(kind, |m| m.values.insert(key.to_string(), value.to_string()));

        let Some(area) = self.area(kind) else {
            return false;
        };

        let stored = self.write_through(kind, area, key, value);
        self.with_fallback(kind, |m| {
            if stored {
                m.unsynced.remove(key);
            } else {
                m.unsynced.insert(key.to_string());
            }
        });
        stored
    }

    fn write_through(
        &self,
        kind: StorageKind,
        area: &dyn StorageArea,
        key: &str,
        value: &str,
    ) -> bool {
        match area.set(key, value) {
            Ok(()) => true,
            Err(Error::QuotaExceeded { .. }) => {
                let freed = self.cleanup(kind, area, key);
                tracing::warn!(key, freed, "Storage quota exceeded, retrying after cleanup");

                match area.set(key, value) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(key, error = %e, "Storage write failed after cleanup, value kept in memory only");
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Storage write failed, value kept in memory only");
                false
            }
        }
    }

    pub fn remove(&self, kind: StorageKind, key: &str) {
        self.with_fallback(kind, |m| {
            m.values.remove(key);
            m.unsynced.remove(key);
        });

        if let Some(area) = self.area(kind) {
            if let Err(e) = area.remove(key) {
                tracing::warn!(key, error = %e, "Storage remove failed");
            }
        }
    }

    /// Read and decode a JSON value; undecodable values read as `None`.
    pub fn get_json<T: DeserializeOwned>(&self, kind: StorageKind, key: &str) -> Option<T> {
        let raw = self.get(kind, key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "Stored value is not valid JSON");
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, kind: StorageKind, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(kind, key, &raw),
            Err(e) => {
                tracing::error!(key, error = %e, "Failed to encode value for storage");
                false
            }
        }
    }

    /// Free space for `writing_key`. Recovery payloads go first; other
    /// non-essential tlog keys only if no payload could be dropped.
    /// Returns the number of keys deleted.
    fn cleanup(&self, kind: StorageKind, area: &dyn StorageArea, writing_key: &str) -> usize {
        let keys = match area.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list keys for quota cleanup");
                return 0;
            }
        };

        // Evicted keys leave the mirror too, or they would read back
        let remove_all = |victims: Vec<&String>| {
            let mut removed = 0;
            for key in victims {
                if area.remove(key).is_ok() {
                    self.with_fallback(kind, |m| {
                        m.values.remove(key.as_str());
                        m.unsynced.remove(key.as_str());
                    });
                    removed += 1;
                }
            }
            removed
        };

        let freed = remove_all(
            keys.iter()
                .filter(|k| is_recovery_key(k) && k.as_str() != writing_key)
                .collect(),
        );
        if freed > 0 {
            return freed;
        }

        remove_all(
            keys.iter()
                .filter(|k| {
                    k.starts_with(KEY_PREFIX) && !is_essential_key(k) && k.as_str() != writing_key
                })
                .collect(),
        )
    }
}
