//! Storage area trait and the in-memory area

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// One key/value storage area
///
/// Implementations report failures as errors; [`super::StorageManager`]
/// is responsible for absorbing them.
pub trait StorageArea: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Fails with [`Error::QuotaExceeded`] when the value does not fit.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;
}

/// Process-local area, optionally bounded by a byte quota
#[derive(Debug, Default)]
pub struct MemoryArea {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Area that rejects writes once keys + values exceed `quota_bytes`
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory area lock poisoned".to_string()))
    }
}

impl StorageArea for MemoryArea {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.lock()?;

        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if (used + key.len() + value.len()) as u64 > quota {
                return Err(Error::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}
