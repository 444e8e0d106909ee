use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::KeeperError;
use crate::keeper::{Admission, Key, Keeper, Stats};

/// In-process keeper for tests and single-process deployments.
///
/// One lock covers the whole map, so every call is serialized against every
/// other call regardless of key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<Key, Stats>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision `key` with a full quota of `limit`, overwriting any prior record.
    pub fn set(&self, key: impl Into<Key>, limit: u32) {
        let key = key.into();
        tracing::debug!(key = %key, limit, "provisioning key");
        self.lock().insert(key, Stats::full(i64::from(limit)));
    }

    // The critical sections below never panic between read and write, so a
    // poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Stats>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Keeper for MemoryStore {
    async fn allow(&self, key: &Key) -> Result<Admission, KeeperError> {
        let mut data = self.lock();
        let Some(stats) = data.get_mut(key) else {
            tracing::warn!(key = %key, "unknown API key");
            return Err(KeeperError::UnknownKey);
        };

        if stats.is_exhausted() {
            tracing::debug!(key = %key, limit = stats.limit, "limit reached");
            return Ok(Admission::Denied(*stats));
        }

        stats.remaining -= 1;
        tracing::debug!(key = %key, remaining = stats.remaining, limit = stats.limit, "call admitted");
        Ok(Admission::Granted(*stats))
    }

    async fn stats(&self, key: &Key) -> Result<Stats, KeeperError> {
        self.lock().get(key).copied().ok_or(KeeperError::UnknownKey)
    }
}
