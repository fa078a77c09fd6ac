//! Single-process store.
//!
//! Suitable for one server process or for tests. Every operation runs under
//! one lock, so attach/detach and the online-set update are never observed
//! half done.

use super::{Attached, Detached, PresenceStore, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty sets currently held.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        // No operation can leave the map inconsistent mid-way, so a poisoned
        // lock is still safe to use.
        self.sets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn attach(
        &self,
        entry_key: &str,
        online_key: &str,
        member: &str,
        connection: &str,
    ) -> Result<Attached, StoreError> {
        let mut sets = self.lock();

        let entry = sets.entry(entry_key.to_string()).or_default();
        let added = entry.insert(connection.to_string());
        let size = entry.len();

        sets.entry(online_key.to_string())
            .or_default()
            .insert(member.to_string());

        Ok(Attached { added, size })
    }

    async fn detach(
        &self,
        entry_key: &str,
        online_key: &str,
        member: &str,
        connection: &str,
    ) -> Result<Detached, StoreError> {
        let mut sets = self.lock();

        let (removed, remaining) = match sets.get_mut(entry_key) {
            Some(entry) => (entry.remove(connection), entry.len()),
            None => (false, 0),
        };

        if remaining == 0 {
            sets.remove(entry_key);
            if let Some(online) = sets.get_mut(online_key) {
                online.remove(member);
                if online.is_empty() {
                    sets.remove(online_key);
                }
            }
        }

        Ok(Detached { removed, remaining })
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .get(key)
            .is_some_and(|set| set.contains(member)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
