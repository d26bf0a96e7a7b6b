use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{LockRecord, LockStore, StateStore, Versioned};

/// In-process store. Every operation holds one mutex, which makes each
/// conditional write atomic with respect to concurrent callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    locks: Mutex<HashMap<String, LockRecord>>,
    docs: Mutex<BTreeMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().await;
        let free = match locks.get(name) {
            None => true,
            Some(row) => row.owner.is_none() || row.expires_at < now,
        };
        if free {
            locks.insert(
                name.to_string(),
                LockRecord {
                    name: name.to_string(),
                    owner: Some(owner.to_string()),
                    expires_at,
                },
            );
        }
        Ok(free)
    }

    async fn renew(
        &self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(name) {
            Some(row) if row.owner.as_deref() == Some(owner) => {
                row.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(name) {
            Some(row) if row.owner.as_deref() == Some(owner) => {
                row.owner = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.locks.lock().await.get(name).cloned())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.docs.lock().await.get(key).cloned())
    }

    async fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let docs = self.docs.lock().await;
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: u64,
        body: String,
    ) -> Result<Option<u64>, StoreError> {
        let mut docs = self.docs.lock().await;
        let current = docs.get(key).map(|v| v.revision).unwrap_or(0);
        if current != expected {
            return Ok(None);
        }
        let revision = expected + 1;
        docs.insert(key.to_string(), Versioned { revision, body });
        Ok(Some(revision))
    }
}
