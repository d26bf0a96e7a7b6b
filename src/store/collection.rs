use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::{ConductorError, Result};
use crate::store::StateStore;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    revision: u64,
}

/// Typed, write-through cache of revisioned documents under one key prefix.
///
/// Every id has its own mutex, so updates to one document are serialized while
/// different documents proceed in parallel. An update runs against a copy of
/// the value and is committed in memory only after the conditional write to the
/// store succeeds; a failing closure or a lost write leaves the document
/// untouched. Entries are never removed.
pub struct Collection<T> {
    store: Arc<dyn StateStore>,
    prefix: String,
    entries: RwLock<HashMap<String, Arc<Mutex<Entry<T>>>>>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Replace the cache with what the store currently holds.
    pub async fn load_all(&self) -> Result<usize> {
        let docs = self.store.load_prefix(&self.prefix).await?;
        let mut loaded = HashMap::with_capacity(docs.len());
        for (key, doc) in docs {
            let id = key[self.prefix.len()..].to_string();
            let value: T = serde_json::from_str(&doc.body)?;
            loaded.insert(
                id,
                Arc::new(Mutex::new(Entry {
                    value,
                    revision: doc.revision,
                })),
            );
        }
        let count = loaded.len();
        *self.entries.write().await = loaded;
        Ok(count)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        let entry = self.entries.read().await.get(id).cloned()?;
        let guard = entry.lock().await;
        Some(guard.value.clone())
    }

    /// Ids in ascending order.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn values(&self) -> Vec<T> {
        let mut values = Vec::new();
        for id in self.ids().await {
            if let Some(value) = self.get(&id).await {
                values.push(value);
            }
        }
        values
    }

    /// Insert a new document. Fails with `StoreConflict` if the id already exists.
    pub async fn insert(&self, id: &str, value: T) -> Result<()> {
        let mut entries = self.entries.write().await;
        let key = self.key(id);
        if entries.contains_key(id) {
            return Err(ConductorError::StoreConflict { key, expected: 0 });
        }
        let body = serde_json::to_string(&value)?;
        let revision = self
            .store
            .compare_and_put(&key, 0, body)
            .await?
            .ok_or(ConductorError::StoreConflict { key, expected: 0 })?;
        entries.insert(
            id.to_string(),
            Arc::new(Mutex::new(Entry { value, revision })),
        );
        Ok(())
    }

    /// Make sure a document exists, creating it with `init` if needed.
    pub async fn ensure(&self, id: &str, init: impl FnOnce() -> T) -> Result<()> {
        if self.contains(id).await {
            return Ok(());
        }
        let key = self.key(id);
        if let Some(doc) = self.store.load(&key).await? {
            let value: T = serde_json::from_str(&doc.body)?;
            self.entries.write().await.entry(id.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(Entry {
                    value,
                    revision: doc.revision,
                }))
            });
            return Ok(());
        }
        let res = self.insert(id, init()).await;
        if matches!(res, Err(ConductorError::StoreConflict { .. })) && self.contains(id).await {
            return Ok(());
        }
        res
    }

    /// Apply `f` to the document `id` and persist the result atomically.
    ///
    /// Returns `Ok(None)` if the id is unknown. If the store refuses the write
    /// (another writer moved the revision), the cached copy is refreshed from
    /// the store and `StoreConflict` is returned.
    pub async fn update<R, F>(&self, id: &str, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut T) -> Result<R>,
    {
        let Some(entry) = self.entries.read().await.get(id).cloned() else {
            return Ok(None);
        };
        let mut guard = entry.lock().await;
        let mut next = guard.value.clone();
        let out = f(&mut next)?;

        let key = self.key(id);
        let body = serde_json::to_string(&next)?;
        match self.store.compare_and_put(&key, guard.revision, body).await? {
            Some(revision) => {
                guard.value = next;
                guard.revision = revision;
                Ok(Some(out))
            }
            None => {
                let expected = guard.revision;
                if let Some(doc) = self.store.load(&key).await? {
                    guard.value = serde_json::from_str(&doc.body)?;
                    guard.revision = doc.revision;
                }
                tracing::warn!(key = %key, expected, "Conditional write lost, cache refreshed");
                Err(ConductorError::StoreConflict { key, expected })
            }
        }
    }
}
