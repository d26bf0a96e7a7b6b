//! Persistent shared store.
//!
//! Two kinds of records live here:
//! - **Lock rows** (`{name, owner, expiresAt}`), mutated only by compare-and-set
//!   through [`LockStore`].
//! - **State documents** (queues, machines, requests), stored as JSON with a
//!   monotonically increasing `revision` and written only through
//!   [`StateStore::compare_and_put`], so a write computed from an outdated read
//!   is refused instead of silently overwriting newer state.
//!
//! Backends: [`MemoryStore`] for tests and single-process runs, [`SqliteStore`]
//! for workers sharing a database file.

pub mod collection;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use collection::Collection;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A named lease row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub name: String,
    /// `None` once released
    pub owner: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.owner.is_some() && self.expires_at >= now
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `owner` and `expires_at` if the row is absent, released, or expired at `now`.
    /// Returns whether the write happened.
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Extend the lease only if `owner` still holds the row.
    async fn renew(
        &self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clear the owner if `owner` still holds the row.
    async fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError>;

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError>;
}

/// A JSON document and the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub revision: u64,
    pub body: String,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    async fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError>;

    /// Write `body` if the stored revision equals `expected` (0 means "absent").
    /// Returns the new revision, or `None` when the condition failed.
    async fn compare_and_put(
        &self,
        key: &str,
        expected: u64,
        body: String,
    ) -> Result<Option<u64>, StoreError>;
}
