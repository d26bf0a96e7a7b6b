use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::store::{LockRecord, LockStore, StateStore, Versioned};

/// SQLite-backed store shared by worker processes that open the same file.
///
/// Each conditional write is a single `UPDATE ... WHERE` / upsert statement, so
/// SQLite's write lock makes it atomic across processes.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn ensure_tables(&self) -> Result<(), StoreError> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS leader_lock (
              name TEXT PRIMARY KEY,
              owner TEXT,
              expires_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS state_doc (
              key TEXT PRIMARY KEY,
              revision INTEGER NOT NULL,
              body TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl SqliteStore {
    /// Run `f` against the connection on the blocking pool, keeping SQLite
    /// I/O and the connection mutex off the async workers.
    async fn run<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl LockStore for SqliteStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (name, owner) = (name.to_string(), owner.to_string());
        self.run(move |conn| {
            let changed = conn.execute(
                r#"
                INSERT INTO leader_lock (name, owner, expires_at_ms) VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE
                  SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
                  WHERE leader_lock.owner IS NULL OR leader_lock.expires_at_ms < ?4
                "#,
                params![
                    name,
                    owner,
                    expires_at.timestamp_millis(),
                    now.timestamp_millis()
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn renew(
        &self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (name, owner) = (name.to_string(), owner.to_string());
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE leader_lock SET expires_at_ms = ?1 WHERE name = ?2 AND owner = ?3",
                params![expires_at.timestamp_millis(), name, owner],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        let (name, owner) = (name.to_string(), owner.to_string());
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE leader_lock SET owner = NULL WHERE name = ?1 AND owner = ?2",
                params![name, owner],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT name, owner, expires_at_ms FROM leader_lock WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(LockRecord {
                            name: row.get(0)?,
                            owner: row.get(1)?,
                            expires_at: from_millis(row.get(2)?),
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            let doc = conn
                .query_row(
                    "SELECT revision, body FROM state_doc WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(Versioned {
                            revision: row.get::<_, i64>(0)? as u64,
                            body: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(doc)
        })
        .await
    }

    async fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let prefix = prefix.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, revision, body FROM state_doc WHERE substr(key, 1, ?1) = ?2 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix.len() as i64, prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Versioned {
                        revision: row.get::<_, i64>(1)? as u64,
                        body: row.get(2)?,
                    },
                ))
            })?;
            let mut docs = Vec::new();
            for row in rows {
                docs.push(row?);
            }
            Ok(docs)
        })
        .await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: u64,
        body: String,
    ) -> Result<Option<u64>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            let now_ms = Utc::now().timestamp_millis();
            let changed = if expected == 0 {
                conn.execute(
                    r#"
                    INSERT INTO state_doc (key, revision, body, updated_at_ms) VALUES (?1, 1, ?2, ?3)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                    params![key, body, now_ms],
                )?
            } else {
                conn.execute(
                    r#"
                    UPDATE state_doc SET revision = revision + 1, body = ?1, updated_at_ms = ?2
                    WHERE key = ?3 AND revision = ?4
                    "#,
                    params![body, now_ms, key, expected as i64],
                )?
            };
            Ok((changed == 1).then_some(expected + 1))
        })
        .await
    }
}
