//! Key-value state persisted in the `settings` table.
//!
//! Values are JSON documents, so callers can store lists and structs under
//! a single key.

use anyhow::Context;
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::DbPool;

pub const KEY_BACKUP_HISTORY: &str = "backup_history";
pub const KEY_RESTORE_HISTORY: &str = "restore_history";
pub const KEY_CONFIG_HASH: &str = "last_config_hash";

#[derive(Clone)]
pub struct KvStore {
    pool: DbPool,
}

impl KvStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_raw(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get_raw(key)? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt value stored under '{key}'"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        self.set_raw(key, &serde_json::to_string(value)?)
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Read-modify-write of one key inside a transaction.
    pub fn update<T, F>(&self, key: &str, f: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        // Leave a corrupt value in place rather than overwrite it.
        let mut value: T = match current {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt value stored under '{key}'"))?,
            None => T::default(),
        };
        f(&mut value);
        tx.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(&value)?],
        )?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (KvStore, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = crate::db::create_pool(&dir.path().join("state.db")).unwrap();
    crate::db::migrate::migrate(&pool).unwrap();
    (KvStore::new(pool), dir)
}
