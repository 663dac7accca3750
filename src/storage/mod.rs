/**
 * Storage Module - replicated extension settings
 *
 * Handles:
 * - SQLite-backed key/value scopes (sync, local, managed)
 * - Default filling on every read
 * - Change events with old/new values per key
 * - Serialized read-modify-write updates
 * - Sync scope migrations
 */

pub mod items;
pub mod migrations;
mod schema;

pub use items::*;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Old and new value of one changed key. `None` means absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// All keys changed by a single write to one area
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChangeEvent {
    pub area: StorageArea,
    pub changes: BTreeMap<String, StorageChange>,
}

impl StorageChangeEvent {
    /// New value of `key` if this event set it
    pub fn new_value(&self, key: &str) -> Option<&Value> {
        self.changes.get(key).and_then(|c| c.new_value.as_ref())
    }
}

/// Keys to write and keys to delete, applied in one transaction
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    pub set: Map<String, Value>,
    pub remove: Vec<String>,
}

impl Mutation {
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.remove.retain(|k| k != &key);
        self.set.insert(key, value);
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.set.remove(&key);
        if !self.remove.contains(&key) {
            self.remove.push(key);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

struct StorageInner {
    pool: SqlitePool,
    // Held across every read-modify-write so concurrent appends never lose updates
    write_lock: Mutex<()>,
    changes: broadcast::Sender<StorageChangeEvent>,
}

/// Handle to the settings database. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Open (or create) the settings database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        log::info!("Opened settings database at: {:?}", path);

        Self::from_pool(pool).await
    }

    /// Private in-memory database, used by tests and ephemeral hosts
    pub async fn in_memory() -> Result<Self> {
        // A single connection that never expires keeps the memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(schema::CREATE_TABLES).execute(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(StorageInner {
                pool,
                write_lock: Mutex::new(()),
                changes,
            }),
        })
    }

    /// Subscribe to change events of every area
    pub fn subscribe(&self) -> broadcast::Receiver<StorageChangeEvent> {
        self.inner.changes.subscribe()
    }

    /// Read an area with absent keys filled from the defaults
    pub async fn get(&self, area: StorageArea) -> Result<StorageItems> {
        StorageItems::from_stored(self.get_raw(area).await?)
    }

    /// Read a single key, falling back to its default
    pub async fn get_item(&self, area: StorageArea, key: &str) -> Result<Value> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM storage_items WHERE area = ? AND key = ?",
        )
        .bind(area.as_str())
        .bind(key)
        .fetch_optional(&self.inner.pool)
        .await?;

        match value {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(StorageItems::default_map()
                .remove(key)
                .unwrap_or(Value::Null)),
        }
    }

    /// Only the keys actually stored in an area, without defaults
    pub async fn get_raw(&self, area: StorageArea) -> Result<Map<String, Value>> {
        let rows = sqlx::query("SELECT key, value FROM storage_items WHERE area = ?")
            .bind(area.as_str())
            .fetch_all(&self.inner.pool)
            .await?;

        let mut items = Map::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            match serde_json::from_str(&value) {
                Ok(value) => {
                    items.insert(key, value);
                }
                Err(e) => log::warn!("Ignoring unreadable {} item {}: {}", area.as_str(), key, e),
            }
        }

        Ok(items)
    }

    /// Write a partial set of items
    pub async fn set(&self, area: StorageArea, items: Map<String, Value>) -> Result<()> {
        Self::ensure_writable(area)?;
        let _guard = self.inner.write_lock.lock().await;
        self.apply(area, Mutation { set: items, remove: Vec::new() }).await
    }

    pub async fn set_item(&self, area: StorageArea, key: &str, value: Value) -> Result<()> {
        let mut items = Map::new();
        items.insert(key.to_string(), value);
        self.set(area, items).await
    }

    pub async fn remove(&self, area: StorageArea, keys: &[&str]) -> Result<()> {
        Self::ensure_writable(area)?;
        let _guard = self.inner.write_lock.lock().await;
        let remove = keys.iter().map(|k| k.to_string()).collect();
        self.apply(area, Mutation { set: Map::new(), remove }).await
    }

    /// Read-modify-write on the default-filled items. No other write can
    /// interleave between the read and the write.
    pub async fn update<F>(&self, area: StorageArea, f: F) -> Result<()>
    where
        F: FnOnce(&StorageItems) -> Map<String, Value>,
    {
        Self::ensure_writable(area)?;
        let _guard = self.inner.write_lock.lock().await;
        let current = self.get(area).await?;
        let set = f(&current);
        self.apply(area, Mutation { set, remove: Vec::new() }).await
    }

    /// Read-modify-write on the raw stored keys
    pub async fn update_raw<F>(&self, area: StorageArea, f: F) -> Result<()>
    where
        F: FnOnce(&Map<String, Value>) -> Result<Mutation>,
    {
        Self::ensure_writable(area)?;
        let _guard = self.inner.write_lock.lock().await;
        let current = self.get_raw(area).await?;
        let mutation = f(&current)?;
        self.apply(area, mutation).await
    }

    /// Replace the managed scope with an administrator policy snapshot.
    /// Keys missing from the new policy are removed.
    pub async fn apply_managed_policy(&self, policy: Map<String, Value>) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let current = self.get_raw(StorageArea::Managed).await?;
        let remove = current
            .keys()
            .filter(|k| !policy.contains_key(*k))
            .cloned()
            .collect();
        self.apply(StorageArea::Managed, Mutation { set: policy, remove }).await
    }

    fn ensure_writable(area: StorageArea) -> Result<()> {
        if area == StorageArea::Managed {
            bail!("The managed storage area is read-only");
        }
        Ok(())
    }

    // Callers hold `write_lock`
    async fn apply(&self, area: StorageArea, mutation: Mutation) -> Result<()> {
        if mutation.is_empty() {
            return Ok(());
        }

        let previous = self.get_raw(area).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut changes = BTreeMap::new();

        let mut tx = self.inner.pool.begin().await?;

        for (key, value) in &mutation.set {
            let old_value = previous.get(key).cloned();
            if old_value.as_ref() == Some(value) {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO storage_items (area, key, value, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(area, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
            )
            .bind(area.as_str())
            .bind(key)
            .bind(serde_json::to_string(value)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            changes.insert(
                key.clone(),
                StorageChange {
                    old_value,
                    new_value: Some(value.clone()),
                },
            );
        }

        for key in &mutation.remove {
            let Some(old_value) = previous.get(key).cloned() else {
                continue;
            };

            sqlx::query("DELETE FROM storage_items WHERE area = ? AND key = ?")
                .bind(area.as_str())
                .bind(key)
                .execute(&mut *tx)
                .await?;

            changes.insert(
                key.clone(),
                StorageChange {
                    old_value: Some(old_value),
                    new_value: None,
                },
            );
        }

        tx.commit().await?;

        if changes.is_empty() {
            return Ok(());
        }

        log::debug!(
            "Storage {} changed: {:?}",
            area.as_str(),
            changes.keys().collect::<Vec<_>>()
        );

        // No subscribers is fine
        let _ = self.inner.changes.send(StorageChangeEvent { area, changes });

        Ok(())
    }
}
