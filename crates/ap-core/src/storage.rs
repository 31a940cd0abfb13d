use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

/// A whole collection: record id -> record.
pub type Collection = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid collection name: {0}")]
    InvalidCollection(String),
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Persistent key/value collections, loaded and saved whole.
///
/// There is no versioning: callers load, mutate and save back.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load a collection. A collection that was never saved is empty.
    async fn load(&self, collection: &str) -> Result<Collection, StorageError>;

    /// Replace a collection.
    async fn save(&self, collection: &str, records: &Collection) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// In-process storage, used by tests and ephemeral daemons.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, collection: &str) -> Result<Collection, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    async fn save(&self, collection: &str, records: &Collection) -> Result<(), StorageError> {
        let mut collections = self.collections.write().await;
        collections.insert(collection.to_string(), records.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStorage
// ---------------------------------------------------------------------------

/// File-system-backed storage.
///
/// Each collection is a single pretty-printed JSON object stored at
/// `<base_dir>/<collection>.json`. Writes go to a temp file first and are
/// renamed into place so a crash never leaves a half-written collection.
pub struct JsonFileStorage {
    base_dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf, StorageError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidCollection(collection.to_string()));
        }
        Ok(self.base_dir.join(format!("{collection}.json")))
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn load(&self, collection: &str) -> Result<Collection, StorageError> {
        let path = self.collection_path(collection)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(data) if data.trim().is_empty() => Ok(Collection::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Collection::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, collection: &str, records: &Collection) -> Result<(), StorageError> {
        let path = self.collection_path(collection)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let json = serde_json::to_string_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Decode every record of a collection, skipping (and logging) bad ones.
pub async fn load_records<T: DeserializeOwned>(
    storage: &dyn Storage,
    collection: &str,
) -> Result<Vec<(String, T)>, StorageError> {
    let raw = storage.load(collection).await?;
    let mut out = Vec::with_capacity(raw.len());
    for (id, value) in raw {
        match serde_json::from_value::<T>(value) {
            Ok(record) => out.push((id, record)),
            Err(e) => warn!(collection, record_id = %id, error = %e, "skipping undecodable record"),
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Decode one record. Missing records are `Ok(None)`.
pub async fn load_record<T: DeserializeOwned>(
    storage: &dyn Storage,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StorageError> {
    let mut raw = storage.load(collection).await?;
    match raw.remove(id) {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Insert or replace one record (load-mutate-save of the whole collection).
pub async fn save_record<T: Serialize>(
    storage: &dyn Storage,
    collection: &str,
    id: &str,
    record: &T,
) -> Result<(), StorageError> {
    let mut raw = storage.load(collection).await?;
    raw.insert(id.to_string(), serde_json::to_value(record)?);
    storage.save(collection, &raw).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
